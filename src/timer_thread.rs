use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::util::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Paused,
    Stopped,
}

struct TimerState {
    phase: Phase,
    // When set, the loop parks once the running phase has lasted this long.
    pause_deadline: Option<Instant>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Self-correcting periodic scheduler on one dedicated background thread.
///
/// Each cycle measures how long the tick took and sleeps only for the
/// remainder of the interval; a tick that overruns the interval makes the
/// next one fire immediately, with no attempt to catch up missed ticks.
/// States: Idle → Running ⇄ Paused → Stopped.
pub struct IntervalTimer {
    interval: Duration,
    tick: Arc<dyn Fn() + Send + Sync>,
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalTimer {
    pub fn new(interval: Duration, tick: impl Fn() + Send + Sync + 'static) -> Self {
        IntervalTimer {
            interval,
            tick: Arc::new(tick),
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    phase: Phase::Idle,
                    pause_deadline: None,
                }),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts ticking, or resumes if paused. Cancels any scheduled pause.
    /// No-op while already running.
    pub fn start(&self) {
        let mut thread = lock(&self.thread);
        let mut state = lock(&self.shared.state);
        state.pause_deadline = None;

        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Running;
                let shared = Arc::clone(&self.shared);
                let tick = Arc::clone(&self.tick);
                let interval = self.interval;
                *thread = Some(thread::spawn(move || {
                    Self::thread_main_loop(shared, tick, interval)
                }));
            }
            Phase::Paused => {
                state.phase = Phase::Running;
                self.shared.wakeup.notify_all();
            }
            Phase::Running => {
                // Pause cancellation above is the only effect.
                self.shared.wakeup.notify_all();
            }
            Phase::Stopped => {
                log::warn!("timer already stopped, not restarting");
            }
        }
    }

    /// Schedules a transition to Paused once the current running phase has
    /// lasted `delay` more. While paused the loop blocks instead of ticking;
    /// [`start`](Self::start) resumes it.
    pub fn pause_after(&self, delay: Duration) {
        let mut state = lock(&self.shared.state);
        if state.phase == Phase::Stopped {
            return;
        }
        state.pause_deadline = Some(Instant::now() + delay);
        self.shared.wakeup.notify_all();
    }

    /// Signals the loop to exit and joins the thread. An in-flight tick is
    /// allowed to finish. Safe to call from any thread, and more than once.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.phase = Phase::Stopped;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                log::warn!("timer thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(lock(&self.shared.state).phase, Phase::Running | Phase::Paused)
    }

    fn thread_main_loop(
        shared: Arc<TimerShared>,
        tick: Arc<dyn Fn() + Send + Sync>,
        interval: Duration,
    ) {
        loop {
            // Wait until we are due to tick: park while paused, exit when
            // stopped, transition to Paused when a pause deadline has passed.
            {
                let mut state = lock(&shared.state);
                loop {
                    match state.phase {
                        Phase::Stopped => return,
                        Phase::Paused => {
                            state = shared
                                .wakeup
                                .wait(state)
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                        }
                        Phase::Running => {
                            if let Some(deadline) = state.pause_deadline {
                                if Instant::now() >= deadline {
                                    state.phase = Phase::Paused;
                                    state.pause_deadline = None;
                                    log::debug!("sampler paused");
                                    continue;
                                }
                            }
                            break;
                        }
                        Phase::Idle => unreachable!("loop started while idle"),
                    }
                }
            }

            let began = Instant::now();
            tick();

            // Sleep only for what is left of the interval. An overrunning
            // tick means the next cycle starts immediately.
            let deadline = began + interval;
            let mut state = lock(&shared.state);
            loop {
                if state.phase != Phase::Running {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (next, _timed_out) = shared
                    .wakeup
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state = next;
            }
        }
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
