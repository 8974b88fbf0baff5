use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message as _;

use crate::pprof;
use crate::stack_collector::Stacktrace;
use crate::string_table::StringTable;
use crate::thread_context::SpanContext;
use crate::util::{format_span_id, format_trace_id};

pub const TIMESTAMP_LABEL: &str = "source.event.time";
pub const TRACE_ID_LABEL: &str = "trace_id";
pub const SPAN_ID_LABEL: &str = "span_id";
pub const THREAD_ID_LABEL: &str = "thread.id";
pub const EVENT_PERIOD_LABEL: &str = "source.event.period";

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("profile compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("profile payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("profile payload is not a valid profile message: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Builds one pprof profile out of a tick's stacktrace batch.
///
/// Pure function of its inputs: the string/function/location de-duplication
/// tables are local to the call, ids start at 1 in first-seen order, and
/// identical input produces an identical profile across runs.
pub fn encode_cpu_profile(
    stacktraces: &[Stacktrace],
    thread_states: &HashMap<u64, SpanContext>,
    interval_millis: i64,
    time: SystemTime,
) -> pprof::Profile {
    let mut str_table = StringTable::new();
    let mut functions = FunctionTable::new();
    let mut locations = LocationTable::new();

    let timestamp_unix_millis = time
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0);

    let timestamp_key = str_table.index(TIMESTAMP_LABEL);
    let trace_id_key = str_table.index(TRACE_ID_LABEL);
    let span_id_key = str_table.index(SPAN_ID_LABEL);
    let thread_id_key = str_table.index(THREAD_ID_LABEL);
    let event_period_key = str_table.index(EVENT_PERIOD_LABEL);

    let mut samples = Vec::with_capacity(stacktraces.len());
    for stacktrace in stacktraces {
        let mut labels = vec![
            pprof::Label {
                key: timestamp_key,
                num: timestamp_unix_millis,
                ..Default::default()
            },
            pprof::Label {
                key: event_period_key,
                num: interval_millis,
                ..Default::default()
            },
            pprof::Label {
                key: thread_id_key,
                num: stacktrace.thread_id as i64,
                ..Default::default()
            },
        ];

        if let Some(context) = thread_states.get(&stacktrace.thread_id) {
            labels.push(pprof::Label {
                key: trace_id_key,
                str: str_table.index(&format_trace_id(context.trace_id)),
                ..Default::default()
            });
            labels.push(pprof::Label {
                key: span_id_key,
                str: str_table.index(&format_span_id(context.span_id)),
                ..Default::default()
            });
        }

        // Stored outermost first; the wire format wants the leaf first.
        let location_id = stacktrace
            .frames
            .iter()
            .rev()
            .map(|frame| {
                locations.intern(
                    &mut functions,
                    &mut str_table,
                    &frame.file_name,
                    &frame.function_name,
                    normalize_line_number(frame.line_number),
                )
            })
            .collect();

        samples.push(pprof::Sample {
            location_id,
            value: vec![],
            label: labels,
        });
    }

    pprof::Profile {
        sample: samples,
        location: locations.into_locations(),
        function: functions.into_functions(),
        string_table: str_table.into_strings(),
        ..Default::default()
    }
}

/// Missing and zero line numbers encode as the sentinel -1.
fn normalize_line_number(line_number: Option<u32>) -> i64 {
    match line_number {
        None | Some(0) => -1,
        Some(line) => line as i64,
    }
}

/// pprof binary encoding, gzipped and base64'd into an opaque record body.
pub fn serialize_profile(profile: &pprof::Profile) -> Result<String, EncodeError> {
    let serialized = profile.encode_to_vec();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&serialized)?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Inverse of [`serialize_profile`]; consumers and tests use this to get the
/// structured profile back out of a record body.
pub fn deserialize_profile(body: &str) -> Result<pprof::Profile, EncodeError> {
    let compressed = BASE64.decode(body)?;
    let mut decompressed = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut decompressed)?;
    Ok(pprof::Profile::decode(decompressed.as_slice())?)
}

// Function/location interning, de-duplicated by exact key for the whole
// encode pass.

struct FunctionTable {
    indexes: HashMap<(String, String), u64>,
    functions: Vec<pprof::Function>,
}

impl FunctionTable {
    fn new() -> Self {
        FunctionTable {
            indexes: HashMap::new(),
            functions: Vec::new(),
        }
    }

    fn intern(
        &mut self,
        str_table: &mut StringTable,
        file_name: &str,
        function_name: &str,
    ) -> u64 {
        let key = (file_name.to_owned(), function_name.to_owned());
        if let Some(id) = self.indexes.get(&key) {
            return *id;
        }

        let name = str_table.index(function_name);
        let id = self.functions.len() as u64 + 1;
        self.functions.push(pprof::Function {
            id,
            name,
            system_name: name,
            filename: str_table.index(file_name),
        });
        self.indexes.insert(key, id);
        id
    }

    fn into_functions(self) -> Vec<pprof::Function> {
        self.functions
    }
}

struct LocationTable {
    indexes: HashMap<(String, String, i64), u64>,
    locations: Vec<pprof::Location>,
}

impl LocationTable {
    fn new() -> Self {
        LocationTable {
            indexes: HashMap::new(),
            locations: Vec::new(),
        }
    }

    fn intern(
        &mut self,
        functions: &mut FunctionTable,
        str_table: &mut StringTable,
        file_name: &str,
        function_name: &str,
        line: i64,
    ) -> u64 {
        let key = (file_name.to_owned(), function_name.to_owned(), line);
        if let Some(id) = self.indexes.get(&key) {
            return *id;
        }

        let function_id = functions.intern(str_table, file_name, function_name);
        let location = pprof::Location {
            id: self.locations.len() as u64 + 1,
            line: vec![pprof::Line { function_id, line }],
            ..Default::default()
        };
        let id = location.id;
        self.indexes.insert(key, id);
        self.locations.push(location);
        id
    }

    fn into_locations(self) -> Vec<pprof::Location> {
        self.locations
    }
}
