use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use crate::util::lock;

/// Severity of an emitted record. Profiles are data, not diagnostics, so the
/// profiler always emits `Unspecified`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SeverityNumber {
    Unspecified = 0,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Str(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Identity of the profiled service, attached to every emitted record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Resource {
    pub attributes: BTreeMap<String, AttributeValue>,
}

pub const SERVICE_NAME_ATTR: &str = "service.name";
pub const DISTRO_VERSION_ATTR: &str = "splunk.distro.version";

impl Resource {
    pub fn new(service_name: &str) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(SERVICE_NAME_ATTR.to_owned(), service_name.into());
        attributes.insert(
            DISTRO_VERSION_ATTR.to_owned(),
            env!("CARGO_PKG_VERSION").into(),
        );
        Resource { attributes }
    }
}

/// One encoded profile, wrapped as a structured record for the emitter.
#[derive(Clone, Debug, Serialize)]
pub struct LogRecord {
    pub timestamp_unix_nanos: u64,
    pub severity_number: SeverityNumber,
    pub trace_flags: u8,
    /// base64(gzip(pprof)) payload.
    pub body: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub resource: Resource,
}

/// The telemetry emission boundary. Buffering, batching and transport are
/// the implementation's job; the profiler fires and forgets and never
/// retries.
pub trait ProfileEmitter: Send + Sync {
    fn emit(&self, record: LogRecord);

    /// Thread ids of any worker threads the emitter runs internally, so the
    /// sampler can leave them out of profiles unless configured otherwise.
    fn internal_thread_ids(&self) -> Vec<u64> {
        vec![]
    }
}

/// Emitter that writes each record as one JSON line, for development and
/// for piping profiles into offline tooling.
pub struct JsonLinesEmitter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesEmitter<W> {
    pub fn new(out: W) -> Self {
        JsonLinesEmitter {
            out: Mutex::new(out),
        }
    }
}

impl JsonLinesEmitter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> ProfileEmitter for JsonLinesEmitter<W> {
    fn emit(&self, record: LogRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                log::warn!("failed to render profile record: {err}");
                return;
            }
        };
        if let Err(err) = writeln!(lock(&self.out), "{line}") {
            log::warn!("failed to write profile record: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_carries_service_identity() {
        let resource = Resource::new("my-service");
        assert_eq!(
            resource.attributes.get(SERVICE_NAME_ATTR),
            Some(&AttributeValue::Str("my-service".to_owned()))
        );
        assert_eq!(
            resource.attributes.get("splunk.distro.version"),
            Some(&AttributeValue::Str(env!("CARGO_PKG_VERSION").to_owned()))
        );
    }

    #[test]
    fn records_serialize_with_untagged_attribute_values() {
        let mut attributes = BTreeMap::new();
        attributes.insert("profiling.data.type".to_owned(), "cpu".into());
        attributes.insert("profiling.data.total.frame.count".to_owned(), 30i64.into());

        let record = LogRecord {
            timestamp_unix_nanos: 1,
            severity_number: SeverityNumber::Unspecified,
            trace_flags: 1,
            body: "AAAA".to_owned(),
            attributes,
            resource: Resource::new("svc"),
        };

        let rendered = serde_json::to_value(&record).unwrap();
        assert_eq!(rendered["attributes"]["profiling.data.type"], "cpu");
        assert_eq!(rendered["attributes"]["profiling.data.total.frame.count"], 30);
    }

    #[test]
    fn json_lines_emitter_writes_one_line_per_record() {
        let emitter = JsonLinesEmitter::new(Vec::new());
        for timestamp in 1..=2 {
            emitter.emit(LogRecord {
                timestamp_unix_nanos: timestamp,
                severity_number: SeverityNumber::Unspecified,
                trace_flags: 1,
                body: "AAAA".to_owned(),
                attributes: BTreeMap::new(),
                resource: Resource::new("svc"),
            });
        }

        let written = String::from_utf8(emitter.out.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["timestamp_unix_nanos"], 1);
        assert_eq!(first["body"], "AAAA");
    }
}
