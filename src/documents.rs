//! Document model and data-sink boundary.
//!
//! Orchestration code never stores data itself. It frames each run with a start
//! and a stop document and writes records through a [`RecordSink`] using a
//! three-call protocol per record:
//!
//! ```text
//! open_run(StartDoc)
//!    │
//!    ├── open_record("primary") → append(key, value)… → commit()   (one EventDoc)
//!    ├── open_record("primary") → …                                (next EventDoc)
//!    └── open_record("settings") → …                               (new stream → DescriptorDoc first)
//!    │
//! close_run(ExitStatus)
//! ```
//!
//! [`DocumentRecorder`] is the in-process sink: it turns the calls into Bluesky-style
//! documents, keeps them for inspection and broadcasts each one to subscribers.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppResult, DaqError};

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Completed normally
    Success,
    /// Ended abnormally (stall, fatal fault)
    Fail,
    /// Stopped on request
    Abort,
}

/// Document types for run data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and metadata
    Start(StartDoc),
    /// Data stream descriptor - emitted before the first event of each stream
    Descriptor(DescriptorDoc),
    /// One committed record
    Event(EventDoc),
    /// Run stop - completion status
    Stop(StopDoc),
}

impl Document {
    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Event payload, if this is an event document
    pub fn as_event(&self) -> Option<&EventDoc> {
        match self {
            Document::Event(e) => Some(e),
            _ => None,
        }
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Plan type that generated this run
    pub plan_type: String,
    /// Plan name (e.g. `sscan_1D`, `TuneAxis.tune`)
    pub plan_name: String,
    /// Plan arguments/configuration
    pub plan_args: BTreeMap<String, serde_json::Value>,
    /// Caller-provided metadata
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Visualization hints (e.g., preferred plot axes)
    pub hints: Vec<String>,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    /// New start document with a fresh run UID
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: BTreeMap::new(),
            metadata: BTreeMap::new(),
            hints: Vec::new(),
            time_ns: now_ns(),
        }
    }

    /// Add a plan argument
    pub fn with_arg(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.plan_args.insert(key.to_string(), value.into());
        self
    }

    /// Add one metadata entry
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Merge caller metadata (existing keys are overwritten)
    pub fn extend_metadata(mut self, metadata: &BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Add a plotting hint
    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hints.push(hint.to_string());
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "boolean", "array", "object"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    pub shape: Vec<usize>,
}

impl DataKey {
    /// Infer the schema entry for a value
    pub fn describe(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        let (dtype, shape) = match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => ("integer", vec![]),
            Value::Number(_) => ("number", vec![]),
            Value::String(_) => ("string", vec![]),
            Value::Bool(_) => ("boolean", vec![]),
            Value::Array(items) => ("array", vec![items.len()]),
            Value::Object(_) | Value::Null => ("object", vec![]),
        };
        Self {
            dtype: dtype.to_string(),
            shape,
        }
    }
}

/// Descriptor document - defines schema for one named stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name (e.g., "primary", "settings", "PeakStats")
    pub name: String,
    /// Schema for data fields, taken from the first record of the stream
    pub data_keys: BTreeMap<String, DataKey>,
    /// Timestamp
    pub time_ns: u64,
}

/// Event document - one committed record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc (for quick run lookup)
    pub run_uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor_uid: String,
    /// Stream name, duplicated from the descriptor for convenience
    pub stream: String,
    /// Event sequence number within this stream, starting at 1
    pub seq_num: u32,
    /// Timestamp
    pub time_ns: u64,
    /// Field values in append order
    pub data: BTreeMap<String, serde_json::Value>,
}

impl EventDoc {
    /// Numeric value of a field, if present and numeric
    pub fn number(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(serde_json::Value::as_f64)
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Events per stream
    pub num_events: BTreeMap<String, u32>,
}

/// Consumer of run documents.
///
/// Calls for one run arrive from a single task, in order. Implementations return
/// errors for protocol misuse and storage failures; orchestration treats every
/// error here as fatal.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Begin a run; returns the run UID
    async fn open_run(&self, start: StartDoc) -> anyhow::Result<String>;

    /// Begin a record on the named stream
    async fn open_record(&self, stream: &str) -> anyhow::Result<()>;

    /// Add one field to the open record
    async fn append(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()>;

    /// Finish the open record
    async fn commit(&self) -> anyhow::Result<()>;

    /// End the run. An uncommitted record is discarded.
    async fn close_run(&self, exit_status: ExitStatus, reason: Option<String>)
        -> anyhow::Result<()>;
}

/// Write one complete record, mapping sink failures to [`DaqError::Sink`].
pub async fn emit_record(
    sink: &dyn RecordSink,
    stream: &str,
    fields: Vec<(String, serde_json::Value)>,
) -> AppResult<()> {
    sink.open_record(stream)
        .await
        .map_err(|e| DaqError::sink(stream, e))?;
    for (key, value) in fields {
        sink.append(&key, value)
            .await
            .map_err(|e| DaqError::sink(stream, e))?;
    }
    sink.commit().await.map_err(|e| DaqError::sink(stream, e))
}

struct StreamState {
    descriptor_uid: String,
    seq_num: u32,
}

struct OpenRecord {
    stream: String,
    data: BTreeMap<String, serde_json::Value>,
}

struct RunState {
    uid: String,
    streams: BTreeMap<String, StreamState>,
    record: Option<OpenRecord>,
}

#[derive(Default)]
struct RecorderState {
    run: Option<RunState>,
    documents: Vec<Document>,
}

/// In-memory [`RecordSink`] that materialises documents.
///
/// Every emitted document is stored and also sent on a broadcast channel, in
/// emission order.
pub struct DocumentRecorder {
    state: Mutex<RecorderState>,
    tx: broadcast::Sender<Document>,
}

impl DocumentRecorder {
    /// Create a recorder whose broadcast channel buffers `capacity` documents
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(RecorderState::default()),
            tx,
        }
    }

    /// Subscribe to documents emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.tx.subscribe()
    }

    /// All documents emitted so far
    pub fn documents(&self) -> Vec<Document> {
        self.state.lock().documents.clone()
    }

    /// Events of one stream, across all runs, in emission order
    pub fn events(&self, stream: &str) -> Vec<EventDoc> {
        self.state
            .lock()
            .documents
            .iter()
            .filter_map(Document::as_event)
            .filter(|e| e.stream == stream)
            .cloned()
            .collect()
    }

    /// Start documents, in emission order
    pub fn starts(&self) -> Vec<StartDoc> {
        self.state
            .lock()
            .documents
            .iter()
            .filter_map(|d| match d {
                Document::Start(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Stop documents, in emission order
    pub fn stops(&self) -> Vec<StopDoc> {
        self.state
            .lock()
            .documents
            .iter()
            .filter_map(|d| match d {
                Document::Stop(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(state: &mut RecorderState, tx: &broadcast::Sender<Document>, doc: Document) {
        // No receivers is fine; documents are kept regardless.
        let _ = tx.send(doc.clone());
        state.documents.push(doc);
    }
}

impl Default for DocumentRecorder {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl RecordSink for DocumentRecorder {
    async fn open_run(&self, start: StartDoc) -> anyhow::Result<String> {
        let mut state = self.state.lock();
        if let Some(run) = &state.run {
            bail!("run {} is still open", run.uid);
        }
        let uid = start.uid.clone();
        debug!(run_uid = %uid, plan = %start.plan_name, "run opened");
        state.run = Some(RunState {
            uid: uid.clone(),
            streams: BTreeMap::new(),
            record: None,
        });
        Self::push(&mut state, &self.tx, Document::Start(start));
        Ok(uid)
    }

    async fn open_record(&self, stream: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let run = state
            .run
            .as_mut()
            .ok_or_else(|| anyhow!("open_record('{}') outside a run", stream))?;
        if let Some(open) = &run.record {
            bail!(
                "record on '{}' still open while opening '{}'",
                open.stream,
                stream
            );
        }
        run.record = Some(OpenRecord {
            stream: stream.to_string(),
            data: BTreeMap::new(),
        });
        Ok(())
    }

    async fn append(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let record = state
            .run
            .as_mut()
            .and_then(|run| run.record.as_mut())
            .ok_or_else(|| anyhow!("append('{}') without an open record", key))?;
        record.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let run = state
            .run
            .as_mut()
            .ok_or_else(|| anyhow!("commit outside a run"))?;
        let record = run
            .record
            .take()
            .ok_or_else(|| anyhow!("commit without an open record"))?;
        let run_uid = run.uid.clone();

        let mut emitted = Vec::with_capacity(2);
        let stream = run
            .streams
            .entry(record.stream.clone())
            .or_insert_with(|| {
                let descriptor = DescriptorDoc {
                    uid: new_uid(),
                    run_uid: run_uid.clone(),
                    name: record.stream.clone(),
                    data_keys: record
                        .data
                        .iter()
                        .map(|(k, v)| (k.clone(), DataKey::describe(v)))
                        .collect(),
                    time_ns: now_ns(),
                };
                let state = StreamState {
                    descriptor_uid: descriptor.uid.clone(),
                    seq_num: 0,
                };
                emitted.push(Document::Descriptor(descriptor));
                state
            });
        stream.seq_num += 1;
        emitted.push(Document::Event(EventDoc {
            uid: new_uid(),
            run_uid,
            descriptor_uid: stream.descriptor_uid.clone(),
            stream: record.stream,
            seq_num: stream.seq_num,
            time_ns: now_ns(),
            data: record.data,
        }));
        for doc in emitted {
            Self::push(&mut state, &self.tx, doc);
        }
        Ok(())
    }

    async fn close_run(
        &self,
        exit_status: ExitStatus,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let run = state
            .run
            .take()
            .ok_or_else(|| anyhow!("close_run without an open run"))?;
        if let Some(open) = &run.record {
            debug!(stream = %open.stream, "discarding uncommitted record");
        }
        let stop = StopDoc {
            uid: new_uid(),
            run_uid: run.uid.clone(),
            exit_status,
            reason: reason.unwrap_or_default(),
            time_ns: now_ns(),
            num_events: run
                .streams
                .iter()
                .map(|(name, s)| (name.clone(), s.seq_num))
                .collect(),
        };
        debug!(run_uid = %run.uid, ?exit_status, "run closed");
        Self::push(&mut state, &self.tx, Document::Stop(stop));
        Ok(())
    }
}
