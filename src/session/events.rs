// Session event payloads and sinks

use std::sync::mpsc::Sender;
use std::sync::Mutex;

use serde::Serialize;

use crate::midi::{to_hex, ActivityKind};
use crate::now_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Started,
    Capturing,
    Stopped,
    Saved,
}

/// Progress of one import-capture session. The same shape is used for every
/// phase; `failed` is set on save and `last_bytes` while capturing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub device_id: String,
    pub status: ImportStatus,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
    /// Byte length of the frame just captured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_bytes: Option<usize>,
    pub ts: String,
}

impl ImportProgress {
    pub fn new(device_id: impl Into<String>, status: ImportStatus, count: usize) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            count,
            failed: None,
            last_bytes: None,
            ts: now_timestamp(),
        }
    }

    pub fn with_failed(mut self, failed: usize) -> Self {
        self.failed = Some(failed);
        self
    }

    pub fn with_last_bytes(mut self, len: usize) -> Self {
        self.last_bytes = Some(len);
        self
    }
}

/// One inbound message on a paired input
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiActivity {
    pub device_id: String,
    pub input_id: String,
    /// Microseconds since the previous message on the same input
    pub delta_time_us: u64,
    pub message: Vec<u8>,
    pub kind: ActivityKind,
    pub ts: String,
}

impl MidiActivity {
    pub fn message_hex(&self) -> String {
        to_hex(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThruStatus {
    Started,
    Stopped,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThruEvent {
    pub output_id: String,
    pub input_id: String,
    pub status: ThruStatus,
    pub ts: String,
}

impl ThruEvent {
    pub fn new(output_id: impl Into<String>, input_id: impl Into<String>, status: ThruStatus) -> Self {
        Self {
            output_id: output_id.into(),
            input_id: input_id.into(),
            status,
            ts: now_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    Import(ImportProgress),
    Activity(MidiActivity),
    Thru(ThruEvent),
}

/// Receives session events. Called from transport threads and timer
/// threads, never with session state locked.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SessionEvent);
}

impl<F> EventSink for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn emit(&self, event: &SessionEvent) {
        self(event)
    }
}

/// Forwards events into a channel. Send errors (receiver gone) are ignored.
pub struct ChannelSink {
    sender: Mutex<Sender<SessionEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<SessionEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &SessionEvent) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event.clone());
        }
    }
}

/// Writes events to the log and nothing else
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Import(p) => {
                log::debug!("import {} {:?} count={}", p.device_id, p.status, p.count)
            }
            SessionEvent::Activity(a) => {
                log::trace!("activity {} {:?} {}", a.input_id, a.kind, a.message_hex())
            }
            SessionEvent::Thru(t) => {
                log::debug!("thru {} -> {} {:?}", t.input_id, t.output_id, t.status)
            }
        }
    }
}
