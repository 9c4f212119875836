// Audition-thru routing
// At most one session. Expiry runs on its own timer thread that waits on a
// channel; dropping the sender cancels it.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::Duration;

use serde::Serialize;

use crate::constants::{THRU_DEFAULT_DURATION_MS, THRU_MAX_DURATION_MS, THRU_MIN_DURATION_MS};
use crate::error::Result;
use crate::midi::SubscriptionToken;

#[derive(Debug, Clone, Default)]
pub struct ThruOptions {
    pub duration_ms: Option<u64>,
}

impl ThruOptions {
    pub fn duration(duration_ms: u64) -> Self {
        Self {
            duration_ms: Some(duration_ms),
        }
    }
}

/// Requested duration clamped to the allowed window
pub fn clamp_duration(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(THRU_DEFAULT_DURATION_MS)
        .clamp(THRU_MIN_DURATION_MS, THRU_MAX_DURATION_MS)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThruStatusInfo {
    pub active: bool,
    pub input_id: Option<String>,
    pub output_id: Option<String>,
    pub started_at: Option<String>,
    pub duration_ms: Option<u64>,
}

impl ThruStatusInfo {
    pub fn inactive() -> Self {
        Self {
            active: false,
            input_id: None,
            output_id: None,
            started_at: None,
            duration_ms: None,
        }
    }
}

pub(crate) struct ThruSession {
    pub generation: u64,
    pub input_id: String,
    pub output_id: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub token: SubscriptionToken,
    /// Dropping this cancels the expiry timer
    pub cancel: Option<Sender<()>>,
}

impl ThruSession {
    pub fn status(&self) -> ThruStatusInfo {
        ThruStatusInfo {
            active: true,
            input_id: Some(self.input_id.clone()),
            output_id: Some(self.output_id.clone()),
            started_at: Some(self.started_at.clone()),
            duration_ms: Some(self.duration_ms),
        }
    }

    pub fn cancel_timer(&mut self) {
        self.cancel.take();
    }
}

/// Run `on_expire` after `duration_ms` unless the returned sender is dropped
/// (or sent to) first.
pub(crate) fn spawn_expiry_timer<F>(duration_ms: u64, on_expire: F) -> Result<Sender<()>>
where
    F: FnOnce() + Send + 'static,
{
    let (cancel, cancelled) = mpsc::channel::<()>();
    std::thread::Builder::new()
        .name("thru-expiry".to_string())
        .spawn(move || {
            if let Err(RecvTimeoutError::Timeout) =
                cancelled.recv_timeout(Duration::from_millis(duration_ms))
            {
                on_expire();
            }
        })?;
    Ok(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_clamp_duration() {
        assert_eq!(clamp_duration(None), 25_000);
        assert_eq!(clamp_duration(Some(5_000_000)), 120_000);
        assert_eq!(clamp_duration(Some(10)), 5_000);
        assert_eq!(clamp_duration(Some(60_000)), 60_000);
    }

    #[test]
    fn test_timer_fires() {
        let (tx, rx) = mpsc::channel();
        let _cancel = spawn_expiry_timer(10, move || {
            let _ = tx.send(());
        })
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_dropping_sender_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let cancel = spawn_expiry_timer(200, move || flag.store(true, Ordering::SeqCst)).unwrap();
        drop(cancel);
        std::thread::sleep(Duration::from_millis(400));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
