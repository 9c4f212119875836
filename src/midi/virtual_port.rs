// In-process loopback transport
// Ports are declared up front; inbound traffic is injected by the owner and
// outbound traffic is recorded. Used by tests, demos and machines without
// native MIDI.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::{AtlasError, Result};
use super::transport::{
    InboundMessage, ListenerRegistry, MessageHandler, MidiTransport, PortInfo, PortKind,
    ProviderKind, SubscriptionToken,
};

#[derive(Default)]
struct VirtualState {
    ports: Vec<PortInfo>,
    open: HashSet<(String, PortKind)>,
    open_calls: usize,
    sent: Vec<(String, Vec<u8>)>,
    failing_sends: HashSet<String>,
    failing_opens: HashSet<String>,
}

struct VirtualInner {
    state: Mutex<VirtualState>,
    listeners: ListenerRegistry,
    clock: Instant,
}

/// Cheap to clone; clones share ports, traffic and listeners
#[derive(Clone)]
pub struct VirtualTransport {
    inner: Arc<VirtualInner>,
}

impl Default for VirtualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(VirtualInner {
                state: Mutex::new(VirtualState::default()),
                listeners: ListenerRegistry::new(),
                clock: Instant::now(),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, VirtualState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| AtlasError::Transport("virtual port state poisoned".to_string()))
    }

    pub fn add_port(&self, id: &str, name: &str, kind: PortKind) {
        if let Ok(mut state) = self.state() {
            state.ports.retain(|p| !(p.id == id && p.kind == kind));
            state.ports.push(PortInfo {
                id: id.to_string(),
                name: name.to_string(),
                kind,
                manufacturer: None,
            });
        }
    }

    /// Declare an input and an output sharing `name`. Returns (input id, output id).
    pub fn add_device(&self, name: &str) -> (String, String) {
        let input_id = format!("in:{}", name);
        let output_id = format!("out:{}", name);
        self.add_port(&input_id, name, PortKind::Input);
        self.add_port(&output_id, name, PortKind::Output);
        (input_id, output_id)
    }

    /// Deliver bytes as if they arrived on an input. Closed inputs drop the
    /// message. Returns how many listeners received it.
    pub fn inject(&self, port_id: &str, bytes: &[u8]) -> usize {
        let open = self
            .state()
            .map(|s| s.open.contains(&(port_id.to_string(), PortKind::Input)))
            .unwrap_or(false);
        if !open {
            log::debug!("Dropping injected message for closed input {}", port_id);
            return 0;
        }
        let message = InboundMessage {
            port_id: port_id.to_string(),
            bytes: bytes.to_vec(),
            timestamp_us: self.inner.clock.elapsed().as_micros() as u64,
        };
        self.inner.listeners.dispatch(&message)
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.state().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, port_id: &str) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| id == port_id)
            .map(|(_, bytes)| bytes)
            .collect()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut state) = self.state() {
            state.sent.clear();
        }
    }

    pub fn is_open(&self, port_id: &str, kind: PortKind) -> bool {
        self.state()
            .map(|s| s.open.contains(&(port_id.to_string(), kind)))
            .unwrap_or(false)
    }

    /// Number of `open` calls that actually opened a port
    pub fn open_calls(&self) -> usize {
        self.state().map(|s| s.open_calls).unwrap_or(0)
    }

    pub fn listener_count(&self, port_id: &str) -> usize {
        self.inner.listeners.listener_count(port_id)
    }

    /// Make every later send to `port_id` fail
    pub fn fail_sends_to(&self, port_id: &str) {
        if let Ok(mut state) = self.state() {
            state.failing_sends.insert(port_id.to_string());
        }
    }

    /// Make every later open of `port_id` fail
    pub fn fail_opens_of(&self, port_id: &str) {
        if let Ok(mut state) = self.state() {
            state.failing_opens.insert(port_id.to_string());
        }
    }
}

impl MidiTransport for VirtualTransport {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Virtual
    }

    fn query_supported(&self) -> bool {
        true
    }

    fn discover(&self) -> Result<Vec<PortInfo>> {
        Ok(self.state()?.ports.clone())
    }

    fn open(&self, port_id: &str, kind: PortKind) -> Result<()> {
        let mut state = self.state()?;
        let key = (port_id.to_string(), kind);
        if state.open.contains(&key) {
            return Ok(());
        }
        if state.failing_opens.contains(port_id) {
            return Err(AtlasError::Transport(format!("cannot open {} {}", kind, port_id)));
        }
        if !state.ports.iter().any(|p| p.id == port_id && p.kind == kind) {
            return Err(AtlasError::NotFound(format!("MIDI {} {}", kind, port_id)));
        }
        state.open.insert(key);
        state.open_calls += 1;
        Ok(())
    }

    fn close(&self, port_id: &str, kind: PortKind) -> Result<()> {
        let mut state = self.state()?;
        state.open.remove(&(port_id.to_string(), kind));
        Ok(())
    }

    fn send(&self, port_id: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        if !state.open.contains(&(port_id.to_string(), PortKind::Output)) {
            return Err(AtlasError::Transport(format!("output {} is not open", port_id)));
        }
        if state.failing_sends.contains(port_id) {
            return Err(AtlasError::Transport(format!("send to {} failed", port_id)));
        }
        state.sent.push((port_id.to_string(), bytes.to_vec()));
        Ok(())
    }

    fn on_message(&self, port_id: &str, handler: MessageHandler) -> Result<SubscriptionToken> {
        Ok(self.inner.listeners.add(port_id, handler))
    }

    fn off_message(&self, port_id: &str, token: SubscriptionToken) -> bool {
        self.inner.listeners.remove(port_id, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_open_is_idempotent() {
        let transport = VirtualTransport::new();
        let (input, output) = transport.add_device("JD-Xi");
        transport.open(&output, PortKind::Output).unwrap();
        transport.open(&output, PortKind::Output).unwrap();
        transport.open(&input, PortKind::Input).unwrap();
        assert_eq!(transport.open_calls(), 2);

        transport.close(&output, PortKind::Output).unwrap();
        assert!(!transport.is_open(&output, PortKind::Output));
        assert!(transport.is_open(&input, PortKind::Input));
    }

    #[test]
    fn test_unknown_port_and_failures() {
        let transport = VirtualTransport::new();
        assert!(matches!(transport.open("ghost", PortKind::Input), Err(AtlasError::NotFound(_))));

        let (_input, output) = transport.add_device("DX7");
        assert!(transport.send(&output, &[0xF0, 0xF7]).is_err(), "closed output");
        transport.open(&output, PortKind::Output).unwrap();
        transport.fail_sends_to(&output);
        assert!(matches!(transport.send(&output, &[0xF0, 0xF7]), Err(AtlasError::Transport(_))));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_inject_reaches_listeners_on_open_input() {
        let transport = VirtualTransport::new();
        let (input, _output) = transport.add_device("JD-Xi");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        transport
            .on_message(&input, Arc::new(move |m: &InboundMessage| {
                assert_eq!(m.bytes, vec![0x90, 60, 100]);
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(transport.inject(&input, &[0x90, 60, 100]), 0, "input not open yet");
        transport.open(&input, PortKind::Input).unwrap();
        assert_eq!(transport.inject(&input, &[0x90, 60, 100]), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
