// Device transport contract and listener plumbing

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use super::virtual_port::VirtualTransport;
#[cfg(feature = "native-midi")]
use super::native::MidirTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Input,
    Output,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Input => f.write_str("input"),
            PortKind::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub id: String,
    pub name: String,
    pub kind: PortKind,
    #[serde(default)]
    pub manufacturer: Option<String>,
}

/// Handle for one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub port_id: String,
    pub bytes: Vec<u8>,
    /// Transport clock, microseconds
    pub timestamp_us: u64,
}

pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Port-level access to a MIDI backend. `open` is idempotent; inbound
/// messages reach every listener registered on the port.
pub trait MidiTransport: Send + Sync {
    fn kind(&self) -> ProviderKind;
    /// Whether the backend can be used on this machine
    fn query_supported(&self) -> bool;
    fn discover(&self) -> Result<Vec<PortInfo>>;
    fn open(&self, port_id: &str, kind: PortKind) -> Result<()>;
    fn close(&self, port_id: &str, kind: PortKind) -> Result<()>;
    fn send(&self, port_id: &str, bytes: &[u8]) -> Result<()>;
    fn on_message(&self, port_id: &str, handler: MessageHandler) -> Result<SubscriptionToken>;
    /// Returns false when the token was not registered on the port
    fn off_message(&self, port_id: &str, token: SubscriptionToken) -> bool;
}

// ----- Listener registry -----

/// Per-port listener lists shared by the transports. Dispatch copies the
/// handler list and releases the lock before calling out, and a panicking
/// listener is contained so the others still run.
#[derive(Default)]
pub struct ListenerRegistry {
    next_token: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(SubscriptionToken, MessageHandler)>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, port_id: &str, handler: MessageHandler) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers
                .entry(port_id.to_string())
                .or_default()
                .push((token, handler));
        }
        token
    }

    pub fn remove(&self, port_id: &str, token: SubscriptionToken) -> bool {
        let Ok(mut handlers) = self.handlers.lock() else {
            return false;
        };
        let Some(list) = handlers.get_mut(port_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(t, _)| *t != token);
        let removed = list.len() < before;
        if list.is_empty() {
            handlers.remove(port_id);
        }
        removed
    }

    pub fn listener_count(&self, port_id: &str) -> usize {
        self.handlers
            .lock()
            .map(|h| h.get(port_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Deliver a message to the port's listeners. Returns how many ran to
    /// completion.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let snapshot: Vec<MessageHandler> = match self.handlers.lock() {
            Ok(handlers) => handlers
                .get(&message.port_id)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(()) => delivered += 1,
                Err(_) => log::warn!("MIDI listener on {} panicked; message dropped", message.port_id),
            }
        }
        delivered
    }
}

// ----- Providers -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OS MIDI 1.0 ports through midir
    Midi1,
    /// In-process loopback ports
    Virtual,
}

impl Default for ProviderKind {
    fn default() -> Self {
        if cfg!(feature = "native-midi") {
            ProviderKind::Midi1
        } else {
            ProviderKind::Virtual
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Midi1 => f.write_str("midi1"),
            ProviderKind::Virtual => f.write_str("virtual"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "midi1" | "midi" | "native" => Ok(ProviderKind::Midi1),
            "virtual" | "loopback" => Ok(ProviderKind::Virtual),
            other => Err(format!("unknown MIDI provider \"{}\" (expected midi1 or virtual)", other)),
        }
    }
}

/// The concrete transports behind one type
pub enum Provider {
    #[cfg(feature = "native-midi")]
    Midi1(MidirTransport),
    Virtual(VirtualTransport),
}

impl Provider {
    pub fn new(kind: ProviderKind) -> Result<Self> {
        match kind {
            #[cfg(feature = "native-midi")]
            ProviderKind::Midi1 => Ok(Provider::Midi1(MidirTransport::new()?)),
            #[cfg(not(feature = "native-midi"))]
            ProviderKind::Midi1 => Err(crate::error::AtlasError::Transport(
                "native MIDI support is not compiled in (enable the native-midi feature)".to_string(),
            )),
            ProviderKind::Virtual => Ok(Provider::Virtual(VirtualTransport::new())),
        }
    }

    fn inner(&self) -> &dyn MidiTransport {
        match self {
            #[cfg(feature = "native-midi")]
            Provider::Midi1(t) => t,
            Provider::Virtual(t) => t,
        }
    }
}

impl MidiTransport for Provider {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    fn query_supported(&self) -> bool {
        self.inner().query_supported()
    }

    fn discover(&self) -> Result<Vec<PortInfo>> {
        self.inner().discover()
    }

    fn open(&self, port_id: &str, kind: PortKind) -> Result<()> {
        self.inner().open(port_id, kind)
    }

    fn close(&self, port_id: &str, kind: PortKind) -> Result<()> {
        self.inner().close(port_id, kind)
    }

    fn send(&self, port_id: &str, bytes: &[u8]) -> Result<()> {
        self.inner().send(port_id, bytes)
    }

    fn on_message(&self, port_id: &str, handler: MessageHandler) -> Result<SubscriptionToken> {
        self.inner().on_message(port_id, handler)
    }

    fn off_message(&self, port_id: &str, token: SubscriptionToken) -> bool {
        self.inner().off_message(port_id, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn message(port: &str) -> InboundMessage {
        InboundMessage {
            port_id: port.to_string(),
            bytes: vec![0x90, 60, 100],
            timestamp_us: 0,
        }
    }

    #[test]
    fn test_registry_dispatch_and_remove() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let token = registry.add("in-1", Arc::new(move |_m: &InboundMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(registry.dispatch(&message("in-1")), 1);
        assert_eq!(registry.dispatch(&message("in-2")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.remove("in-1", token));
        assert!(!registry.remove("in-1", token));
        assert_eq!(registry.dispatch(&message("in-1")), 0);
        assert_eq!(registry.listener_count("in-1"), 0);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.add("in-1", Arc::new(|_m: &InboundMessage| panic!("bad listener")));
        let counter = Arc::clone(&hits);
        registry.add("in-1", Arc::new(move |_m: &InboundMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(registry.dispatch(&message("in-1")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));

        let reg = Arc::clone(&registry);
        let own = Arc::clone(&slot);
        let token = registry.add("in-1", Arc::new(move |m: &InboundMessage| {
            if let Some(token) = *own.lock().unwrap() {
                reg.remove(&m.port_id, token);
            }
        }));
        *slot.lock().unwrap() = Some(token);

        assert_eq!(registry.dispatch(&message("in-1")), 1);
        assert_eq!(registry.listener_count("in-1"), 0);
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("MIDI1".parse::<ProviderKind>().unwrap(), ProviderKind::Midi1);
        assert_eq!("virtual".parse::<ProviderKind>().unwrap(), ProviderKind::Virtual);
        assert!("ble".parse::<ProviderKind>().is_err());
        assert!(Provider::new(ProviderKind::Virtual).unwrap().query_supported());
    }
}
