// Device session manager -- connection verification, SysEx import capture
// and audition-thru over one MIDI transport.
//
// Transport listeners hold a Weak reference to the shared state and never
// call into the transport or the event sink while the state lock is held.

pub mod connection;
pub mod events;
pub mod import;
pub mod thru;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use crate::constants::{ACTIVE_INPUT_WINDOW_MS, IDENTITY_REQUEST};
use crate::error::{AtlasError, Result};
use crate::library::PatchLibrary;
use crate::midi::{
    classify, is_channel_voice, is_complete_sysex, parse_identity_reply, split_sysex_frames,
    validate_sysex, InboundMessage, MessageHandler, MidiTransport, PortInfo, PortKind,
    ProviderKind,
};
use crate::now_timestamp;

pub use connection::{resolve_input, ConnectOptions, ConnectionStatus, VerificationState};
pub use events::{
    ChannelSink, EventSink, ImportProgress, ImportStatus, LogSink, MidiActivity, SessionEvent,
    ThruEvent, ThruStatus,
};
pub use import::{ImportOptions, ImportSaveSummary, ImportSnapshot};
pub use thru::{clamp_duration, ThruOptions, ThruStatusInfo};

use connection::Pairing;
use import::ImportSession;
use thru::{spawn_expiry_timer, ThruSession};

#[derive(Default)]
struct SessionState {
    /// Keyed by output id
    pairings: HashMap<String, Pairing>,
    /// Keyed by device id
    imports: HashMap<String, ImportSession>,
    thru: Option<ThruSession>,
    /// Input that most recently delivered a message, and when
    last_active: Option<(String, Instant)>,
}

impl SessionState {
    /// Whether anything other than the pairing of `leaving_output` listens
    /// on `input_id`
    fn input_in_use(&self, input_id: &str, leaving_output: &str) -> bool {
        self.pairings.values().any(|p| p.input_id == input_id)
            || self
                .imports
                .values()
                .any(|s| s.token.is_some() && s.input_id == input_id)
            || self
                .thru
                .as_ref()
                .map_or(false, |t| t.output_id != leaving_output && t.input_id == input_id)
    }
}

struct Inner {
    transport: Arc<dyn MidiTransport>,
    state: Mutex<SessionState>,
    library: RwLock<Option<Arc<PatchLibrary>>>,
    events: Arc<dyn EventSink>,
    next_generation: AtomicU64,
}

/// Owns every device-facing session. Not `Clone`; share it behind an `Arc`.
pub struct DeviceSessionManager {
    inner: Arc<Inner>,
}

impl DeviceSessionManager {
    pub fn new(transport: Arc<dyn MidiTransport>, events: Arc<dyn EventSink>) -> Self {
        log::info!("Session manager using {} transport", transport.kind());
        Self {
            inner: Arc::new(Inner {
                transport,
                state: Mutex::new(SessionState::default()),
                library: RwLock::new(None),
                events,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Make the store available to import saves and patch sends
    pub fn attach_library(&self, library: Arc<PatchLibrary>) {
        match self.inner.library.write() {
            Ok(mut slot) => *slot = Some(library),
            Err(_) => log::error!("Library slot poisoned; library not attached"),
        }
    }

    /// The attached store, or `NotInitialized`
    pub fn library(&self) -> Result<Arc<PatchLibrary>> {
        self.inner
            .library
            .read()
            .map_err(|_| AtlasError::Other("library slot poisoned".to_string()))?
            .clone()
            .ok_or(AtlasError::NotInitialized)
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.inner.transport.kind()
    }

    pub fn discover(&self) -> Result<Vec<PortInfo>> {
        self.inner.transport.discover()
    }

    // ----- Connections -----

    /// Pair an output with its reply input, open both and ask the device to
    /// identify itself. Any inbound message on the input verifies the pairing.
    pub fn connect(&self, output_id: &str, options: ConnectOptions) -> Result<ConnectionStatus> {
        let ports = self.inner.transport.discover()?;
        let input_id = resolve_input(output_id, options.input_id.as_deref(), &ports);

        let existing = {
            let state = self.inner.lock()?;
            state.pairings.get(output_id).map(|p| p.input_id.clone())
        };
        match existing {
            Some(current) if current == input_id => return Ok(self.status(output_id)),
            Some(current) => {
                log::info!("Re-pairing {} from {} to {}", output_id, current, input_id);
                if let Err(e) = self.disconnect(output_id) {
                    log::warn!("Closing previous pairing of {} failed: {}", output_id, e);
                }
            }
            None => {}
        }

        {
            let mut state = self.inner.lock()?;
            state
                .pairings
                .insert(output_id.to_string(), Pairing::new(input_id.clone(), now_timestamp()));
        }

        let opened = self
            .inner
            .transport
            .open(output_id, PortKind::Output)
            .and_then(|_| self.inner.transport.open(&input_id, PortKind::Input));
        if let Err(e) = opened {
            log::warn!("Connect {} -> {} failed: {}", output_id, input_id, e);
            self.inner.lock()?.pairings.remove(output_id);
            return Err(e);
        }

        let weak = Arc::downgrade(&self.inner);
        let owner = output_id.to_string();
        let handler: MessageHandler = Arc::new(move |message: &InboundMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_activity(&owner, message);
            }
        });
        let token = match self.inner.transport.on_message(&input_id, handler) {
            Ok(token) => token,
            Err(e) => {
                self.inner.lock()?.pairings.remove(output_id);
                return Err(e);
            }
        };

        let registered = {
            let mut state = self.inner.lock()?;
            match state.pairings.get_mut(output_id) {
                Some(pairing) => {
                    pairing.token = Some(token);
                    // A reply may already have verified the pairing
                    if pairing.state == VerificationState::Connecting {
                        pairing.state = VerificationState::ConnectedUnverified;
                    }
                    true
                }
                None => false,
            }
        };
        if !registered {
            // Disconnected while we were opening
            self.inner.transport.off_message(&input_id, token);
            return Ok(ConnectionStatus::disconnected(output_id));
        }

        log::info!("Connected {} (reply input {})", output_id, input_id);
        if let Err(e) = self.inner.transport.send(output_id, &IDENTITY_REQUEST) {
            log::warn!("Identity request to {} failed: {}", output_id, e);
        }

        Ok(self.status(output_id))
    }

    /// Close the output and its paired input. The pairing is removed even when
    /// a close fails; the first close error is returned. The input stays open
    /// while an import, a thru session on another output or another pairing
    /// still listens to it.
    pub fn disconnect(&self, output_id: &str) -> Result<()> {
        let (pairing, thru_on_output, input_in_use) = {
            let mut state = self.inner.lock()?;
            let pairing = state
                .pairings
                .remove(output_id)
                .ok_or_else(|| AtlasError::NotFound(format!("connection {}", output_id)))?;
            let thru_on_output = state
                .thru
                .as_ref()
                .map_or(false, |t| t.output_id == output_id);
            let input_in_use = state.input_in_use(&pairing.input_id, output_id);
            (pairing, thru_on_output, input_in_use)
        };

        if thru_on_output {
            self.inner.end_thru(None, ThruStatus::Stopped);
        }
        if let Some(token) = pairing.token {
            self.inner.transport.off_message(&pairing.input_id, token);
        }

        let output_closed = self.inner.transport.close(output_id, PortKind::Output);
        let input_closed = if input_in_use {
            log::info!("Keeping {} open for its other listeners", pairing.input_id);
            Ok(())
        } else {
            self.inner.transport.close(&pairing.input_id, PortKind::Input)
        };
        log::info!("Disconnected {}", output_id);
        output_closed.and(input_closed)
    }

    pub fn status(&self, output_id: &str) -> ConnectionStatus {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.pairings.get(output_id).map(|p| p.status(output_id)))
            .unwrap_or_else(|| ConnectionStatus::disconnected(output_id))
    }

    /// Every live pairing, ordered by output id
    pub fn connections(&self) -> Vec<ConnectionStatus> {
        let mut all: Vec<ConnectionStatus> = match self.inner.lock() {
            Ok(state) => state
                .pairings
                .iter()
                .map(|(output_id, pairing)| pairing.status(output_id))
                .collect(),
            Err(_) => Vec::new(),
        };
        all.sort_by(|a, b| a.output_id.cmp(&b.output_id));
        all
    }

    // ----- Sending -----

    /// Send one framed SysEx message. Malformed data never reaches the transport.
    pub fn send_sysex(&self, output_id: &str, bytes: &[u8]) -> Result<()> {
        validate_sysex(bytes)?;
        self.inner.transport.send(output_id, bytes)
    }

    /// Send a stored patch frame by frame and mark it used. Returns the number
    /// of frames sent.
    pub fn send_patch(&self, output_id: &str, patch_id: &str) -> Result<usize> {
        let library = self.library()?;
        let patch = library.get_patch(patch_id)?;
        let frames = patch
            .sysex
            .as_deref()
            .map(split_sysex_frames)
            .unwrap_or_default();
        if frames.is_empty() {
            return Err(AtlasError::InvalidInput(format!(
                "patch '{}' has no SysEx data",
                patch.name
            )));
        }

        for frame in &frames {
            self.inner.transport.send(output_id, frame)?;
        }
        library.update_last_used(patch_id)?;
        log::info!("Sent '{}' to {} ({} frames)", patch.name, output_id, frames.len());
        Ok(frames.len())
    }

    // ----- Import capture -----

    /// Begin capturing SysEx for a device. A session already running for the
    /// device is replaced and its frames are discarded.
    pub fn start_import(&self, device_id: &str) -> Result<ImportSnapshot> {
        let device_name = match self.inner.transport.discover() {
            Ok(ports) => ports
                .into_iter()
                .find(|p| p.id == device_id)
                .map(|p| p.name)
                .unwrap_or_else(|| device_id.to_string()),
            Err(e) => {
                log::warn!("Port discovery failed, naming import by id: {}", e);
                device_id.to_string()
            }
        };

        let (input_id, previous) = {
            let mut state = self.inner.lock()?;
            let input_id = state
                .pairings
                .get(device_id)
                .map(|p| p.input_id.clone())
                .unwrap_or_else(|| device_id.to_string());
            (input_id, state.imports.remove(device_id))
        };
        if let Some(previous) = previous {
            log::info!(
                "Restarting import for {}; discarding {} captured frames",
                device_id,
                previous.messages.len()
            );
            if let Some(token) = previous.token {
                self.inner.transport.off_message(&previous.input_id, token);
            }
        }

        self.inner.transport.open(&input_id, PortKind::Input)?;

        let weak = Arc::downgrade(&self.inner);
        let owner = device_id.to_string();
        let handler: MessageHandler = Arc::new(move |message: &InboundMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_capture(&owner, message);
            }
        });
        let token = self.inner.transport.on_message(&input_id, handler)?;

        let session = ImportSession {
            device_name,
            input_id,
            started: true,
            messages: Vec::new(),
            created_at: now_timestamp(),
            token: Some(token),
        };
        let snapshot = snapshot(device_id, &session);
        self.inner.lock()?.imports.insert(device_id.to_string(), session);

        log::info!("Import capture started for {} on {}", device_id, snapshot.device_name);
        self.inner.emit(SessionEvent::Import(ImportProgress::new(
            device_id,
            ImportStatus::Started,
            0,
        )));
        Ok(snapshot)
    }

    /// Stop capturing. Frames stay buffered until saved or replaced.
    pub fn stop_import(&self, device_id: &str) -> Result<ImportSnapshot> {
        let (snapshot, token) = {
            let mut state = self.inner.lock()?;
            let session = state
                .imports
                .get_mut(device_id)
                .ok_or_else(|| AtlasError::NotFound(format!("import session {}", device_id)))?;
            session.started = false;
            let token = session.token.take().map(|t| (session.input_id.clone(), t));
            (snapshot(device_id, session), token)
        };
        if let Some((input_id, token)) = token {
            self.inner.transport.off_message(&input_id, token);
        }

        self.inner.emit(SessionEvent::Import(ImportProgress::new(
            device_id,
            ImportStatus::Stopped,
            snapshot.count,
        )));
        Ok(snapshot)
    }

    /// Save every captured frame as its own patch and clear the session.
    /// Frames that fail to save are tallied, not fatal.
    pub fn save_import(&self, device_id: &str, options: &ImportOptions) -> Result<ImportSaveSummary> {
        let library = self.library()?;
        let session = self
            .inner
            .lock()?
            .imports
            .remove(device_id)
            .ok_or_else(|| AtlasError::NotFound(format!("import session {}", device_id)))?;
        if let Some(token) = session.token {
            self.inner.transport.off_message(&session.input_id, token);
        }

        let mut summary = ImportSaveSummary {
            device_id: device_id.to_string(),
            saved: 0,
            failed: 0,
            patch_ids: Vec::new(),
            errors: Vec::new(),
        };
        for (i, patch) in session.to_patches(options).into_iter().enumerate() {
            match library.save_patch(patch) {
                Ok(saved) => {
                    summary.saved += 1;
                    summary.patch_ids.push(saved.id);
                }
                Err(e) => {
                    log::warn!("Import frame {} for {} not saved: {}", i + 1, device_id, e);
                    summary.failed += 1;
                    summary.errors.push(format!("frame {}: {}", i + 1, e));
                }
            }
        }

        log::info!(
            "Import for {} saved {} patches ({} failed)",
            device_id,
            summary.saved,
            summary.failed
        );
        self.inner.emit(SessionEvent::Import(
            ImportProgress::new(device_id, ImportStatus::Saved, summary.saved)
                .with_failed(summary.failed),
        ));
        Ok(summary)
    }

    /// Frames buffered for a device (0 without a session)
    pub fn import_count(&self, device_id: &str) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.imports.get(device_id).map(|s| s.messages.len()))
            .unwrap_or(0)
    }

    pub fn import_status(&self, device_id: &str) -> Option<ImportSnapshot> {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.imports.get(device_id).map(|s| snapshot(device_id, s)))
    }

    // ----- Audition thru -----

    /// Route channel-voice messages from the most relevant input to `output_id`
    /// until stopped or expired. Replaces any running thru session.
    pub fn start_thru(&self, output_id: &str, options: ThruOptions) -> Result<ThruStatusInfo> {
        self.stop_thru();
        let duration_ms = clamp_duration(options.duration_ms);

        let input_id = {
            let state = self.inner.lock()?;
            let window = Duration::from_millis(ACTIVE_INPUT_WINDOW_MS);
            state
                .last_active
                .as_ref()
                .filter(|(_, at)| at.elapsed() <= window)
                .map(|(id, _)| id.clone())
                .or_else(|| state.pairings.get(output_id).map(|p| p.input_id.clone()))
        }
        .ok_or_else(|| AtlasError::NotFound(format!("no input to route to {}", output_id)))?;

        self.inner.transport.open(output_id, PortKind::Output)?;
        self.inner.transport.open(&input_id, PortKind::Input)?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |message: &InboundMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.forward_thru(generation, message);
            }
        });
        let token = self.inner.transport.on_message(&input_id, handler)?;

        let weak = Arc::downgrade(&self.inner);
        let cancel = match spawn_expiry_timer(duration_ms, move || {
            if let Some(inner) = weak.upgrade() {
                inner.end_thru(Some(generation), ThruStatus::Expired);
            }
        }) {
            Ok(cancel) => cancel,
            Err(e) => {
                self.inner.transport.off_message(&input_id, token);
                return Err(e);
            }
        };

        let session = ThruSession {
            generation,
            input_id: input_id.clone(),
            output_id: output_id.to_string(),
            started_at: now_timestamp(),
            duration_ms,
            token,
            cancel: Some(cancel),
        };
        let status = session.status();
        let displaced = std::mem::replace(&mut self.inner.lock()?.thru, Some(session));
        if let Some(mut displaced) = displaced {
            // Another start raced in between stop and here
            displaced.cancel_timer();
            self.inner.transport.off_message(&displaced.input_id, displaced.token);
        }

        log::info!("Thru {} -> {} for {} ms", input_id, output_id, duration_ms);
        self.inner
            .emit(SessionEvent::Thru(ThruEvent::new(output_id, input_id, ThruStatus::Started)));
        Ok(status)
    }

    /// Cancel the expiry timer and remove the forwarding listener. Returns
    /// false when no thru session was running.
    pub fn stop_thru(&self) -> bool {
        self.inner.end_thru(None, ThruStatus::Stopped)
    }

    pub fn thru_status(&self) -> ThruStatusInfo {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.thru.as_ref().map(ThruSession::status))
            .unwrap_or_else(ThruStatusInfo::inactive)
    }

    #[cfg(test)]
    pub(crate) fn current_thru_generation(&self) -> Option<u64> {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.thru.as_ref().map(|t| t.generation))
    }

    /// Run the expiry path for one generation, as the timer would
    #[cfg(test)]
    pub(crate) fn expire_thru_generation(&self, generation: u64) -> bool {
        self.inner.end_thru(Some(generation), ThruStatus::Expired)
    }

    // ----- Shutdown -----

    /// Stop thru, drop capture listeners and close every pairing
    pub fn shutdown(&self) {
        self.stop_thru();

        let (imports, outputs) = match self.inner.lock() {
            Ok(mut state) => {
                let imports: Vec<ImportSession> =
                    state.imports.drain().map(|(_, session)| session).collect();
                let outputs: Vec<String> = state.pairings.keys().cloned().collect();
                (imports, outputs)
            }
            Err(_) => return,
        };
        for session in imports {
            if let Some(token) = session.token {
                self.inner.transport.off_message(&session.input_id, token);
            }
        }
        for output_id in outputs {
            if let Err(e) = self.disconnect(&output_id) {
                log::warn!("Disconnect {} during shutdown failed: {}", output_id, e);
            }
        }
    }
}

impl Drop for DeviceSessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn snapshot(device_id: &str, session: &ImportSession) -> ImportSnapshot {
    ImportSnapshot {
        device_id: device_id.to_string(),
        device_name: session.device_name.clone(),
        started: session.started,
        count: session.messages.len(),
        created_at: session.created_at.clone(),
    }
}

// ----- Listener side -----

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| AtlasError::Other("session state poisoned".to_string()))
    }

    /// Deliver an event; a panicking sink is logged and ignored
    fn emit(&self, event: SessionEvent) {
        let sink = &self.events;
        if catch_unwind(AssertUnwindSafe(|| sink.emit(&event))).is_err() {
            log::warn!("Session event sink panicked");
        }
    }

    fn handle_activity(&self, output_id: &str, message: &InboundMessage) {
        let (input_id, delta_time_us) = {
            let Ok(mut state) = self.lock() else { return };
            let pairing = match state.pairings.get_mut(output_id) {
                Some(p) if p.input_id == message.port_id => p,
                _ => return,
            };

            let delta = pairing
                .last_message_us
                .map_or(0, |previous| message.timestamp_us.saturating_sub(previous));
            pairing.last_message_us = Some(message.timestamp_us);
            if pairing.state != VerificationState::Verified {
                pairing.state = VerificationState::Verified;
                pairing.verified_at = Some(now_timestamp());
                log::info!("Verified {} via {}", output_id, pairing.input_id);
            }
            if let Some(identity) = parse_identity_reply(&message.bytes) {
                log::info!(
                    "{} identifies as manufacturer {} family {:04X} model {:04X}",
                    output_id,
                    identity.manufacturer_hex(),
                    identity.family,
                    identity.model
                );
                pairing.identity = Some(identity);
            }
            let input_id = pairing.input_id.clone();
            state.last_active = Some((input_id.clone(), Instant::now()));
            (input_id, delta)
        };

        self.emit(SessionEvent::Activity(MidiActivity {
            device_id: output_id.to_string(),
            input_id,
            delta_time_us,
            message: message.bytes.clone(),
            kind: classify(&message.bytes),
            ts: now_timestamp(),
        }));
    }

    fn handle_capture(&self, device_id: &str, message: &InboundMessage) {
        if !is_complete_sysex(&message.bytes) {
            return;
        }
        let count = {
            let Ok(mut state) = self.lock() else { return };
            match state.imports.get_mut(device_id) {
                Some(session) if session.started && session.input_id == message.port_id => {
                    session.messages.push(message.bytes.clone());
                    session.messages.len()
                }
                _ => return,
            }
        };

        self.emit(SessionEvent::Import(
            ImportProgress::new(device_id, ImportStatus::Capturing, count)
                .with_last_bytes(message.bytes.len()),
        ));
    }

    fn forward_thru(&self, generation: u64, message: &InboundMessage) {
        if !is_channel_voice(&message.bytes) {
            return;
        }
        let output_id = {
            let Ok(state) = self.lock() else { return };
            match state.thru.as_ref() {
                Some(t) if t.generation == generation && t.input_id == message.port_id => {
                    t.output_id.clone()
                }
                _ => return,
            }
        };
        if let Err(e) = self.transport.send(&output_id, &message.bytes) {
            log::warn!("Thru send to {} failed: {}", output_id, e);
        }
    }

    /// End the thru session. With a generation, only that session is ended so
    /// a late timer cannot stop its replacement.
    fn end_thru(&self, generation: Option<u64>, status: ThruStatus) -> bool {
        let session = {
            let Ok(mut state) = self.lock() else { return false };
            let matches = state
                .thru
                .as_ref()
                .map_or(false, |t| generation.map_or(true, |g| g == t.generation));
            if matches {
                state.thru.take()
            } else {
                None
            }
        };
        let Some(mut session) = session else {
            return false;
        };

        session.cancel_timer();
        self.transport.off_message(&session.input_id, session.token);
        log::info!(
            "Thru {} -> {} {:?}",
            session.input_id,
            session.output_id,
            status
        );
        self.emit(SessionEvent::Thru(ThruEvent::new(
            session.output_id,
            session.input_id,
            status,
        )));
        true
    }
}
