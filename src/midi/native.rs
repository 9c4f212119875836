// Native MIDI 1.0 transport (midir)
// midir connections are owned by one "midi-ports" thread and driven through a
// command channel, so the transport handle itself is Send + Sync. Port ids are
// the OS port names.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::constants::MIDI_CLIENT_NAME;
use crate::error::{AtlasError, Result};
use super::transport::{
    InboundMessage, ListenerRegistry, MessageHandler, MidiTransport, PortInfo, PortKind,
    ProviderKind, SubscriptionToken,
};

enum Command {
    Discover(Sender<Result<Vec<PortInfo>>>),
    Open {
        port_id: String,
        kind: PortKind,
        reply: Sender<Result<()>>,
    },
    Close {
        port_id: String,
        kind: PortKind,
        reply: Sender<Result<()>>,
    },
    Send {
        port_id: String,
        bytes: Vec<u8>,
        reply: Sender<Result<()>>,
    },
    Shutdown,
}

pub struct MidirTransport {
    commands: Mutex<Sender<Command>>,
    listeners: Arc<ListenerRegistry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MidirTransport {
    pub fn new() -> Result<Self> {
        let listeners = Arc::new(ListenerRegistry::new());
        let (tx, rx) = mpsc::channel();

        // Native connections are created and dropped on the port thread only
        let worker_listeners = Arc::clone(&listeners);
        let handle = std::thread::Builder::new()
            .name("midi-ports".to_string())
            .spawn(move || {
                let worker = PortWorker {
                    inputs: HashMap::new(),
                    outputs: HashMap::new(),
                    listeners: worker_listeners,
                };
                worker.run(rx)
            })?;

        log::info!("Native MIDI transport started");
        Ok(Self {
            commands: Mutex::new(tx),
            listeners,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn call<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::channel();
        {
            let commands = self
                .commands
                .lock()
                .map_err(|_| AtlasError::Transport("MIDI command channel poisoned".to_string()))?;
            commands
                .send(make(reply))
                .map_err(|_| AtlasError::Transport("MIDI port thread has stopped".to_string()))?;
        }
        response
            .recv()
            .map_err(|_| AtlasError::Transport("MIDI port thread has stopped".to_string()))?
    }
}

impl Drop for MidirTransport {
    fn drop(&mut self) {
        if let Ok(commands) = self.commands.lock() {
            let _ = commands.send(Command::Shutdown);
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl MidiTransport for MidirTransport {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Midi1
    }

    fn query_supported(&self) -> bool {
        MidiInput::new(MIDI_CLIENT_NAME).is_ok() && MidiOutput::new(MIDI_CLIENT_NAME).is_ok()
    }

    fn discover(&self) -> Result<Vec<PortInfo>> {
        self.call(Command::Discover)
    }

    fn open(&self, port_id: &str, kind: PortKind) -> Result<()> {
        self.call(|reply| Command::Open {
            port_id: port_id.to_string(),
            kind,
            reply,
        })
    }

    fn close(&self, port_id: &str, kind: PortKind) -> Result<()> {
        self.call(|reply| Command::Close {
            port_id: port_id.to_string(),
            kind,
            reply,
        })
    }

    fn send(&self, port_id: &str, bytes: &[u8]) -> Result<()> {
        self.call(|reply| Command::Send {
            port_id: port_id.to_string(),
            bytes: bytes.to_vec(),
            reply,
        })
    }

    fn on_message(&self, port_id: &str, handler: MessageHandler) -> Result<SubscriptionToken> {
        Ok(self.listeners.add(port_id, handler))
    }

    fn off_message(&self, port_id: &str, token: SubscriptionToken) -> bool {
        self.listeners.remove(port_id, token)
    }
}

// ----- Port thread -----

struct PortWorker {
    inputs: HashMap<String, MidiInputConnection<()>>,
    outputs: HashMap<String, MidiOutputConnection>,
    listeners: Arc<ListenerRegistry>,
}

impl PortWorker {
    fn run(mut self, commands: Receiver<Command>) {
        for command in commands {
            match command {
                Command::Discover(reply) => {
                    let _ = reply.send(discover_ports());
                }
                Command::Open { port_id, kind, reply } => {
                    let _ = reply.send(self.open(&port_id, kind));
                }
                Command::Close { port_id, kind, reply } => {
                    self.close(&port_id, kind);
                    let _ = reply.send(Ok(()));
                }
                Command::Send { port_id, bytes, reply } => {
                    let _ = reply.send(self.send(&port_id, &bytes));
                }
                Command::Shutdown => break,
            }
        }

        for (_, connection) in self.inputs.drain() {
            connection.close();
        }
        for (_, connection) in self.outputs.drain() {
            connection.close();
        }
        log::debug!("MIDI port thread stopped");
    }

    fn open(&mut self, port_id: &str, kind: PortKind) -> Result<()> {
        match kind {
            PortKind::Input if self.inputs.contains_key(port_id) => Ok(()),
            PortKind::Output if self.outputs.contains_key(port_id) => Ok(()),
            PortKind::Input => {
                let connection = self.connect_input(port_id)?;
                self.inputs.insert(port_id.to_string(), connection);
                log::info!("Opened MIDI input {}", port_id);
                Ok(())
            }
            PortKind::Output => {
                let connection = connect_output(port_id)?;
                self.outputs.insert(port_id.to_string(), connection);
                log::info!("Opened MIDI output {}", port_id);
                Ok(())
            }
        }
    }

    fn connect_input(&self, port_id: &str) -> Result<MidiInputConnection<()>> {
        let mut input = MidiInput::new(MIDI_CLIENT_NAME).map_err(transport_error)?;
        // Deliver SysEx, clock and active sensing too
        input.ignore(Ignore::None);
        let port = input
            .ports()
            .into_iter()
            .find(|port| input.port_name(port).ok().as_deref() == Some(port_id))
            .ok_or_else(|| AtlasError::NotFound(format!("MIDI input {}", port_id)))?;

        let listeners = Arc::clone(&self.listeners);
        let id = port_id.to_string();
        input
            .connect(
                &port,
                MIDI_CLIENT_NAME,
                move |timestamp_us, data, _| {
                    listeners.dispatch(&InboundMessage {
                        port_id: id.clone(),
                        bytes: data.to_vec(),
                        timestamp_us,
                    });
                },
                (),
            )
            .map_err(transport_error)
    }

    fn close(&mut self, port_id: &str, kind: PortKind) {
        match kind {
            PortKind::Input => {
                if let Some(connection) = self.inputs.remove(port_id) {
                    connection.close();
                    log::info!("Closed MIDI input {}", port_id);
                }
            }
            PortKind::Output => {
                if let Some(connection) = self.outputs.remove(port_id) {
                    connection.close();
                    log::info!("Closed MIDI output {}", port_id);
                }
            }
        }
    }

    fn send(&mut self, port_id: &str, bytes: &[u8]) -> Result<()> {
        let connection = self
            .outputs
            .get_mut(port_id)
            .ok_or_else(|| AtlasError::Transport(format!("output {} is not open", port_id)))?;
        connection.send(bytes).map_err(transport_error)
    }
}

fn connect_output(port_id: &str) -> Result<MidiOutputConnection> {
    let output = MidiOutput::new(MIDI_CLIENT_NAME).map_err(transport_error)?;
    let port = output
        .ports()
        .into_iter()
        .find(|port| output.port_name(port).ok().as_deref() == Some(port_id))
        .ok_or_else(|| AtlasError::NotFound(format!("MIDI output {}", port_id)))?;
    output
        .connect(&port, MIDI_CLIENT_NAME)
        .map_err(transport_error)
}

fn discover_ports() -> Result<Vec<PortInfo>> {
    let input = MidiInput::new(MIDI_CLIENT_NAME).map_err(transport_error)?;
    let output = MidiOutput::new(MIDI_CLIENT_NAME).map_err(transport_error)?;

    let mut ports: Vec<PortInfo> = input
        .ports()
        .iter()
        .filter_map(|port| input.port_name(port).ok())
        .map(|name| PortInfo {
            id: name.clone(),
            name,
            kind: PortKind::Input,
            manufacturer: None,
        })
        .collect();
    ports.extend(
        output
            .ports()
            .iter()
            .filter_map(|port| output.port_name(port).ok())
            .map(|name| PortInfo {
                id: name.clone(),
                name,
                kind: PortKind::Output,
                manufacturer: None,
            }),
    );
    Ok(ports)
}

fn transport_error(e: impl std::fmt::Display) -> AtlasError {
    AtlasError::Transport(e.to_string())
}
