// Output/input pairing and verification state

use serde::Serialize;

use crate::midi::{DeviceIdentity, PortInfo, PortKind, SubscriptionToken};

/// `Disconnected -> Connecting -> ConnectedUnverified -> Verified`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VerificationState {
    Disconnected,
    Connecting,
    ConnectedUnverified,
    Verified,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub output_id: String,
    pub input_id: Option<String>,
    pub state: VerificationState,
    pub identity: Option<DeviceIdentity>,
    pub connected_at: Option<String>,
    pub verified_at: Option<String>,
}

impl ConnectionStatus {
    pub fn disconnected(output_id: &str) -> Self {
        Self {
            output_id: output_id.to_string(),
            input_id: None,
            state: VerificationState::Disconnected,
            identity: None,
            connected_at: None,
            verified_at: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.state == VerificationState::Verified
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Input to pair with; resolved from port names when absent
    pub input_id: Option<String>,
}

impl ConnectOptions {
    pub fn with_input(input_id: impl Into<String>) -> Self {
        Self {
            input_id: Some(input_id.into()),
        }
    }
}

/// Live pairing of one output with its reply input
pub(crate) struct Pairing {
    pub input_id: String,
    pub state: VerificationState,
    pub identity: Option<DeviceIdentity>,
    pub connected_at: String,
    pub verified_at: Option<String>,
    pub token: Option<SubscriptionToken>,
    /// Transport clock of the last message seen on the input
    pub last_message_us: Option<u64>,
}

impl Pairing {
    pub fn new(input_id: String, connected_at: String) -> Self {
        Self {
            input_id,
            state: VerificationState::Connecting,
            identity: None,
            connected_at,
            verified_at: None,
            token: None,
            last_message_us: None,
        }
    }

    pub fn status(&self, output_id: &str) -> ConnectionStatus {
        ConnectionStatus {
            output_id: output_id.to_string(),
            input_id: Some(self.input_id.clone()),
            state: self.state,
            identity: self.identity.clone(),
            connected_at: Some(self.connected_at.clone()),
            verified_at: self.verified_at.clone(),
        }
    }
}

/// Pick the input to pair with an output: an explicit id wins, then the input
/// whose port name equals the output's port name, then the output id itself.
pub fn resolve_input(output_id: &str, explicit: Option<&str>, ports: &[PortInfo]) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }

    let output_name = ports
        .iter()
        .find(|p| p.kind == PortKind::Output && p.id == output_id)
        .map(|p| p.name.as_str());
    if let Some(name) = output_name {
        if let Some(input) = ports.iter().find(|p| p.kind == PortKind::Input && p.name == name) {
            return input.id.clone();
        }
    }

    output_id.to_string()
}
