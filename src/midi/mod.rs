// MIDI transport and message helpers

pub mod transport;
pub mod virtual_port;
#[cfg(feature = "native-midi")]
pub mod native;

use serde::{Deserialize, Serialize};

use crate::constants::{SYSEX_END, SYSEX_START};
use crate::error::{AtlasError, Result};

pub use transport::{
    InboundMessage, ListenerRegistry, MessageHandler, MidiTransport, PortInfo, PortKind,
    Provider, ProviderKind, SubscriptionToken,
};
pub use virtual_port::VirtualTransport;
#[cfg(feature = "native-midi")]
pub use native::MidirTransport;

/// How an inbound message is reported in activity events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Midi,
    Sysex,
    IdentityReply,
}

/// `F0 ... F7` with at least the two framing bytes
pub fn is_complete_sysex(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == SYSEX_START && bytes[bytes.len() - 1] == SYSEX_END
}

/// Reject anything that is not a framed SysEx message
pub fn validate_sysex(bytes: &[u8]) -> Result<()> {
    if !is_complete_sysex(bytes) {
        return Err(AtlasError::InvalidInput(format!(
            "SysEx must start with F0 and end with F7 (got {})",
            preview_hex(bytes)
        )));
    }
    Ok(())
}

/// Note off/on, poly pressure, control change, channel pressure, pitch bend.
/// Program change (Cx) is excluded.
pub fn is_channel_voice(bytes: &[u8]) -> bool {
    matches!(
        bytes.first().map(|status| status >> 4),
        Some(0x8 | 0x9 | 0xA | 0xB | 0xD | 0xE)
    )
}

/// `F0 7E <device> 06 02 ...`
pub fn is_identity_reply(bytes: &[u8]) -> bool {
    bytes.len() >= 6
        && bytes[0] == SYSEX_START
        && bytes[1] == 0x7E
        && bytes[3] == 0x06
        && bytes[4] == 0x02
}

/// Fields of a Universal Non-realtime Identity Reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// One byte, or three when the first is 00
    pub manufacturer_id: Vec<u8>,
    pub family: u16,
    pub model: u16,
    pub version: [u8; 4],
}

impl DeviceIdentity {
    pub fn manufacturer_hex(&self) -> String {
        to_hex(&self.manufacturer_id)
    }
}

pub fn parse_identity_reply(bytes: &[u8]) -> Option<DeviceIdentity> {
    if !is_identity_reply(bytes) || !is_complete_sysex(bytes) {
        return None;
    }
    let body = &bytes[5..bytes.len() - 1];
    let (manufacturer_id, rest) = match body.first()? {
        0x00 if body.len() >= 3 => (body[..3].to_vec(), &body[3..]),
        0x00 => return None,
        id => (vec![*id], &body[1..]),
    };
    if rest.len() < 8 {
        return None;
    }
    // 14-bit values, LSB first
    let family = rest[0] as u16 | (rest[1] as u16) << 7;
    let model = rest[2] as u16 | (rest[3] as u16) << 7;
    Some(DeviceIdentity {
        manufacturer_id,
        family,
        model,
        version: [rest[4], rest[5], rest[6], rest[7]],
    })
}

/// Split a buffer that may hold several concatenated dumps into single
/// `F0 ... F7` frames. Bytes outside a frame and unterminated frames are dropped.
pub fn split_sysex_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    for &b in bytes {
        if b == SYSEX_START {
            current = Some(vec![b]);
            continue;
        }
        if let Some(frame) = current.as_mut() {
            frame.push(b);
            if b == SYSEX_END {
                if let Some(done) = current.take() {
                    frames.push(done);
                }
            }
        }
    }
    frames
}

pub fn classify(bytes: &[u8]) -> ActivityKind {
    if is_identity_reply(bytes) {
        ActivityKind::IdentityReply
    } else if bytes.first() == Some(&SYSEX_START) {
        ActivityKind::Sysex
    } else {
        ActivityKind::Midi
    }
}

/// Space-separated uppercase hex
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn preview_hex(bytes: &[u8]) -> String {
    const MAX: usize = 8;
    if bytes.is_empty() {
        return "empty message".to_string();
    }
    if bytes.len() <= MAX {
        return to_hex(bytes);
    }
    format!("{} ... ({} bytes)", to_hex(&bytes[..MAX]), bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysex_framing() {
        assert!(is_complete_sysex(&[0xF0, 0xF7]));
        assert!(is_complete_sysex(&[0xF0, 0x43, 0x10, 0xF7]));
        assert!(!is_complete_sysex(&[0xF0, 0x43, 0x12]));
        assert!(!is_complete_sysex(&[0xF0]));
        assert!(!is_complete_sysex(&[]));
        assert!(matches!(validate_sysex(&[0x90, 0x40, 0x7F]), Err(AtlasError::InvalidInput(_))));
    }

    #[test]
    fn test_channel_voice_filter() {
        assert!(is_channel_voice(&[0x90, 60, 100]));
        assert!(is_channel_voice(&[0x81, 60, 0]));
        assert!(is_channel_voice(&[0xB0, 1, 64]));
        assert!(is_channel_voice(&[0xE0, 0, 64]));
        assert!(is_channel_voice(&[0xD3, 20]));
        assert!(is_channel_voice(&[0xA0, 60, 10]));
        assert!(!is_channel_voice(&[0xC0, 5]));
        assert!(!is_channel_voice(&[0xF0, 0x43, 0xF7]));
        assert!(!is_channel_voice(&[0xF8]));
        assert!(!is_channel_voice(&[0xF2, 0, 0]));
        assert!(!is_channel_voice(&[]));
    }

    #[test]
    fn test_parse_identity_reply() {
        // Roland, family 0x0E 0x03, model 0x00 0x00
        let reply = [0xF0, 0x7E, 0x10, 0x06, 0x02, 0x41, 0x0E, 0x03, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0xF7];
        assert_eq!(classify(&reply), ActivityKind::IdentityReply);
        let identity = parse_identity_reply(&reply).unwrap();
        assert_eq!(identity.manufacturer_id, vec![0x41]);
        assert_eq!(identity.family, 0x0E | (0x03 << 7));
        assert_eq!(identity.model, 0);
        assert_eq!(identity.version, [0x00, 0x03, 0x00, 0x00]);
        assert_eq!(identity.manufacturer_hex(), "41");

        // Extended manufacturer id
        let extended = [0xF0, 0x7E, 0x7F, 0x06, 0x02, 0x00, 0x20, 0x32, 0x01, 0x00, 0x02, 0x00, 1, 2, 3, 4, 0xF7];
        let identity = parse_identity_reply(&extended).unwrap();
        assert_eq!(identity.manufacturer_id, vec![0x00, 0x20, 0x32]);
        assert_eq!(identity.version, [1, 2, 3, 4]);

        assert!(parse_identity_reply(&[0xF0, 0x7E, 0x10, 0x06, 0x02, 0x41, 0xF7]).is_none());
    }

    #[test]
    fn test_split_concatenated_dumps() {
        let buffer = [0xF0, 0x41, 0x01, 0xF7, 0x00, 0xF0, 0x41, 0x02, 0xF7, 0xF0, 0x41];
        let frames = split_sysex_frames(&buffer);
        assert_eq!(frames, vec![vec![0xF0, 0x41, 0x01, 0xF7], vec![0xF0, 0x41, 0x02, 0xF7]]);
    }

    #[test]
    fn test_classify_and_hex() {
        assert_eq!(classify(&[0x90, 60, 1]), ActivityKind::Midi);
        assert_eq!(classify(&[0xF0, 0x43, 0xF7]), ActivityKind::Sysex);
        assert_eq!(to_hex(&[0xF0, 0x7E, 0x0A]), "F0 7E 0A");
        assert_eq!(serde_json::to_value(ActivityKind::IdentityReply).unwrap(), "identity_reply");
    }
}
