//! Property identifiers and the system command wire format.
//!
//! System commands are carried in frames on endpoint 0:
//!
//! ```text
//! +---------+---------+-------------+-----------+
//! | Command | Seq     | Length      | Payload   |
//! | 1 byte  | 1 byte  | 2 bytes LE  | n bytes   |
//! +---------+---------+-------------+-----------+
//! ```
//!
//! Property commands put the 4-byte LE property id first in the payload,
//! followed by the property value.

use thiserror::Error;

const CMD_NOOP: u8 = 0x00;
const CMD_RESET: u8 = 0x01;
const CMD_PROP_GET: u8 = 0x02;
const CMD_PROP_SET: u8 = 0x03;
const CMD_PROP_IS: u8 = 0x04;

/// Base of the per-endpoint state property range.
const PROP_ENDPOINT_STATE_BASE: u32 = 0x1000;

/// Properties exposed by the secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyId {
    /// Link protocol version.
    ProtocolVersion,
    /// Capability bitmask.
    Capabilities,
    /// Bootloader information.
    BootloaderInfo,
    /// Secondary application version.
    SecondaryVersion,
    /// Largest frame payload the secondary can receive.
    RxCapability,
    /// Cause of the secondary's last reset.
    LastResetCause,
    /// Lifecycle state of one endpoint on the secondary.
    EndpointState(u8),
}

impl PropertyId {
    /// 4-byte wire id.
    pub fn to_u32(self) -> u32 {
        match self {
            PropertyId::ProtocolVersion => 0x01,
            PropertyId::Capabilities => 0x02,
            PropertyId::BootloaderInfo => 0x03,
            PropertyId::SecondaryVersion => 0x04,
            PropertyId::RxCapability => 0x05,
            PropertyId::LastResetCause => 0x06,
            PropertyId::EndpointState(id) => PROP_ENDPOINT_STATE_BASE + id as u32,
        }
    }

    /// Parse a 4-byte wire id.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0x01 => Some(PropertyId::ProtocolVersion),
            0x02 => Some(PropertyId::Capabilities),
            0x03 => Some(PropertyId::BootloaderInfo),
            0x04 => Some(PropertyId::SecondaryVersion),
            0x05 => Some(PropertyId::RxCapability),
            0x06 => Some(PropertyId::LastResetCause),
            raw if (PROP_ENDPOINT_STATE_BASE..PROP_ENDPOINT_STATE_BASE + 256).contains(&raw) => {
                Some(PropertyId::EndpointState((raw - PROP_ENDPOINT_STATE_BASE) as u8))
            }
            _ => None,
        }
    }
}

/// A command on the system endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCommand {
    /// Keep-alive, no payload.
    Noop {
        /// Command sequence number.
        seq: u8,
    },
    /// Ask the secondary to reset.
    Reset {
        /// Command sequence number.
        seq: u8,
    },
    /// Read a property.
    PropertyGet {
        /// Command sequence number, echoed in the reply.
        seq: u8,
        /// Property to read.
        prop: PropertyId,
    },
    /// Write a property.
    PropertySet {
        /// Command sequence number, echoed in the reply.
        seq: u8,
        /// Property to write.
        prop: PropertyId,
        /// New value.
        value: Vec<u8>,
    },
    /// A property value, either a reply or an unsolicited notification.
    PropertyIs {
        /// Sequence of the query this answers; 0 when unsolicited.
        seq: u8,
        /// Property carried.
        prop: PropertyId,
        /// Property value.
        value: Vec<u8>,
    },
}

/// Errors parsing system commands.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SystemError {
    /// The buffer does not hold a complete command.
    #[error("malformed system command")]
    Malformed,
    /// The command byte is not defined.
    #[error("unknown system command 0x{0:02x}")]
    UnknownCommand(u8),
    /// The property id is not defined.
    #[error("unknown property 0x{0:08x}")]
    UnknownProperty(u32),
}

impl SystemCommand {
    /// Serialize the command.
    pub fn encode(&self) -> Vec<u8> {
        let (cmd, seq, payload) = match self {
            SystemCommand::Noop { seq } => (CMD_NOOP, *seq, Vec::new()),
            SystemCommand::Reset { seq } => (CMD_RESET, *seq, Vec::new()),
            SystemCommand::PropertyGet { seq, prop } => {
                (CMD_PROP_GET, *seq, prop.to_u32().to_le_bytes().to_vec())
            }
            SystemCommand::PropertySet { seq, prop, value } => {
                let mut payload = prop.to_u32().to_le_bytes().to_vec();
                payload.extend_from_slice(value);
                (CMD_PROP_SET, *seq, payload)
            }
            SystemCommand::PropertyIs { seq, prop, value } => {
                let mut payload = prop.to_u32().to_le_bytes().to_vec();
                payload.extend_from_slice(value);
                (CMD_PROP_IS, *seq, payload)
            }
        };

        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.push(cmd);
        buf.push(seq);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Parse a command from a frame payload.
    pub fn decode(data: &[u8]) -> Result<Self, SystemError> {
        if data.len() < 4 {
            return Err(SystemError::Malformed);
        }
        let cmd = data[0];
        let seq = data[1];
        let len = u16::from_le_bytes([data[2], data[3]]) as usize;
        if data.len() != 4 + len {
            return Err(SystemError::Malformed);
        }
        let payload = &data[4..];

        let parse_prop = |payload: &[u8]| -> Result<(PropertyId, Vec<u8>), SystemError> {
            if payload.len() < 4 {
                return Err(SystemError::Malformed);
            }
            let raw = u32::from_le_bytes(payload[..4].try_into().unwrap());
            let prop = PropertyId::from_u32(raw).ok_or(SystemError::UnknownProperty(raw))?;
            Ok((prop, payload[4..].to_vec()))
        };

        match cmd {
            CMD_NOOP => Ok(SystemCommand::Noop { seq }),
            CMD_RESET => Ok(SystemCommand::Reset { seq }),
            CMD_PROP_GET => {
                let (prop, rest) = parse_prop(payload)?;
                if !rest.is_empty() {
                    return Err(SystemError::Malformed);
                }
                Ok(SystemCommand::PropertyGet { seq, prop })
            }
            CMD_PROP_SET => {
                let (prop, value) = parse_prop(payload)?;
                Ok(SystemCommand::PropertySet { seq, prop, value })
            }
            CMD_PROP_IS => {
                let (prop, value) = parse_prop(payload)?;
                Ok(SystemCommand::PropertyIs { seq, prop, value })
            }
            other => Err(SystemError::UnknownCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_id_roundtrip() {
        let props = [
            PropertyId::ProtocolVersion,
            PropertyId::Capabilities,
            PropertyId::BootloaderInfo,
            PropertyId::SecondaryVersion,
            PropertyId::RxCapability,
            PropertyId::LastResetCause,
            PropertyId::EndpointState(0),
            PropertyId::EndpointState(14),
            PropertyId::EndpointState(255),
        ];
        for prop in props {
            assert_eq!(PropertyId::from_u32(prop.to_u32()), Some(prop));
        }
        assert_eq!(PropertyId::from_u32(0xDEAD_0000), None);
    }

    #[test]
    fn test_command_roundtrip() {
        let commands = [
            SystemCommand::Noop { seq: 1 },
            SystemCommand::Reset { seq: 2 },
            SystemCommand::PropertyGet {
                seq: 3,
                prop: PropertyId::EndpointState(4),
            },
            SystemCommand::PropertySet {
                seq: 4,
                prop: PropertyId::Capabilities,
                value: vec![0xFF, 0x00],
            },
            SystemCommand::PropertyIs {
                seq: 5,
                prop: PropertyId::LastResetCause,
                value: 3u32.to_le_bytes().to_vec(),
            },
        ];
        for cmd in commands {
            assert_eq!(SystemCommand::decode(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut bytes = SystemCommand::Noop { seq: 0 }.encode();
        bytes[2] = 10; // claims a payload that is not there
        assert_eq!(SystemCommand::decode(&bytes), Err(SystemError::Malformed));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let bytes = vec![0x7F, 0, 0, 0];
        assert_eq!(
            SystemCommand::decode(&bytes),
            Err(SystemError::UnknownCommand(0x7F))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_property() {
        let mut payload = 0xDEAD_0000u32.to_le_bytes().to_vec();
        payload.push(0);
        let mut bytes = vec![CMD_PROP_IS, 1];
        bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&payload);
        assert_eq!(
            SystemCommand::decode(&bytes),
            Err(SystemError::UnknownProperty(0xDEAD_0000))
        );
    }
}
