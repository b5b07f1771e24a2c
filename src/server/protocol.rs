//! Relay wire protocol
//!
//! The only control message a client ever sends is the handshake line
//! `userId:<userId>:<channelId>:<role>`. Everything a broadcaster sends after
//! that is relayed verbatim, and the only control message the server sends is
//! the shutdown notice.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::relay::{Payload, Role};

/// Literal prefix every handshake line starts with
pub const HANDSHAKE_PREFIX: &str = "userId:";

/// Field delimiter inside a handshake line (never escaped)
pub const HANDSHAKE_DELIMITER: char = ':';

/// Number of delimited fields in a handshake line, including the tag
pub const HANDSHAKE_FIELDS: usize = 4;

// ============================================================================
// Error Types
// ============================================================================

/// Reasons a payload is not a usable handshake
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Binary payload is not a handshake")]
    NotText,

    #[error("Line does not start with \"{HANDSHAKE_PREFIX}\"")]
    MissingPrefix,

    #[error("Expected {HANDSHAKE_FIELDS} fields, got {0}")]
    FieldCount(usize),

    #[error("Unknown role: {0}")]
    UnknownRole(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Handshake
// ============================================================================

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcaster" => Ok(Role::Broadcaster),
            "listener" => Ok(Role::Listener),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

/// A decoded handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub user_id: String,
    pub channel_id: String,
    pub role: Role,
}

impl Handshake {
    /// Build a handshake
    pub fn new(user_id: impl Into<String>, channel_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            role,
        }
    }

    /// Decode a received payload
    ///
    /// Only text payloads are considered. Ids containing `:` shift the role
    /// out of position and are rejected with `FieldCount`; the format has no
    /// escaping.
    pub fn decode(payload: &Payload) -> ProtocolResult<Self> {
        match payload {
            Payload::Text(line) => Self::parse(line),
            Payload::Binary(_) => Err(ProtocolError::NotText),
        }
    }

    /// Parse a handshake line
    pub fn parse(line: &str) -> ProtocolResult<Self> {
        let line = line.trim();
        if !line.starts_with(HANDSHAKE_PREFIX) {
            return Err(ProtocolError::MissingPrefix);
        }

        let fields: Vec<&str> = line.split(HANDSHAKE_DELIMITER).collect();
        if fields.len() != HANDSHAKE_FIELDS {
            return Err(ProtocolError::FieldCount(fields.len()));
        }

        let role = fields[3].parse()?;
        Ok(Self::new(fields[1], fields[2], role))
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user {} on channel {} as {}",
            self.user_id, self.channel_id, self.role
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
