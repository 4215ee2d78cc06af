//! Interaction status codes returned by remote nodes.

use serde::{Deserialize, Serialize};

/// A status code carried in report entries and command responses.
///
/// Only the codes the shadow reacts to get their own variant; anything else
/// travels through `Other` untouched so it can be logged and surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failure,
    UnsupportedEndpoint,
    UnsupportedCommand,
    UnsupportedAttribute,
    UnsupportedCluster,
    ResourceExhausted,
    Timeout,
    Busy,
    Other(u8),
}

impl Status {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Status::Success,
            0x01 => Status::Failure,
            0x7F => Status::UnsupportedEndpoint,
            0x81 => Status::UnsupportedCommand,
            0x86 => Status::UnsupportedAttribute,
            0x89 => Status::ResourceExhausted,
            0x94 => Status::Timeout,
            0x9C => Status::Busy,
            0xC3 => Status::UnsupportedCluster,
            other => Status::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::Failure => 0x01,
            Status::UnsupportedEndpoint => 0x7F,
            Status::UnsupportedCommand => 0x81,
            Status::UnsupportedAttribute => 0x86,
            Status::ResourceExhausted => 0x89,
            Status::Timeout => 0x94,
            Status::Busy => 0x9C,
            Status::UnsupportedCluster => 0xC3,
            Status::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    /// The one code that earns a command invocation another attempt.
    pub fn is_busy(&self) -> bool {
        matches!(self, Status::Busy)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Other(code) => write!(f, "status {:#04x}", code),
            known => write!(f, "{:?} ({:#04x})", known, known.code()),
        }
    }
}
