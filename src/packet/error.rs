//! Error types for packet decoding
//!
//! Decode failures are always scoped to a single frame: the caller logs the
//! error, releases the buffer and moves on to the next frame.

use thiserror::Error;

/// Errors produced while decoding or encoding IPv4/TCP/UDP headers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// IP version other than 4
    #[error("Unsupported IP version {version}")]
    UnsupportedProtocol { version: u8 },

    /// Frame ends before the header it claims to carry
    #[error("Truncated {layer} header: need {needed} bytes, have {available}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        available: usize,
    },

    /// Header length field is smaller than the fixed header or larger than the frame
    #[error("Invalid {layer} header length {len}")]
    BadHeaderLength { layer: &'static str, len: usize },

    /// Caller-supplied output buffer cannot hold the encoded headers
    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

impl PacketError {
    /// Create a truncation error
    pub(crate) const fn truncated(layer: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            layer,
            needed,
            available,
        }
    }

    /// Create a header length error
    pub(crate) const fn bad_header_length(layer: &'static str, len: usize) -> Self {
        Self::BadHeaderLength { layer, len }
    }
}
