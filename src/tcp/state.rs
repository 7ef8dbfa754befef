//! TCP connection states

use std::fmt;

/// State of a terminated client connection (RFC 793 names).
///
/// Only the passive-open half of the diagram is reachable: connections start
/// in `Listen` and never enter `SynSent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynReceived,
    Established,
    /// Peer sent FIN; we may still write
    CloseWait,
    /// We sent FIN; awaiting its ACK and the peer's FIN
    FinWait1,
    /// Our FIN is acknowledged; awaiting the peer's FIN
    FinWait2,
    /// Simultaneous close; awaiting the ACK of our FIN
    Closing,
    /// Peer closed first, we closed after; awaiting the final ACK
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which payload may be sent to the client
    #[must_use]
    pub const fn can_write(self) -> bool {
        matches!(self, Self::SynReceived | Self::Established | Self::CloseWait)
    }

    /// States in which the client will send no more payload
    #[must_use]
    pub const fn is_read_closed(self) -> bool {
        matches!(
            self,
            Self::CloseWait | Self::LastAck | Self::Closing | Self::TimeWait | Self::Closed
        )
    }

    /// States after which no further segments are expected
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Closed | Self::TimeWait)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
