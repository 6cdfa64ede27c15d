//! The eleven-state TCP state machine.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Whether a sequence number is meaningful yet — i.e. the three-way handshake completed.
    /// RST handling and segment acceptance both gate on this.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent)
    }

    pub fn has_send_buffers(self) -> bool {
        !matches!(self, TcpState::Listen | TcpState::Closed)
    }
}
