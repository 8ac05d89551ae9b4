use std::fmt::{Display, Formatter};

/// Errors that are scoped to a single connection or a single datagram. None of them is fatal
///  to the endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NudpError {
    /// bad magic, version or packet type, or a datagram shorter than the header. The datagram
    ///  is dropped without reply.
    MalformedPacket(String),
    /// a packet that is valid on the wire but unexpected in the connection's current state, or
    ///  a sequence number outside the acceptable window. Dropped silently.
    ProtocolViolation(String),
    /// the SYN attempt limit was reached while the connection was still unconnected
    HandshakeExhausted,
    /// the connection was closed locally or by the peer before the operation completed
    ConnectionClosed,
    /// the socket accepted only part of a datagram
    ShortWrite { expected: usize, written: usize },
    /// any other socket-level send failure
    Transport(String),
    EmptyMessage,
    AlreadyListening,
}

impl Display for NudpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NudpError::MalformedPacket(reason) => write!(f, "malformed packet: {}", reason),
            NudpError::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
            NudpError::HandshakeExhausted => write!(f, "connect exhausted all SYN attempts"),
            NudpError::ConnectionClosed => write!(f, "connection closed"),
            NudpError::ShortWrite { expected, written } => write!(f, "short write: {} of {} bytes sent", written, expected),
            NudpError::Transport(msg) => write!(f, "transport error: {}", msg),
            NudpError::EmptyMessage => write!(f, "cannot send empty message"),
            NudpError::AlreadyListening => write!(f, "endpoint is already listening"),
        }
    }
}

impl std::error::Error for NudpError {}

pub type NudpResult<T> = Result<T, NudpError>;
