//! Error taxonomy for the transport (spec.md §7).
//!
//! The engine never unwinds out of its thread loops: every decoding path
//! returns a `Result`, and callers drop the offending packet on `Err` and
//! continue. This module only defines the vocabulary used along the way.

use std::io;
use thiserror::Error;

/// Socket-boundary error taxonomy, mapped from platform errnos by the
/// socket collaborator (`crate::socket`).
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum SocketError {
    #[error("socket not initialized")]
    NotInitialized,
    #[error("operation would block")]
    NotReady,
    #[error("peer disconnected")]
    Disconnected,
    #[error("connection refused")]
    Refused,
    #[error("socket already in use")]
    AlreadyUsed,
    #[error("already connected")]
    AlreadyConnected,
    #[error("too many open sockets")]
    TooManySockets,
    #[error("partial transfer")]
    Partial,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("unsuccessful")]
    Unsuccessful,
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => SocketError::NotReady,
            io::ErrorKind::ConnectionRefused => SocketError::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                SocketError::Disconnected
            }
            io::ErrorKind::AddrInUse => SocketError::AlreadyUsed,
            io::ErrorKind::InvalidInput => SocketError::InvalidArgument,
            _ => SocketError::Unsuccessful,
        }
    }
}

/// Errors produced while parsing or mutating a [`crate::packet::ProtocolPacket`] header.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum PacketError {
    #[error("buffer shorter than the header")]
    Truncated,
    #[error("packet is marked invalid after a failed read")]
    Invalid,
    #[error("correction-latency option applied without a client")]
    MissingClient,
    #[error("compressor rejected the payload")]
    Compression,
    #[error("payload exceeds the maximum uncompressed datagram size")]
    TooLarge,
}

/// Errors from the fragmentation / defragmentation engine (spec.md §4.2).
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum FragmentError {
    #[error("mtu too small to carry a single byte of payload")]
    MtuTooSmall,
    #[error("fragment group was discarded (duplicate or out-of-range fragment)")]
    GroupDiscarded,
}

/// Errors from the return-packet scheduler (spec.md §4.8).
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum ReturnPacketError {
    #[error("more than 65535 return events queued in one tick")]
    TooManyEvents,
}

/// Top level error returned by engine-facing, user-visible APIs
/// (`connect`/`disconnect`/`retrieve_mtu` futures, spec.md §7).
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum NetError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),
    #[error("return packet error: {0}")]
    ReturnPacket(#[from] ReturnPacketError),
    #[error("peer timed out")]
    Timeout,
    #[error("handshake refused: version mismatch")]
    VersionMismatch,
    #[error("handshake refused: protocol mismatch")]
    ProtocolMismatch,
    #[error("cryptographic operation failed")]
    Crypto,
    #[error("engine is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, NetError>;
