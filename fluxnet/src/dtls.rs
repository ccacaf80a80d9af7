//! DTLS collaborator (spec.md §1 excluded collaborator, §9.7): the engine
//! never implements its own cryptography, it only drives a real DTLS
//! library through a narrow seam. Grounded in the original source's
//! `private/fge_crypt.hpp` (`CryptClientInit`/`CryptServerCreate`/
//! `CryptEncrypt`/`CryptDecrypt` free functions keyed on an opaque
//! per-client context), re-expressed as a trait object instead of a `void*`
//! context handle.
//!
//! A `DtlsSession` never touches the socket directly — this crate owns all
//! datagram I/O (spec.md §1 Non-goals) — so the handshake is driven by
//! feeding and draining an in-memory BIO pair, the way `openssl`'s
//! `SslStream` is normally wrapped around a `TcpStream` but here wrapped
//! around a plain in-memory duplex buffer instead.

use std::io::{self, Read, Write};

use openssl::ssl::{HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslMethod, SslStream};

#[derive(Debug)]
pub enum DtlsError {
    Context(openssl::error::ErrorStack),
    Handshake,
    Io(io::Error),
}

impl std::fmt::Display for DtlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DtlsError::Context(e) => write!(f, "dtls context error: {}", e),
            DtlsError::Handshake => write!(f, "dtls handshake failed"),
            DtlsError::Io(e) => write!(f, "dtls io error: {}", e),
        }
    }
}

impl std::error::Error for DtlsError {}

impl From<openssl::error::ErrorStack> for DtlsError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        DtlsError::Context(e)
    }
}

/// An in-memory duplex buffer standing in for the socket DTLS would
/// normally own directly. The engine pumps received ciphertext in via
/// `feed` and drains pending outbound ciphertext via `take_outbound`; this
/// is what `SslStream` reads from / writes to.
#[derive(Default)]
struct MemoryDuplex {
    inbound: std::collections::VecDeque<u8>,
    outbound: Vec<u8>,
}

impl Read for MemoryDuplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.inbound.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MemoryDuplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum State {
    Handshaking(MidHandshakeSslStream<MemoryDuplex>),
    Established(SslStream<MemoryDuplex>),
    Failed,
}

/// Which side of the handshake this session plays (spec.md §9.7; the
/// original's `CryptClientInit`/`CryptServerInit` split).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

/// One peer's DTLS handshake/record state. Owns no socket; the engine
/// feeds it received datagrams and asks it for outbound ones.
pub struct DtlsSession {
    state: State,
}

impl DtlsSession {
    pub fn new(context: &SslContext, role: Role) -> Result<DtlsSession, DtlsError> {
        let ssl = Ssl::new(context)?;
        let stream = MemoryDuplex::default();
        let result = match role {
            Role::Client => ssl.connect(stream),
            Role::Server => ssl.accept(stream),
        };
        let state = match result {
            Ok(established) => State::Established(established),
            Err(HandshakeError::WouldBlock(mid)) => State::Handshaking(mid),
            Err(_) => return Err(DtlsError::Handshake),
        };
        Ok(DtlsSession { state })
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    /// Feeds a received DTLS datagram into the session and advances the
    /// handshake if one is in progress.
    pub fn feed_inbound(&mut self, data: &[u8]) -> Result<(), DtlsError> {
        let duplex = match &mut self.state {
            State::Handshaking(mid) => mid.get_mut(),
            State::Established(stream) => stream.get_mut(),
            State::Failed => return Err(DtlsError::Handshake),
        };
        duplex.inbound.extend(data.iter().copied());
        self.pump_handshake()
    }

    fn pump_handshake(&mut self) -> Result<(), DtlsError> {
        if let State::Handshaking(_) = &self.state {
            let State::Handshaking(mid) = std::mem::replace(&mut self.state, State::Failed) else {
                unreachable!()
            };
            self.state = match mid.handshake() {
                Ok(established) => State::Established(established),
                Err(HandshakeError::WouldBlock(mid)) => State::Handshaking(mid),
                Err(_) => return Err(DtlsError::Handshake),
            };
        }
        Ok(())
    }

    /// Drains whatever ciphertext the session wants sent to the peer right
    /// now (handshake flight or encrypted application data already queued).
    pub fn take_outbound(&mut self) -> Vec<u8> {
        let duplex = match &mut self.state {
            State::Handshaking(mid) => mid.get_mut(),
            State::Established(stream) => stream.get_mut(),
            State::Failed => return Vec::new(),
        };
        std::mem::take(&mut duplex.outbound)
    }

    /// Encrypts `plaintext` for transmission. Only valid once established
    /// (spec.md §9.7); the engine checks `is_established` before marking
    /// packets for encryption.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, DtlsError> {
        let State::Established(stream) = &mut self.state else {
            return Err(DtlsError::Handshake);
        };
        stream.write_all(plaintext).map_err(DtlsError::Io)?;
        Ok(self.take_outbound())
    }

    /// Decrypts a received DTLS record, returning the plaintext payload.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, DtlsError> {
        self.feed_inbound(ciphertext)?;
        let State::Established(stream) = &mut self.state else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(DtlsError::Io(e)),
            }
        }
        Ok(out)
    }
}

/// Builds the shared DTLS context used by both `Role::Client` and
/// `Role::Server` sessions (spec.md §9.7). Certificate and cipher
/// configuration are left to the embedding application, the same way the
/// original leaves key material to `CryptInfo` rather than baking it in.
pub fn build_context() -> Result<SslContext, DtlsError> {
    let builder = SslContext::builder(SslMethod::dtls())?;
    Ok(builder.build())
}
