//! `fluxnet` — reliable, ordered, encrypted message transport over
//! unreliable UDP datagrams.
//!
//! The public surface is split the way the transport itself is: wire
//! format and per-peer bookkeeping (`header`, `packet`, `reorder`,
//! `cache`, `fragment`, `latency`, `client`, `flux`), the collaborators the
//! engine drives but doesn't own (`socket`, `dtls`, `compressor`), and the
//! two-thread engines that tie it all together (`engine::server`,
//! `engine::client`), grounded in the original source's `C_server`/
//! `C_netClient` split (`examples/original_source/`).

pub mod cache;
pub mod client;
pub mod command;
pub mod compressor;
pub mod config;
pub mod dtls;
pub mod engine;
pub mod error;
pub mod flux;
pub mod fragment;
pub mod header;
pub mod identity;
pub mod latency;
pub mod logging;
pub mod packet;
pub mod reorder;
pub mod returnpacket;
pub mod socket;
pub mod time;

pub use client::{Client, ClientStatus, NetworkStatus, Target};
pub use command::{Command, CommandQueue, Completion};
pub use compressor::{Compressor, IdentityCompressor, Lz4Compressor};
pub use config::NetConfig;
pub use engine::client::NetClient;
pub use engine::server::NetServer;
pub use error::{FragmentError, NetError, PacketError, Result, ReturnPacketError, SocketError};
pub use flux::{ClientTable, Flux, FluxPacket};
pub use header::{Flags, HeaderView, InternalId};
pub use identity::{Identity, IpAddr, Port};
pub use packet::{Packet, ProtocolPacket};
