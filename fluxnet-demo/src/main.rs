//! Loopback client/server demo: starts both engines on localhost, drives the
//! handshake → MTU probe → DTLS handshake lifecycle through to `Connected`,
//! then sends one application packet end to end. Grounded in the teacher's
//! `t51server` binary crate, which likewise exists only to exercise its
//! sibling library from a `main` rather than to offer a real service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fluxnet::packet::ProtocolPacket;
use fluxnet::{Compressor, Lz4Compressor, NetClient, NetConfig, NetServer};

const VERSIONING: &str = "fluxnet-demo/1";
/// First identifier past the reserved internal range (spec.md §6.2:
/// application identifiers occupy the remainder of the 10-bit id space).
const APP_IDENTIFIER: u16 = 64;
const LOCAL_MTU: u16 = 1400;

fn main() {
    let logger = fluxnet::logging::build_logger(true);
    let config = NetConfig::default();
    let compressor: Arc<dyn Compressor> = Arc::new(Lz4Compressor);

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut server = NetServer::start(
        bind_addr,
        1,
        config.clone(),
        compressor.clone(),
        VERSIONING,
        LOCAL_MTU,
        logger.clone(),
    )
    .expect("server failed to bind");
    let server_addr = server.local_addr().expect("bound server socket has a local address");
    slog::info!(logger, "server listening"; "addr" => %server_addr);

    let mut client = NetClient::start(server_addr, config, compressor, LOCAL_MTU, logger.clone())
        .expect("client failed to bind");

    client.connect(VERSIONING).expect("handshake did not complete");

    let mtu = wait_for_mtu(&client);
    slog::info!(logger, "mtu negotiated"; "mtu" => mtu);

    let mut payload = ProtocolPacket::new(APP_IDENTIFIER, 0, 0);
    payload.append_payload(b"hello from the demo client");
    if !client.send(payload) {
        slog::warn!(logger, "client was not ready for more pending packets, application send dropped");
    }

    if let Some(received) = wait_for_flux(&server) {
        let text = String::from_utf8_lossy(received.packet.payload()).into_owned();
        slog::info!(logger, "server received application packet"; "peer" => %received.peer, "payload" => %text);
    } else {
        slog::warn!(logger, "timed out waiting for the application packet to arrive");
    }

    client.disconnect();
    client.stop();
    server.stop();
}

/// Polls `retrieve_mtu` until the handshake/MTU-probe exchange settles on a
/// non-zero value or a short timeout elapses.
fn wait_for_mtu(client: &NetClient) -> u16 {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(mtu) = client.retrieve_mtu() {
            if mtu != 0 {
                return mtu;
            }
        }
        if Instant::now() >= deadline {
            return 0;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn wait_for_flux(server: &NetServer) -> Option<fluxnet::FluxPacket> {
    let flux = server.flux(0)?;
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(packet) = flux.pop_packet() {
            return Some(packet);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
