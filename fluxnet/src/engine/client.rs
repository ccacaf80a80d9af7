//! Client-side reception/transmission engine (spec.md §4.9), grounded in
//! the original source's `ClientSideNetUdp` (`C_netClient.hpp`/
//! `C_netClient.cpp`): a single peer (the server), one `Client`, and the
//! command queue that drives the handshake/MTU/disconnect lifecycle from
//! the application thread.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use openssl::ssl::SslContext;

use crate::client::{Client, Target};
use crate::command::{Command, CommandQueue};
use crate::compressor::Compressor;
use crate::config::{NetConfig, DEFAULT_OFFSET_WINDOW, FULL_DATAGRAM_SIZE};
use crate::dtls::{self, DtlsSession, Role};
use crate::engine::{
    build_disconnect_packet, build_handshake_request, build_mtu_ask, build_mtu_final,
    build_return_packet, handle_control_packet, receive_into_client, service_transmission,
    ControlOutcome, Notifier, Running,
};
use crate::error::{NetError, SocketError};
use crate::flux::{Flux, FluxPacket};
use crate::header::HeaderView;
use crate::identity::Identity;
use crate::socket::NetSocket;

/// A running client-side engine connected to one server peer (spec.md §4.9
/// client engine).
pub struct NetClient {
    socket: Arc<NetSocket>,
    client: Arc<Mutex<Client>>,
    peer: Identity,
    flux: Arc<Flux>,
    commands: Arc<CommandQueue>,
    compressor: Arc<dyn Compressor>,
    dtls_context: Arc<SslContext>,
    config: NetConfig,
    local_mtu: u16,
    running: Running,
    notifier: Arc<Notifier>,
    logger: slog::Logger,
    reception: Option<JoinHandle<()>>,
    transmission: Option<JoinHandle<()>>,
}

impl NetClient {
    pub fn start(
        server_addr: SocketAddr,
        config: NetConfig,
        compressor: Arc<dyn Compressor>,
        local_mtu: u16,
        logger: slog::Logger,
    ) -> Result<NetClient, NetError> {
        let local_addr: SocketAddr = if server_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse().unwrap();
        let socket = Arc::new(NetSocket::bind(local_addr)?);
        socket.connect(server_addr)?;

        let peer = Identity::from(server_addr);
        let client = Arc::new(Mutex::new(Client::new(
            config.reorderer_capacity(),
            config.cache_max(),
            config.cache_retry_limit(),
            config.defragmenter_max_groups(),
            DEFAULT_OFFSET_WINDOW,
            config.status_timeout(),
            config.packet_return_rate(),
        )));
        let dtls_context = Arc::new(dtls::build_context().map_err(|_| NetError::Crypto)?);

        // A client-side engine starts its own DTLS session eagerly
        // (spec.md §4.6: "the client started DTLS at acknowledged"); it
        // simply sits idle, mid-handshake, until the server enters
        // `mtu-discovered` and the two sides start exchanging records.
        {
            let mut guard = client.lock().expect("client mutex poisoned");
            if let Ok(session) = DtlsSession::new(&dtls_context, Role::Client) {
                guard.dtls = Some(session);
            }
        }

        let flux = Arc::new(Flux::new(config.max_flux_packets()));
        let commands = Arc::new(CommandQueue::new());
        let running = Running::new();
        let notifier = Arc::new(Notifier::new());

        let mut engine = NetClient {
            socket,
            client,
            peer,
            flux,
            commands,
            compressor,
            dtls_context,
            config,
            local_mtu,
            running,
            notifier,
            logger,
            reception: None,
            transmission: None,
        };
        engine.spawn_threads();
        Ok(engine)
    }

    pub fn flux(&self) -> Arc<Flux> {
        self.flux.clone()
    }

    pub fn connect(&self, versioning: impl Into<String>) -> Result<(), NetError> {
        self.commands.connect(versioning).wait()
    }

    pub fn disconnect(&self) {
        self.commands.disconnect().wait()
    }

    pub fn retrieve_mtu(&self) -> Result<u16, NetError> {
        self.commands.retrieve_mtu().wait()
    }

    pub fn notify_transmission(&self) {
        self.notifier.notify();
    }

    /// Queues an application packet for delivery and wakes the
    /// transmission thread immediately rather than waiting for its next
    /// pacing tick. Returns `false` without queueing anything if the peer
    /// is not currently ready for more pending packets (spec.md §4.5
    /// backpressure: the ack cache is alarmed, or a previous packet is
    /// still sitting in the outbound queue).
    pub fn send(&self, packet: crate::packet::ProtocolPacket) -> bool {
        let mut guard = self.client.lock().expect("client mutex poisoned");
        if !guard.is_ready_for_more_pending() {
            return false;
        }
        guard.push_packet(packet);
        drop(guard);
        self.notify_transmission();
        true
    }

    pub fn stop(&mut self) {
        self.running.stop();
        self.notifier.notify();
        if let Some(handle) = self.reception.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.transmission.take() {
            let _ = handle.join();
        }
    }

    fn spawn_threads(&mut self) {
        self.reception = Some(self.spawn_reception());
        self.transmission = Some(self.spawn_transmission());
    }

    fn spawn_reception(&self) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let client = self.client.clone();
        let flux = self.flux.clone();
        let peer = self.peer;
        let compressor = self.compressor.clone();
        let dtls_context = self.dtls_context.clone();
        let running = self.running.clone();
        let logger = self.logger.clone();
        let reception_timeout = self.config.reception_timeout();
        let local_mtu = self.local_mtu;

        thread::spawn(move || {
            let mut buf = vec![0u8; FULL_DATAGRAM_SIZE];

            while running.is_running() {
                match socket.recv(&mut buf) {
                    Ok(len) => {
                        let mut guard = client.lock().expect("client mutex poisoned");

                        let raw = if guard.status.is_in_encrypted_state() {
                            match guard.dtls.as_mut().map(|d| d.decrypt(&buf[..len])) {
                                Some(Ok(plain)) => plain,
                                _ => continue,
                            }
                        } else {
                            buf[..len].to_vec()
                        };

                        let Some(header) = HeaderView::parse(&raw) else { continue };

                        match handle_control_packet(
                            header.identifier,
                            &raw[crate::header::HEADER_SIZE..],
                            &mut guard,
                            &dtls_context,
                            local_mtu,
                            "",
                            false,
                        ) {
                            ControlOutcome::Handled(responses) => {
                                for response in responses {
                                    guard.push_packet(response);
                                }
                                guard.resolve_pending_connect_if_established();
                                continue;
                            }
                            ControlOutcome::Rejected => {
                                guard.resolve_pending_connect(Err(NetError::VersionMismatch));
                                continue;
                            }
                            ControlOutcome::NotControl => {}
                        }

                        let ignore_realm = !guard.status.is_connected();
                        match receive_into_client(&raw, peer, &mut guard, compressor.as_ref(), ignore_realm, false, &logger) {
                            Ok(crate::engine::Delivered::Packets(packets)) => {
                                drop(guard);
                                for packet in packets {
                                    if !flux.push_packet(FluxPacket { packet, peer }) {
                                        slog::warn!(logger, "flux full, dropping packet");
                                    }
                                }
                            }
                            Ok(crate::engine::Delivered::Internal) => {}
                            Err(err) => {
                                slog::debug!(logger, "dropping malformed datagram"; "error" => %err);
                            }
                        }
                    }
                    Err(SocketError::NotReady) => {
                        thread::sleep(reception_timeout.min(Duration::from_millis(10)));
                    }
                    Err(_) => {}
                }
            }
        })
    }

    fn spawn_transmission(&self) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let client = self.client.clone();
        let commands = self.commands.clone();
        let compressor = self.compressor.clone();
        let running = self.running.clone();
        let notifier = self.notifier.clone();
        let cache_delay_factor = self.config.cache_delay_factor();
        let cache_min_latency = self.config.cache_min_latency();
        let cmd_tick = self.config.cmd_update_tick();
        let connect_timeout = self.config.status_timeout();
        let logger = self.logger.clone();

        thread::spawn(move || {
            let mut last_cmd_tick = Instant::now();

            while running.is_running() {
                notifier.wait_timeout(Duration::from_millis(10));

                if last_cmd_tick.elapsed() >= cmd_tick {
                    drive_commands(&commands, &client, connect_timeout);
                    last_cmd_tick = Instant::now();
                }

                let mut guard = client.lock().expect("client mutex poisoned");
                let pacing = Duration::from_millis(guard.latency.ctos_latency_ms() as u64);
                let _ = service_transmission(
                    &mut guard,
                    compressor.as_ref(),
                    pacing,
                    cache_delay_factor,
                    cache_min_latency,
                    &logger,
                    |bytes| socket.send(bytes).map(|_| ()).map_err(NetError::Socket),
                );

                if let Some(return_packet) =
                    build_return_packet(&mut guard, guard.current_realm(), guard.counter(Target::Host))
                {
                    guard.push_packet(return_packet);
                }
            }
        })
    }
}

/// Drains the command queue and advances whichever handshake/MTU/teardown
/// request is in flight (spec.md §4.7 `update` tick), then polls any
/// pending `connect()` completion for a terminal result.
fn drive_commands(commands: &CommandQueue, client: &Arc<Mutex<Client>>, connect_timeout: Duration) {
    for command in commands.drain() {
        match command {
            Command::Connect { versioning, completion } => {
                let mut guard = client.lock().expect("client mutex poisoned");
                guard.push_packet(build_handshake_request(&versioning));
                guard.push_packet(build_mtu_ask());
                guard.push_packet(build_mtu_final());
                // The handshake/MTU/DTLS progression happens asynchronously
                // as packets are exchanged by the reception thread; the
                // completion is stashed on the client and resolved from
                // there (or by `poll_pending_connect_timeout` below) on a
                // terminal result, matching the original's
                // `NetConnectCommand` future that only resolves once the
                // connection reaches success, refusal, or timeout.
                guard.set_pending_connect(completion);
            }
            Command::Disconnect { completion } => {
                let mut guard = client.lock().expect("client mutex poisoned");
                let status_timeout = Duration::from_secs(1);
                guard.resolve_pending_connect(Err(NetError::Stopped));
                guard.disconnect(status_timeout, Some(build_disconnect_packet()));
                completion.complete(());
            }
            Command::RetrieveMtu { completion } => {
                let guard = client.lock().expect("client mutex poisoned");
                completion.complete(Ok(guard.mtu));
            }
        }
    }

    client
        .lock()
        .expect("client mutex poisoned")
        .poll_pending_connect_timeout(connect_timeout);
}
