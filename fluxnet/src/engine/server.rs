//! Server-side reception/transmission engine (spec.md §4.9), grounded in
//! the original source's `ServerUdp` (`C_server.hpp`/`C_server.cpp`):
//! one bound socket, a client table keyed by peer identity, and a pair of
//! dedicated threads that keep running until [`NetServer::stop`].

use std::convert::TryInto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use openssl::ssl::SslContext;

use crate::client::Target;
use crate::compressor::Compressor;
use crate::config::{NetConfig, DEFAULT_OFFSET_WINDOW, FULL_DATAGRAM_SIZE};
use crate::dtls;
use crate::engine::{
    build_return_packet, handle_control_packet, receive_into_client, service_transmission,
    ControlOutcome, Notifier, Running,
};
use crate::error::{NetError, SocketError};
use crate::flux::{ClientTable, Flux, FluxPacket};
use crate::header::HeaderView;
use crate::identity::Identity;
use crate::socket::NetSocket;

/// A running server-side engine: the reception thread routes datagrams
/// into per-client state and round-robins delivered packets across
/// [`Flux`] queues; the transmission thread paces and sends each client's
/// pending outbound packets (spec.md §4.9, §5).
pub struct NetServer {
    socket: Arc<NetSocket>,
    client_table: Arc<ClientTable>,
    fluxes: Vec<Arc<Flux>>,
    compressor: Arc<dyn Compressor>,
    dtls_context: Arc<SslContext>,
    config: NetConfig,
    versioning: String,
    local_mtu: u16,
    running: Running,
    notifier: Arc<Notifier>,
    logger: slog::Logger,
    reception: Option<JoinHandle<()>>,
    transmission: Option<JoinHandle<()>>,
}

impl NetServer {
    pub fn start(
        addr: SocketAddr,
        flux_count: usize,
        config: NetConfig,
        compressor: Arc<dyn Compressor>,
        versioning: impl Into<String>,
        local_mtu: u16,
        logger: slog::Logger,
    ) -> Result<NetServer, NetError> {
        let socket = Arc::new(NetSocket::bind(addr)?);
        let client_table = Arc::new(ClientTable::new(config.clone()));
        let fluxes = (0..flux_count.max(1))
            .map(|_| Arc::new(Flux::new(config.max_flux_packets())))
            .collect::<Vec<_>>();
        let dtls_context = Arc::new(dtls::build_context().map_err(|_| NetError::Crypto)?);
        let running = Running::new();
        let notifier = Arc::new(Notifier::new());

        let mut server = NetServer {
            socket,
            client_table,
            fluxes,
            compressor,
            dtls_context,
            config,
            versioning: versioning.into(),
            local_mtu,
            running,
            notifier,
            logger,
            reception: None,
            transmission: None,
        };
        server.spawn_threads();
        Ok(server)
    }

    pub fn flux(&self, index: usize) -> Option<Arc<Flux>> {
        self.fluxes.get(index).cloned()
    }

    pub fn flux_count(&self) -> usize {
        self.fluxes.len()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn notify_transmission(&self) {
        self.notifier.notify();
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
        let client_table = self.client_table.clone();
        let fluxes = self.fluxes.clone();
        let compressor = self.compressor.clone();
        let dtls_context = self.dtls_context.clone();
        let versioning = self.versioning.clone();
        let local_mtu = self.local_mtu;
        let running = self.running.clone();
        let notifier = self.notifier.clone();
        let logger = self.logger.clone();
        let reception_timeout = self.config.reception_timeout();
        let gc_delay = self.config.client_gc_delay();

        thread::spawn(move || {
            let mut buf = vec![0u8; FULL_DATAGRAM_SIZE];
            let mut last_gc = Instant::now();
            let mut flux_cursor = 0usize;

            while running.is_running() {
                match socket.recv_from(&mut buf) {
                    Ok((len, addr)) => {
                        let peer = Identity::from(addr);
                        let client_arc = client_table.get_or_insert(peer, DEFAULT_OFFSET_WINDOW);
                        let mut client = client_arc.lock().expect("client mutex poisoned");

                        let raw = if client.status.is_in_encrypted_state() {
                            match client.dtls.as_mut().map(|d| d.decrypt(&buf[..len])) {
                                Some(Ok(plain)) => plain,
                                _ => continue,
                            }
                        } else {
                            buf[..len].to_vec()
                        };

                        let Some(header) = HeaderView::parse(&raw) else {
                            continue;
                        };

                        match handle_control_packet(
                            header.identifier,
                            &raw[crate::header::HEADER_SIZE..],
                            &mut client,
                            &dtls_context,
                            local_mtu,
                            &versioning,
                            true,
                        ) {
                            ControlOutcome::Handled(responses) => {
                                for response in responses {
                                    client.push_packet(response);
                                }
                                continue;
                            }
                            ControlOutcome::Rejected => continue,
                            ControlOutcome::NotControl => {}
                        }

                        let ignore_realm = !client.status.is_connected();
                        match receive_into_client(&raw, peer, &mut client, compressor.as_ref(), ignore_realm, true, &logger) {
                            Ok(crate::engine::Delivered::Packets(packets)) => {
                                drop(client);
                                for packet in packets {
                                    flux_cursor = (flux_cursor + 1) % fluxes.len();
                                    if !fluxes[flux_cursor].push_packet(FluxPacket { packet, peer }) {
                                        slog::warn!(logger, "flux full, dropping packet"; "peer" => %peer);
                                    }
                                }
                            }
                            Ok(crate::engine::Delivered::Internal) => {}
                            Err(err) => {
                                slog::debug!(logger, "dropping malformed datagram"; "peer" => %peer, "error" => %err);
                            }
                        }
                    }
                    Err(SocketError::NotReady) => {
                        thread::sleep(reception_timeout.min(Duration::from_millis(10)));
                    }
                    Err(_) => {}
                }

                if last_gc.elapsed() >= gc_delay {
                    client_table.reap_disconnected();
                    last_gc = Instant::now();
                }
            }
        })
    }

    fn spawn_transmission(&self) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let client_table = self.client_table.clone();
        let compressor = self.compressor.clone();
        let running = self.running.clone();
        let notifier = self.notifier.clone();
        let cache_delay_factor = self.config.cache_delay_factor();
        let cache_min_latency = self.config.cache_min_latency();
        let logger = self.logger.clone();

        thread::spawn(move || {
            while running.is_running() {
                notifier.wait_timeout(Duration::from_millis(10));

                for peer in client_table.peers() {
                    let Some(client_arc) = client_table.get(&peer) else { continue };
                    let mut client = client_arc.lock().expect("client mutex poisoned");

                    let pacing = Duration::from_millis(client.latency.stoc_latency_ms() as u64);
                    let _ = service_transmission(
                        &mut client,
                        compressor.as_ref(),
                        pacing,
                        cache_delay_factor,
                        cache_min_latency,
                        &logger,
                        |bytes| {
                            let addr: SocketAddr = peer.try_into().map_err(|_| NetError::Socket(SocketError::InvalidArgument))?;
                            socket.send_to(bytes, addr).map(|_| ()).map_err(NetError::Socket)
                        },
                    );

                    if let Some(return_packet) =
                        build_return_packet(&mut client, client.current_realm(), client.counter(Target::Host))
                    {
                        client.push_packet(return_packet);
                    }
                }
            }
        })
    }
}
