//! Broadcast decoder
//!
//! Long-lived UDP listener for the configured universe. Each valid data
//! packet is decoded through the channel map into Primary-scoped field
//! updates and handed to the fusion side over a bounded channel with
//! `try_send`, so the receive loop never waits on a consumer. Liveness is
//! published separately on a watch channel.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::channel_map::ChannelMap;
use crate::fusion::field::FieldUpdate;
use crate::metrics::Metrics;
use crate::util::backoff::Backoff;
use crate::util::shutdown::Shutdown;

use super::framing::MAX_DATAGRAM_SIZE;
use super::sacn::{self, Packet, ProtocolError, SequenceTracker, START_CODE_NULL};

/// Frames buffered between the receive loop and the coordinator
pub const FRAME_QUEUE_CAPACITY: usize = 64;

/// Bind/receive failures. Never fatal: the decoder retries with backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("receive failed: {0}")]
    Receive(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Stopped,
    /// Socket bound, no recent packets
    Listening,
    /// Packets arriving within the liveness window
    Receiving,
}

#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub bind_addr: SocketAddr,
    pub universe: u16,
    pub resend_interval: Duration,
    /// Silence longer than this many resend intervals drops liveness
    pub liveness_multiplier: u32,
    pub join_multicast: bool,
}

impl DecoderSettings {
    pub fn liveness_timeout(&self) -> Duration {
        self.resend_interval * self.liveness_multiplier.max(1)
    }
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), sacn::ACN_SDT_MULTICAST_PORT),
            universe: 2,
            resend_interval: Duration::from_millis(50),
            liveness_multiplier: 3,
            join_multicast: true,
        }
    }
}

/// Decoded channel values from one packet
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub received_at: Instant,
    pub sequence: u8,
    pub updates: SmallVec<[FieldUpdate; 16]>,
}

/// What happened to one datagram
#[derive(Debug)]
pub enum FrameVerdict {
    Frame(BroadcastFrame),
    /// Source announced the end of its stream
    Terminated,
    /// Well-formed but not for us (other universe, start code, preview, sync)
    Ignored,
    OutOfSequence,
    Corrupt(ProtocolError),
}

/// Consumer ends of the decoder's channels
pub struct DecoderLink {
    pub frames: mpsc::Receiver<BroadcastFrame>,
    pub liveness: watch::Receiver<bool>,
    pub state: watch::Receiver<DecoderState>,
}

pub struct BroadcastDecoder {
    settings: DecoderSettings,
    map: Arc<ChannelMap>,
    metrics: Arc<Metrics>,
    sequence: SequenceTracker,
    frames_tx: mpsc::Sender<BroadcastFrame>,
    liveness_tx: watch::Sender<bool>,
    state_tx: watch::Sender<DecoderState>,
}

impl BroadcastDecoder {
    pub fn new(settings: DecoderSettings, map: Arc<ChannelMap>, metrics: Arc<Metrics>) -> (Self, DecoderLink) {
        let (frames_tx, frames) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (liveness_tx, liveness) = watch::channel(false);
        let (state_tx, state) = watch::channel(DecoderState::Stopped);

        let decoder = Self {
            settings,
            map,
            metrics,
            sequence: SequenceTracker::new(),
            frames_tx,
            liveness_tx,
            state_tx,
        };
        (
            decoder,
            DecoderLink {
                frames,
                liveness,
                state,
            },
        )
    }

    /// Classify and decode one datagram
    pub fn decode_frame(&mut self, buf: &[u8], received_at: Instant) -> FrameVerdict {
        let data = match sacn::parse(buf) {
            Ok(Packet::Data(data)) => data,
            Ok(Packet::Extended) => return FrameVerdict::Ignored,
            Err(e) => return FrameVerdict::Corrupt(e),
        };

        if data.universe != self.settings.universe || data.is_preview() {
            return FrameVerdict::Ignored;
        }
        if data.is_terminated() {
            self.sequence.forget(&data.cid);
            return FrameVerdict::Terminated;
        }
        if !self.sequence.accept(data.cid, data.sequence, received_at) {
            return FrameVerdict::OutOfSequence;
        }
        if data.start_code != START_CODE_NULL {
            return FrameVerdict::Ignored;
        }

        let updates = self
            .map
            .decode_slots(data.slots)
            .map(|(name, value)| FieldUpdate::broadcast(name, value, received_at))
            .collect();

        FrameVerdict::Frame(BroadcastFrame {
            received_at,
            sequence: data.sequence,
            updates,
        })
    }

    /// Bind the configured endpoint and join the universe's multicast group
    pub async fn bind(settings: &DecoderSettings) -> Result<UdpSocket, TransportError> {
        let socket = UdpSocket::bind(settings.bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: settings.bind_addr,
                source,
            })?;

        if settings.join_multicast {
            if let IpAddr::V4(interface) = settings.bind_addr.ip() {
                let group = sacn::universe_multicast_group(settings.universe);
                match socket.join_multicast_v4(group, interface) {
                    Ok(()) => debug!("Joined multicast group {}", group),
                    Err(e) => debug!("Multicast join for {} failed (unicast still works): {}", group, e),
                }
            }
        }

        Ok(socket)
    }

    /// Bind (retrying with backoff) and run until shutdown
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        let socket = loop {
            match Self::bind(&self.settings).await {
                Ok(socket) => {
                    if backoff.failures() > 0 {
                        info!("Broadcast listener bound after {} attempts", backoff.failures() + 1);
                    }
                    break socket;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    self.metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
                    if backoff.is_first_failure() {
                        warn!("{}; retrying", e);
                    } else {
                        debug!("{}; retrying in {:?}", e, delay);
                    }
                    tokio::select! {
                        _ = shutdown.wait() => {
                            self.state_tx.send_replace(DecoderState::Stopped);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.run_on_socket(socket, shutdown).await;
    }

    /// Receive loop on an already bound socket
    pub async fn run_on_socket(mut self, socket: UdpSocket, mut shutdown: Shutdown) {
        let local = socket.local_addr().ok();
        info!(
            "Listening for universe {} on {}",
            self.settings.universe,
            local.map(|a| a.to_string()).unwrap_or_else(|| "?".into())
        );
        self.state_tx.send_replace(DecoderState::Listening);

        let timeout = self.settings.liveness_timeout();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut alive = false;
        let silence = tokio::time::sleep(timeout);
        tokio::pin!(silence);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,

                _ = &mut silence, if alive => {
                    alive = false;
                    self.set_alive(false);
                    self.forget_silent_sources(Instant::now());
                    info!("Broadcast silent for {:?}; liveness lost", timeout);
                }

                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(ok) => ok,
                        Err(e) => {
                            self.metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
                            debug!("{}", TransportError::Receive(e));
                            continue;
                        }
                    };
                    self.metrics.packets_received.fetch_add(1, Ordering::Relaxed);

                    match self.decode_frame(&buf[..len], Instant::now()) {
                        FrameVerdict::Frame(frame) => {
                            self.metrics.packets_decoded.fetch_add(1, Ordering::Relaxed);
                            silence.as_mut().reset(tokio::time::Instant::now() + timeout);
                            if !alive {
                                alive = true;
                                self.set_alive(true);
                                info!("Receiving broadcast from {}", peer);
                            }
                            match self.frames_tx.try_send(frame) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    debug!("Frame consumer gone; stopping decoder");
                                    break;
                                }
                            }
                        }
                        FrameVerdict::Terminated => {
                            if alive {
                                alive = false;
                                self.set_alive(false);
                                info!("Broadcast source {} terminated its stream", peer);
                            }
                        }
                        FrameVerdict::Ignored => {
                            self.metrics.packets_ignored.fetch_add(1, Ordering::Relaxed);
                        }
                        FrameVerdict::OutOfSequence => {
                            self.metrics.packets_out_of_sequence.fetch_add(1, Ordering::Relaxed);
                        }
                        FrameVerdict::Corrupt(e) => {
                            self.metrics.packets_corrupt.fetch_add(1, Ordering::Relaxed);
                            debug!("Discarding datagram from {}: {}", peer, e);
                        }
                    }
                }
            }
        }

        self.set_alive(false);
        self.state_tx.send_replace(DecoderState::Stopped);
        info!("Broadcast decoder stopped");
    }

    /// Drop sequence state for sources quiet longer than the liveness window
    pub fn forget_silent_sources(&mut self, now: Instant) -> usize {
        let evicted = self.sequence.evict_silent(now, self.settings.liveness_timeout());
        if evicted > 0 {
            debug!("Forgot {} silent broadcast source(s)", evicted);
        }
        evicted
    }

    fn set_alive(&self, alive: bool) {
        self.liveness_tx.send_replace(alive);
        self.metrics.broadcast_alive.store(u64::from(alive), Ordering::Relaxed);
        let state = if alive {
            DecoderState::Receiving
        } else {
            DecoderState::Listening
        };
        self.state_tx.send_replace(state);
    }
}
