//! Server network layer: UDP transport, session routing, and the single
//! serialized event loop that owns the room engine.
//!
//! All packet handling and ticks run on one `tokio::select!` loop, so
//! every room mutation applies one at a time in server arrival order —
//! when two clients race for the same tile, whichever intent the loop
//! dequeues first wins and the other receives its rejection. Patches fan
//! out to subscribers only after the mutation has committed.

use crate::checkpoint::{CheckpointStore, Checkpointer};
use crate::economy::MemoryEconomy;
use crate::engine::RoomEngine;
use crate::session::{IdentityProvider, SessionManager};
use crate::utils::now_ms;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, SessionId, UserId, MAX_DATAGRAM, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    SessionTimeout {
        session: SessionId,
        user: UserId,
    },
    Shutdown,
}

/// Messages sent from the main loop to the network sender task
#[derive(Debug)]
pub enum NetMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<SessionId>,
    },
}

/// Main server coordinating networking, the room engine, and persistence.
pub struct RoomServer<S: CheckpointStore> {
    socket: Arc<UdpSocket>,
    sessions: Arc<RwLock<SessionManager>>,
    engine: RoomEngine<MemoryEconomy>,
    checkpointer: Checkpointer<S>,
    identity: Arc<dyn IdentityProvider + Send + Sync>,
    tick_duration: Duration,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    net_tx: mpsc::UnboundedSender<NetMessage>,
    net_rx: Option<mpsc::UnboundedReceiver<NetMessage>>,
}

impl<S: CheckpointStore> RoomServer<S> {
    pub async fn new(
        addr: &str,
        engine: RoomEngine<MemoryEconomy>,
        checkpointer: Checkpointer<S>,
        identity: Arc<dyn IdentityProvider + Send + Sync>,
        tick_duration: Duration,
        max_sessions: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("room {} listening on {}", engine.state().room_id.0, addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket,
            sessions: Arc::new(RwLock::new(SessionManager::new(max_sessions))),
            engine,
            checkpointer,
            identity,
            tick_duration,
            server_tx,
            server_rx,
            net_tx,
            net_rx: Some(net_rx),
        })
    }

    /// Spawns the task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("failed to deserialize datagram from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let sessions = Arc::clone(&self.sessions);
        let Some(mut net_rx) = self.net_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = net_rx.recv().await {
                match message {
                    NetMessage::SendPacket { packet, addr } => {
                        if let Err(e) = send_packet(&socket, &packet, addr).await {
                            error!("failed to send packet to {}: {}", addr, e);
                        }
                    }
                    NetMessage::BroadcastPacket { packet, exclude } => {
                        let addrs = {
                            let sessions = sessions.read().await;
                            sessions.session_addrs()
                        };
                        for (session, addr) in addrs {
                            if Some(session) == exclude {
                                continue;
                            }
                            if let Err(e) = send_packet(&socket, &packet, addr).await {
                                error!("failed to send to session {}: {}", session.0, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns the task that monitors session timeouts
    fn spawn_timeout_checker(&self) {
        let sessions = Arc::clone(&self.sessions);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut check_interval = interval(Duration::from_secs(1));
            loop {
                check_interval.tick().await;
                let timed_out = {
                    let mut sessions = sessions.write().await;
                    sessions.check_timeouts()
                };
                for (session, user) in timed_out {
                    if server_tx
                        .send(ServerMessage::SessionTimeout { session, user })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
    }

    /// Spawns the task that turns Ctrl+C into a graceful shutdown
    fn spawn_shutdown_listener(&self) {
        let server_tx = self.server_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = server_tx.send(ServerMessage::Shutdown);
            }
        });
    }

    fn send(&self, packet: Packet, addr: SocketAddr) {
        if self
            .net_tx
            .send(NetMessage::SendPacket { packet, addr })
            .is_err()
        {
            error!("network sender task is gone");
        }
    }

    fn broadcast(&self, packet: Packet, exclude: Option<SessionId>) {
        if self
            .net_tx
            .send(NetMessage::BroadcastPacket { packet, exclude })
            .is_err()
        {
            error!("network sender task is gone");
        }
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Join {
                protocol_version,
                auth_token,
            } => self.handle_join(protocol_version, &auth_token, addr).await,

            Packet::Action { request } => {
                let session = {
                    let mut sessions = self.sessions.write().await;
                    sessions.touch(addr);
                    sessions.find_by_addr(addr).map(|s| (s.id, s.user))
                };
                let Some((session, user)) = session else {
                    debug!("action from unknown address {}", addr);
                    return;
                };

                let now = now_ms();
                let checkpointer = &mut self.checkpointer;
                let degraded = checkpointer.is_degraded();
                let outcome =
                    self.engine
                        .submit(session, user, &request, now, degraded, |state, ledger| {
                            checkpointer.flush_now(state, ledger)
                        });

                if let Some(patch) = outcome.broadcast_patch() {
                    if patch.revision > self.checkpointer.last_persisted_revision() {
                        self.checkpointer.mark_dirty(patch.revision);
                    }
                    self.broadcast(
                        Packet::StatePush {
                            patch: patch.clone(),
                        },
                        Some(session),
                    );
                }
                if let Some(effect) = outcome.effect.clone() {
                    self.broadcast(Packet::Effect { effect }, None);
                }
                self.send(
                    Packet::ActionResult {
                        action_id: outcome.action_id,
                        result: outcome.result,
                    },
                    addr,
                );
            }

            Packet::ResyncRequest => {
                let known = {
                    let mut sessions = self.sessions.write().await;
                    sessions.touch(addr);
                    sessions.find_by_addr(addr).is_some()
                };
                if known {
                    self.send(
                        Packet::Snapshot {
                            snapshot: self.engine.snapshot(),
                        },
                        addr,
                    );
                }
            }

            Packet::Leave => {
                let session = {
                    let sessions = self.sessions.read().await;
                    sessions.find_by_addr(addr).map(|s| s.id)
                };
                if let Some(session) = session {
                    {
                        let mut sessions = self.sessions.write().await;
                        sessions.remove_session(session);
                    }
                    self.handle_session_gone(session);
                }
            }

            _ => {
                warn!("unexpected packet type from {}", addr);
            }
        }
    }

    async fn handle_join(&mut self, protocol_version: u32, auth_token: &str, addr: SocketAddr) {
        if protocol_version != PROTOCOL_VERSION {
            self.send(
                Packet::JoinRejected {
                    reason: format!(
                        "protocol version mismatch: server speaks {}",
                        PROTOCOL_VERSION
                    ),
                },
                addr,
            );
            return;
        }

        let Some(user) = self.identity.resolve(auth_token) else {
            self.send(
                Packet::JoinRejected {
                    reason: "invalid credentials".to_string(),
                },
                addr,
            );
            return;
        };

        // A reconnect from the same address replaces the old session.
        let existing = {
            let sessions = self.sessions.read().await;
            sessions.find_by_addr(addr).map(|s| s.id)
        };
        if let Some(existing) = existing {
            info!("replacing existing session {} from {}", existing.0, addr);
            {
                let mut sessions = self.sessions.write().await;
                sessions.remove_session(existing);
            }
            self.handle_session_gone(existing);
        }

        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.add_session(addr, user)
        };
        let Some(session) = session else {
            self.send(
                Packet::JoinRejected {
                    reason: "room full".to_string(),
                },
                addr,
            );
            return;
        };

        let (role, patch) = self.engine.join(session, user);
        self.checkpointer.mark_dirty(patch.revision);
        self.broadcast(Packet::StatePush { patch }, Some(session));
        self.send(
            Packet::Joined {
                session_id: session,
                user_id: user,
                role,
                snapshot: self.engine.snapshot(),
            },
            addr,
        );
    }

    /// Common cleanup after a session is removed (leave, timeout, or join
    /// replacement): drop the presence and, when the owner just left, take
    /// a lifecycle checkpoint.
    fn handle_session_gone(&mut self, session: SessionId) {
        let owner_left = self
            .engine
            .state()
            .presences
            .get(&session)
            .map(|p| p.user == self.engine.state().owner)
            .unwrap_or(false);

        if let Some(patch) = self.engine.leave(session) {
            self.checkpointer.mark_dirty(patch.revision);
            self.broadcast(Packet::StatePush { patch }, None);
        }

        if owner_left {
            info!("owner disconnected, taking lifecycle checkpoint");
            if let Err(e) = self
                .checkpointer
                .flush_now(self.engine.state(), self.engine.idempotency())
            {
                warn!("lifecycle checkpoint failed: {}", e);
            }
        }
    }

    fn handle_tick(&mut self, tick: u64) {
        let now = now_ms();
        self.engine.tick(now);
        self.checkpointer
            .tick(self.engine.state(), self.engine.idempotency(), Instant::now());

        if tick % 100 == 0 {
            self.engine.sweep_idempotency(now);
        }
        if tick % 300 == 0 {
            let metrics = self.checkpointer.metrics();
            debug!(
                "room {} tick {}: revision={} persisted={} degraded={} failures={}",
                self.engine.state().room_id.0,
                tick,
                self.engine.state().revision,
                metrics.last_persisted_revision,
                metrics.degraded,
                metrics.failure_count,
            );
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();
        self.spawn_shutdown_listener();

        let mut tick_interval = interval(self.tick_duration);
        let mut tick: u64 = 0;

        info!("server started");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::SessionTimeout { session, user }) => {
                            info!("session {} (user {}) timed out", session.0, user.0);
                            self.handle_session_gone(session);
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    tick += 1;
                    self.handle_tick(tick);
                },
            }
        }

        // Final lifecycle checkpoint on shutdown.
        if let Err(e) = self
            .checkpointer
            .flush_now(self.engine.state(), self.engine.idempotency())
        {
            warn!("shutdown checkpoint failed: {}", e);
        }
        Ok(())
    }
}

async fn send_packet(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_construction() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let msg = ServerMessage::PacketReceived {
            packet: Packet::ResyncRequest,
            addr,
        };
        match msg {
            ServerMessage::PacketReceived { packet, addr: a } => {
                assert_eq!(a, addr);
                assert_eq!(packet, Packet::ResyncRequest);
            }
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn test_net_message_broadcast_exclusion() {
        let msg = NetMessage::BroadcastPacket {
            packet: Packet::ResyncRequest,
            exclude: Some(SessionId(5)),
        };
        match msg {
            NetMessage::BroadcastPacket { exclude, .. } => {
                assert_eq!(exclude, Some(SessionId(5)));
            }
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn test_channel_plumbing() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        tx.send(ServerMessage::Shutdown).unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Shutdown)));
    }
}
