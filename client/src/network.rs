//! Thin UDP client: joins a room, feeds server packets into the
//! reconciliation engine, and puts its retransmits and resync requests
//! back on the wire.

use crate::reconcile::{ClientEvent, Reconciler, SubmitError};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    ActionId, ActionPayload, Catalog, Packet, Role, SessionId, UserId, MAX_DATAGRAM,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, timeout};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    auth_token: String,
    fake_ping_ms: u64,

    session: Option<SessionId>,
    user: Option<UserId>,
    role: Option<Role>,
    reconciler: Option<Reconciler>,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        auth_token: &str,
        fake_ping_ms: u64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            auth_token: auth_token.to_string(),
            fake_ping_ms,
            session: None,
            user: None,
            role: None,
            reconciler: None,
        })
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn reconciler(&self) -> Option<&Reconciler> {
        self.reconciler.as_ref()
    }

    /// Sends the join handshake and pumps packets until the server answers.
    pub async fn join(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("joining {} as {}", self.server_addr, self.auth_token);
        self.send_packet(&Packet::Join {
            protocol_version: PROTOCOL_VERSION,
            auth_token: self.auth_token.clone(),
        })
        .await?;

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while self.session.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err("join timed out".into());
            }
            let (len, _) = timeout(remaining, self.socket.recv_from(&mut buffer)).await??;
            match deserialize::<Packet>(&buffer[0..len]) {
                Ok(Packet::JoinRejected { reason }) => {
                    return Err(format!("join rejected: {}", reason).into());
                }
                Ok(packet) => self.handle_packet(packet).await?,
                Err(_) => warn!("failed to deserialize packet during join"),
            }
        }
        Ok(())
    }

    /// Submits one intent through the reconciliation engine and sends it.
    pub async fn submit(
        &mut self,
        payload: ActionPayload,
    ) -> Result<Result<ActionId, SubmitError>, Box<dyn std::error::Error>> {
        let Some(reconciler) = self.reconciler.as_mut() else {
            return Err("not joined".into());
        };
        let request = match reconciler.submit(payload, Instant::now()) {
            Ok(request) => request,
            Err(e) => return Ok(Err(e)),
        };
        let action_id = request.action_id;
        self.send_packet(&Packet::Action { request }).await?;
        Ok(Ok(action_id))
    }

    /// Runs the receive/tick loop for `duration`, driving retries,
    /// timeouts, and patch application.
    pub async fn pump(&mut self, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
        let mut tick_interval = interval(TICK_INTERVAL);
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let deadline = Instant::now() + duration;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }
                            match deserialize::<Packet>(&buffer[0..len]) {
                                Ok(packet) => self.handle_packet(packet).await?,
                                Err(_) => warn!("failed to deserialize packet"),
                            }
                        }
                        Err(e) => error!("error receiving packet: {}", e),
                    }
                },

                _ = tick_interval.tick() => {
                    if let Some(reconciler) = self.reconciler.as_mut() {
                        let events = reconciler.tick(Instant::now());
                        self.process_events(events).await?;
                    }
                },

                _ = sleep(remaining) => {
                    return Ok(());
                },
            }
        }
    }

    pub async fn leave(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.session.is_some() {
            self.send_packet(&Packet::Leave).await?;
            self.session = None;
            self.reconciler = None;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Box<dyn std::error::Error>> {
        match packet {
            Packet::Joined {
                session_id,
                user_id,
                role,
                snapshot,
            } => {
                info!(
                    "joined room {} as {:?}, session {}, revision {}",
                    snapshot.room_id.0, role, session_id.0, snapshot.revision
                );
                self.session = Some(session_id);
                self.user = Some(user_id);
                self.role = Some(role);
                self.reconciler = Some(Reconciler::new(
                    session_id,
                    user_id,
                    snapshot,
                    Catalog::demo(),
                ));
            }

            Packet::ActionResult { action_id, result } => {
                if let Some(reconciler) = self.reconciler.as_mut() {
                    let events = reconciler.handle_result(action_id, result, Instant::now());
                    self.process_events(events).await?;
                }
            }

            Packet::StatePush { patch } => {
                if let Some(reconciler) = self.reconciler.as_mut() {
                    let events = reconciler.handle_push(&patch);
                    self.process_events(events).await?;
                }
            }

            Packet::Snapshot { snapshot } => {
                if let Some(reconciler) = self.reconciler.as_mut() {
                    reconciler.handle_snapshot(snapshot, Instant::now());
                }
            }

            Packet::Effect { effect } => {
                debug!("effect {:?} at {:?}", effect.kind, effect.pos);
            }

            Packet::Kicked { reason } => {
                warn!("kicked: {}", reason);
                self.session = None;
                self.reconciler = None;
            }

            Packet::JoinRejected { reason } => {
                warn!("join rejected: {}", reason);
            }

            _ => {
                warn!("unexpected packet type");
            }
        }
        Ok(())
    }

    async fn process_events(
        &mut self,
        events: Vec<ClientEvent>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        for event in events {
            match event {
                ClientEvent::Retransmit(request) => {
                    debug!("retransmitting action {}", request.action_id);
                    self.send_packet(&Packet::Action { request }).await?;
                }
                ClientEvent::Syncing(action_id) => {
                    debug!("action {} still syncing", action_id);
                }
                ClientEvent::Confirmed(action_id) => {
                    info!("action {} confirmed", action_id);
                }
                ClientEvent::Rejected(action_id, rejection) => {
                    warn!("action {} rejected: {}", action_id, rejection);
                }
                ClientEvent::TimedOut(action_id) => {
                    warn!("action {} timed out, prediction rolled back", action_id);
                }
                ClientEvent::NeedResync => {
                    info!("revision gap detected, requesting snapshot");
                    self.send_packet(&Packet::ResyncRequest).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }
}
