//! Server engine: TCP acceptance, channel registry, command dispatch.
//!
//! Inbound TCP commands carry no identity; the server attributes them to the
//! client id it learned from that host's `CLIENT_NICK` announcements. One
//! reactor task owns the channel and lobby maps; accepted connections get a
//! pump task each and everything else arrives as messages.

use crate::codec::{Command, PduOption, PeerPdu};
use crate::net::announcer::Announcer;
use crate::net::deadline::DeadlineMap;
use crate::net::session::{send_frame, spawn_frame_reader, spawn_udp_pump};
use crate::net::types::{
    is_private_channel, Event, ServerConfig, CHANNELS_ANNOUNCE_DELAY, HEAVY_PDU_CADENCE,
    QUEUE_DEPTH,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// HANDLE
// =============================================================================

enum AdminCommand {
    Channels(oneshot::Sender<HashMap<String, BTreeSet<String>>>),
    Lobby(oneshot::Sender<HashMap<IpAddr, String>>),
}

/// Cheap clonable handle to a running server engine.
#[derive(Clone)]
pub struct ServerHandle {
    id: String,
    port: u16,
    cmd_tx: mpsc::Sender<AdminCommand>,
    cancel: CancellationToken,
}

impl ServerHandle {
    /// This server's stable peer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The TCP port advertised in `SERVER` announcements.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Snapshot of channels and their member client ids.
    pub async fn channels(&self) -> HashMap<String, BTreeSet<String>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(AdminCommand::Channels(reply)).await;
        rx.await.unwrap_or_default()
    }

    /// Snapshot of the lobby attribution table: address → client id.
    pub async fn lobby(&self) -> HashMap<IpAddr, String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(AdminCommand::Lobby(reply)).await;
        rx.await.unwrap_or_default()
    }

    /// Stop the reactor and all of its pump tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ServerEngine;

impl ServerEngine {
    /// Bind the announcer and the TCP listener, then start the reactor.
    /// With `tcp_port` 0 the OS-assigned port is read back and advertised.
    pub fn spawn(config: ServerConfig) -> io::Result<(ServerHandle, mpsc::Receiver<Event>)> {
        let announcer = Arc::new(Announcer::bind(&config.net)?);
        let listener = std::net::TcpListener::bind(("0.0.0.0", config.tcp_port))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let listener = TcpListener::from_std(listener)?;

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
        let (frame_tx, frame_rx) = mpsc::channel(QUEUE_DEPTH);
        let (datagram_tx, datagram_rx) = mpsc::channel(QUEUE_DEPTH);

        spawn_udp_pump(announcer.clone(), datagram_tx, cancel.child_token());

        let state = ServerState {
            id: id.clone(),
            port,
            cfg: config,
            announcer,
            channels: HashMap::new(),
            conns: HashMap::new(),
            users: HashMap::new(),
            deadlines: DeadlineMap::new(),
            pdu_counter: 0,
            next_conn_id: 0,
            events: event_tx,
            frame_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(state.run(listener, cmd_rx, frame_rx, datagram_rx));

        Ok((
            ServerHandle {
                id,
                port,
                cmd_tx,
                cancel,
            },
            event_rx,
        ))
    }
}

/// Opaque per-connection id; stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ConnId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Member {
    client_id: String,
    conn: ConnId,
}

struct Conn {
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Keys of the server's single deadline map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Expiry {
    /// Lobby attribution for one host runs out.
    User(IpAddr),
    /// One-shot accelerated channel announcement.
    ChannelsAnnounce,
}

struct ServerState {
    id: String,
    port: u16,
    cfg: ServerConfig,
    announcer: Arc<Announcer>,
    /// Channel name → members, each a (client id, connection) pair.
    channels: HashMap<String, HashSet<Member>>,
    conns: HashMap<ConnId, Conn>,
    /// Lobby attribution: host address → client id, learned over UDP.
    users: HashMap<IpAddr, String>,
    deadlines: DeadlineMap<Expiry>,
    pdu_counter: u32,
    next_conn_id: u64,
    events: mpsc::Sender<Event>,
    frame_tx: mpsc::Sender<(ConnId, Option<Vec<u8>>)>,
    cancel: CancellationToken,
}

impl ServerState {
    async fn run(
        mut self,
        listener: TcpListener,
        mut cmd_rx: mpsc::Receiver<AdminCommand>,
        mut frame_rx: mpsc::Receiver<(ConnId, Option<Vec<u8>>)>,
        mut datagram_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) {
        let cancel = self.cancel.clone();
        let mut tick = interval(self.cfg.net.pdu_interval);

        info!("server {} listening on port {}", self.id, self.port);
        loop {
            let deadline = self.deadlines.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.on_tick().await,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr),
                    Err(e) => warn!("accept failed: {}", e),
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_admin(cmd),
                    None => break,
                },
                Some((data, src)) = datagram_rx.recv() => self.on_datagram(&data, src).await,
                Some((conn_id, payload)) = frame_rx.recv() => self.on_frame(conn_id, payload).await,
                _ = sleep_or_forever(deadline) => self.on_deadlines().await,
            }
        }
        for (_, conn) in self.conns.drain() {
            conn.reader.abort();
        }
        debug!("server {} reactor stopped", self.id);
    }

    // -------------------------------------------------------------------------
    // announcements
    // -------------------------------------------------------------------------

    async fn on_tick(&mut self) {
        self.announce_presence().await;
        if self.pdu_counter % HEAVY_PDU_CADENCE == 0 {
            self.announce_channels().await;
        }
        self.pdu_counter = self.pdu_counter.wrapping_add(1);
    }

    async fn announce_presence(&self) {
        let pdu = PeerPdu::with_option(self.id.clone(), PduOption::Server { port: self.port });
        self.announcer.send_pdu(&pdu).await;
    }

    /// Announce the public channel list. Private channels never appear;
    /// with none public, nothing is sent.
    async fn announce_channels(&self) {
        let mut channels: Vec<String> = self
            .channels
            .keys()
            .filter(|name| !is_private_channel(name))
            .cloned()
            .collect();
        if channels.is_empty() {
            return;
        }
        channels.sort();
        let pdu = PeerPdu::with_option(self.id.clone(), PduOption::ServerChannels { channels });
        self.announcer.send_pdu(&pdu).await;
    }

    // -------------------------------------------------------------------------
    // lobby over UDP
    // -------------------------------------------------------------------------

    async fn on_datagram(&mut self, data: &[u8], src: SocketAddr) {
        let pdu = match PeerPdu::parse(data) {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", src, e);
                return;
            }
        };
        if pdu.id == self.id {
            return;
        }
        let PeerPdu { id, options } = pdu;
        for option in options {
            if let PduOption::ClientNick { nickname } = option {
                self.on_client_nick(&id, nickname, src).await;
            }
        }
    }

    async fn on_client_nick(&mut self, client_id: &str, nickname: String, src: SocketAddr) {
        let ip = src.ip();
        if !self.users.contains_key(&ip) {
            self.users.insert(ip, client_id.to_string());
            info!("lobby: {} ({:?}) at {}", client_id, nickname, ip);
            self.emit(Event::ClientNew {
                id: client_id.to_string(),
                nickname,
            })
            .await;
            // Accelerate discovery for the newcomer: presence now, channel
            // list shortly after.
            self.announce_presence().await;
            self.deadlines
                .restart(Expiry::ChannelsAnnounce, CHANNELS_ANNOUNCE_DELAY);
        } else {
            self.users.insert(ip, client_id.to_string());
        }
        self.deadlines
            .restart(Expiry::User(ip), self.cfg.net.peer_timeout);
    }

    // -------------------------------------------------------------------------
    // TCP commands
    // -------------------------------------------------------------------------

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        let (read_half, writer) = stream.into_split();
        let reader = spawn_frame_reader(
            read_half,
            conn_id,
            self.frame_tx.clone(),
            self.cancel.child_token(),
        );
        self.conns.insert(
            conn_id,
            Conn {
                addr,
                writer,
                reader,
            },
        );
        debug!("accepted {:?} from {}", conn_id, addr);
    }

    async fn on_frame(&mut self, conn_id: ConnId, payload: Option<Vec<u8>>) {
        let Some(payload) = payload else {
            self.close_conn(conn_id).await;
            return;
        };
        match Command::parse(&payload) {
            Ok(Command::Join { channel }) => self.on_join(conn_id, channel).await,
            Ok(Command::Say { text }) => self.on_say(conn_id, text).await,
            Ok(Command::Exit) => self.on_exit(conn_id).await,
            Ok(Command::Standby { peer_id }) => {
                debug!("STANDBY for {} from {:?}; ignored", peer_id, conn_id);
            }
            Ok(Command::Invite { client_ids }) => self.on_invite(conn_id, client_ids).await,
            Ok(other) => debug!("unexpected {:?} from {:?}; ignored", other, conn_id),
            Err(e) => {
                warn!("closing {:?}: {}", conn_id, e);
                self.close_conn(conn_id).await;
            }
        }
    }

    async fn on_join(&mut self, conn_id: ConnId, channel: String) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        // Attribution comes from the lobby; a host we never heard announce
        // itself cannot join.
        let Some(client_id) = self.users.get(&conn.addr.ip()).cloned() else {
            warn!("JOIN {:?} from unattributed host {}; dropped", channel, conn.addr);
            return;
        };
        let newly_created = !self.channels.contains_key(&channel);
        self.channels.entry(channel.clone()).or_default().insert(Member {
            client_id: client_id.clone(),
            conn: conn_id,
        });
        info!("{} joined {:?}", client_id, channel);
        if newly_created {
            if is_private_channel(&channel) {
                self.send_invite(conn_id, &channel, vec![client_id]).await;
            } else {
                self.announce_channels().await;
            }
        }
    }

    async fn on_say(&mut self, conn_id: ConnId, text: String) {
        let Some((author_id, channel)) = self.member_of(conn_id) else {
            warn!("SAY from {:?} outside any channel; join first", conn_id);
            return;
        };
        let relay = Command::SayFrom { author_id, text };
        let frame = match relay.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("cannot encode relay: {}", e);
                return;
            }
        };
        let recipients: Vec<ConnId> = self.channels[&channel].iter().map(|m| m.conn).collect();
        let waiting = self.cfg.net.waiting_time;
        for recipient in recipients {
            let Some(conn) = self.conns.get_mut(&recipient) else {
                continue;
            };
            // A dead recipient loses this line; its pump task reports the
            // disconnect and membership is cleaned up there.
            if let Err(e) = send_frame(&mut conn.writer, &frame, waiting).await {
                warn!("fan-out to {:?} in {:?} failed: {}", recipient, channel, e);
            }
        }
    }

    async fn on_exit(&mut self, conn_id: ConnId) {
        let Some((client_id, channel)) = self.member_of(conn_id) else {
            debug!("EXIT from {:?} outside any channel", conn_id);
            return;
        };
        self.remove_member(&channel, conn_id).await;
        info!("{} left {:?}", client_id, channel);
    }

    async fn on_invite(&mut self, conn_id: ConnId, client_ids: Vec<String>) {
        let Some((inviter, channel)) = self.member_of(conn_id) else {
            warn!("INVITE from {:?} outside any channel; dropped", conn_id);
            return;
        };
        debug!("{} invites {:?} into {:?}", inviter, client_ids, channel);
        let targets: BTreeSet<ConnId> = client_ids
            .iter()
            .filter_map(|client_id| self.conn_of(client_id))
            .collect();
        for target in targets {
            self.send_invite(target, &channel, client_ids.clone()).await;
        }
    }

    /// Deliver a `SERVER_INVITE` over one TCP connection, as a full peer
    /// PDU framed as the command payload.
    async fn send_invite(&mut self, conn_id: ConnId, channel: &str, client_ids: Vec<String>) {
        let command = Command::Pdu(PeerPdu::with_option(
            self.id.clone(),
            PduOption::ServerInvite {
                channel_id: channel.to_string(),
                client_ids,
            },
        ));
        let frame = match command.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("cannot encode invite: {}", e);
                return;
            }
        };
        let waiting = self.cfg.net.waiting_time;
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if let Err(e) = send_frame(&mut conn.writer, &frame, waiting).await {
            warn!("invite over {:?} failed: {}", conn_id, e);
        }
    }

    // -------------------------------------------------------------------------
    // membership bookkeeping
    // -------------------------------------------------------------------------

    fn member_of(&self, conn_id: ConnId) -> Option<(String, String)> {
        for (channel, members) in &self.channels {
            for member in members {
                if member.conn == conn_id {
                    return Some((member.client_id.clone(), channel.clone()));
                }
            }
        }
        None
    }

    fn conn_of(&self, client_id: &str) -> Option<ConnId> {
        for members in self.channels.values() {
            for member in members {
                if member.client_id == client_id {
                    return Some(member.conn);
                }
            }
        }
        None
    }

    /// Remove one connection from a channel; an emptied channel is
    /// destroyed, refreshing the public announcement.
    async fn remove_member(&mut self, channel: &str, conn_id: ConnId) {
        let Some(members) = self.channels.get_mut(channel) else {
            return;
        };
        members.retain(|member| member.conn != conn_id);
        if members.is_empty() {
            self.channels.remove(channel);
            debug!("channel {:?} destroyed", channel);
            if !is_private_channel(channel) {
                self.announce_channels().await;
            }
        }
    }

    async fn close_conn(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.conns.remove(&conn_id) {
            conn.reader.abort();
            debug!("{:?} from {} closed", conn_id, conn.addr);
        }
        let stale: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m.conn == conn_id))
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in stale {
            self.remove_member(&channel, conn_id).await;
        }
    }

    // -------------------------------------------------------------------------
    // liveness and admin
    // -------------------------------------------------------------------------

    async fn on_deadlines(&mut self) {
        for expiry in self.deadlines.pop_expired(Instant::now()) {
            match expiry {
                Expiry::User(ip) => {
                    if let Some(client_id) = self.users.remove(&ip) {
                        info!("lobby: {} at {} timed out", client_id, ip);
                        self.emit(Event::ClientRemoved { id: client_id }).await;
                    }
                }
                Expiry::ChannelsAnnounce => self.announce_channels().await,
            }
        }
    }

    fn on_admin(&mut self, cmd: AdminCommand) {
        match cmd {
            AdminCommand::Channels(reply) => {
                let snapshot = self
                    .channels
                    .iter()
                    .map(|(channel, members)| {
                        let ids = members.iter().map(|m| m.client_id.clone()).collect();
                        (channel.clone(), ids)
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
            AdminCommand::Lobby(reply) => {
                let _ = reply.send(self.users.clone());
            }
        }
    }

    async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }
}

async fn sleep_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
