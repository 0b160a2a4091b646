//! Client engine: lobby tracking, server discovery, channel sessions.
//!
//! One reactor task owns every map; UDP datagrams, TCP frames, timer expiry
//! and user commands all arrive as messages, so no state needs a lock. TCP
//! sessions to servers are keyed `(server_id, channel)` where channel `None`
//! is the control session a server's announcement opened; channel sessions
//! are cloned from the control endpoint on demand.

use crate::codec::{Command, MembershipEntry, PduOption, PeerPdu};
use crate::net::announcer::Announcer;
use crate::net::deadline::{earliest, DeadlineMap};
use crate::net::session::{send_frame, spawn_frame_reader, spawn_udp_pump};
use crate::net::types::{is_private_channel, ClientConfig, Event, HEAVY_PDU_CADENCE, QUEUE_DEPTH};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A session slot: control (`None`) or one channel on one server.
type SlotKey = (String, Option<String>);

/// A membership key: one channel on one server.
type ChannelKey = (String, String);

// =============================================================================
// HANDLE
// =============================================================================

/// Commands the presentation layer issues to the reactor.
enum UserCommand {
    Join {
        channel: String,
        server_id: String,
    },
    Say {
        text: String,
        channel: String,
        server_id: String,
    },
    Standby {
        peer_id: String,
        channel: String,
        server_id: String,
    },
    Invite {
        client_ids: Vec<String>,
        channel: String,
        server_id: String,
    },
    Exit {
        channel: String,
        server_id: String,
    },
    SetNickname(String),
    Lobby(oneshot::Sender<HashMap<String, String>>),
    Sessions(oneshot::Sender<Vec<SlotKey>>),
    Membership(oneshot::Sender<HashMap<ChannelKey, BTreeSet<String>>>),
    History {
        server_id: String,
        channel: String,
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cheap clonable handle to a running client engine.
#[derive(Clone)]
pub struct ClientHandle {
    id: String,
    cmd_tx: mpsc::Sender<UserCommand>,
    cancel: CancellationToken,
}

impl ClientHandle {
    /// This client's stable peer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn join(&self, channel: impl Into<String>, server_id: impl Into<String>) {
        self.send(UserCommand::Join {
            channel: channel.into(),
            server_id: server_id.into(),
        })
        .await;
    }

    pub async fn say(
        &self,
        text: impl Into<String>,
        channel: impl Into<String>,
        server_id: impl Into<String>,
    ) {
        self.send(UserCommand::Say {
            text: text.into(),
            channel: channel.into(),
            server_id: server_id.into(),
        })
        .await;
    }

    pub async fn standby(
        &self,
        peer_id: impl Into<String>,
        channel: impl Into<String>,
        server_id: impl Into<String>,
    ) {
        self.send(UserCommand::Standby {
            peer_id: peer_id.into(),
            channel: channel.into(),
            server_id: server_id.into(),
        })
        .await;
    }

    pub async fn invite(
        &self,
        client_ids: Vec<String>,
        channel: impl Into<String>,
        server_id: impl Into<String>,
    ) {
        self.send(UserCommand::Invite {
            client_ids,
            channel: channel.into(),
            server_id: server_id.into(),
        })
        .await;
    }

    pub async fn exit(&self, channel: impl Into<String>, server_id: impl Into<String>) {
        self.send(UserCommand::Exit {
            channel: channel.into(),
            server_id: server_id.into(),
        })
        .await;
    }

    /// Change the announced nickname; peers pick it up on the next regular
    /// PDU.
    pub async fn set_nickname(&self, nickname: impl Into<String>) {
        self.send(UserCommand::SetNickname(nickname.into())).await;
    }

    /// Snapshot of the lobby: peer id → nickname.
    pub async fn lobby(&self) -> HashMap<String, String> {
        self.query(UserCommand::Lobby).await.unwrap_or_default()
    }

    /// Snapshot of open sessions as `(server_id, channel)` slots.
    pub async fn sessions(&self) -> Vec<SlotKey> {
        self.query(UserCommand::Sessions).await.unwrap_or_default()
    }

    /// Snapshot of known channel memberships.
    pub async fn membership(&self) -> HashMap<ChannelKey, BTreeSet<String>> {
        self.query(UserCommand::Membership).await.unwrap_or_default()
    }

    /// Rendered lines received on one channel, oldest first.
    pub async fn history(
        &self,
        server_id: impl Into<String>,
        channel: impl Into<String>,
    ) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        self.send(UserCommand::History {
            server_id: server_id.into(),
            channel: channel.into(),
            reply,
        })
        .await;
        rx.await.unwrap_or_default()
    }

    /// Stop the reactor and all of its pump tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, cmd: UserCommand) {
        let _ = self.cmd_tx.send(cmd).await;
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> UserCommand) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await;
        rx.await.ok()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ClientEngine;

impl ClientEngine {
    /// Bind the announcer, generate an id, and start the reactor. Returns
    /// the control handle and the engine's event stream.
    pub fn spawn(config: ClientConfig) -> io::Result<(ClientHandle, mpsc::Receiver<Event>)> {
        let announcer = Arc::new(Announcer::bind(&config.net)?);
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
        let (frame_tx, frame_rx) = mpsc::channel(QUEUE_DEPTH);
        let (datagram_tx, datagram_rx) = mpsc::channel(QUEUE_DEPTH);

        spawn_udp_pump(announcer.clone(), datagram_tx, cancel.child_token());

        let state = ClientState {
            id: id.clone(),
            nickname: config.nickname.clone(),
            cfg: config,
            announcer,
            users: HashMap::new(),
            user_deadlines: DeadlineMap::new(),
            sessions: HashMap::new(),
            server_deadlines: DeadlineMap::new(),
            membership: HashMap::new(),
            history: HashMap::new(),
            pdu_counter: 0,
            events: event_tx,
            frame_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(state.run(cmd_rx, frame_rx, datagram_rx));

        Ok((ClientHandle { id, cmd_tx, cancel }, event_rx))
    }
}

struct Session {
    /// Control endpoint this session (and its channel clones) connects to.
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

struct ClientState {
    id: String,
    nickname: String,
    cfg: ClientConfig,
    announcer: Arc<Announcer>,
    /// Lobby: peer id → nickname.
    users: HashMap<String, String>,
    user_deadlines: DeadlineMap<String>,
    /// Open TCP sessions by slot.
    sessions: HashMap<SlotKey, Session>,
    server_deadlines: DeadlineMap<String>,
    /// Who is in which channel, as far as announcements tell us.
    membership: HashMap<ChannelKey, BTreeSet<String>>,
    history: HashMap<ChannelKey, Vec<String>>,
    pdu_counter: u32,
    events: mpsc::Sender<Event>,
    frame_tx: mpsc::Sender<(SlotKey, Option<Vec<u8>>)>,
    cancel: CancellationToken,
}

impl ClientState {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<UserCommand>,
        mut frame_rx: mpsc::Receiver<(SlotKey, Option<Vec<u8>>)>,
        mut datagram_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) {
        let cancel = self.cancel.clone();
        let mut tick = interval(self.cfg.net.pdu_interval);

        info!("client {} ({:?}) up", self.id, self.nickname);
        loop {
            let deadline = earliest(
                self.user_deadlines.next_deadline(),
                self.server_deadlines.next_deadline(),
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.on_tick().await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_user_command(cmd).await,
                    None => break,
                },
                Some((data, src)) = datagram_rx.recv() => self.on_datagram(&data, src).await,
                Some((slot, payload)) = frame_rx.recv() => self.on_tcp_frame(slot, payload).await,
                _ = sleep_or_forever(deadline) => self.on_deadlines().await,
            }
        }
        self.close_all();
        debug!("client {} reactor stopped", self.id);
    }

    // -------------------------------------------------------------------------
    // periodic announcements
    // -------------------------------------------------------------------------

    async fn on_tick(&mut self) {
        self.announce_nick().await;
        if self.pdu_counter % HEAVY_PDU_CADENCE == 0 {
            self.announce_membership().await;
        }
        self.pdu_counter = self.pdu_counter.wrapping_add(1);
    }

    async fn announce_nick(&self) {
        let pdu = PeerPdu::with_option(
            self.id.clone(),
            PduOption::ClientNick {
                nickname: self.nickname.clone(),
            },
        );
        self.announcer.send_pdu(&pdu).await;
    }

    /// Announce the public channels we belong to, grouped by server.
    /// Private channels never appear; with nothing to say, nothing is sent.
    async fn announce_membership(&self) {
        let servers = self.own_membership();
        if servers.is_empty() {
            return;
        }
        let pdu = PeerPdu::with_option(self.id.clone(), PduOption::ClientMembership { servers });
        self.announcer.send_pdu(&pdu).await;
    }

    fn own_membership(&self) -> Vec<MembershipEntry> {
        let mut by_server: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for ((server_id, channel), members) in &self.membership {
            if members.contains(&self.id) && !is_private_channel(channel) {
                by_server
                    .entry(server_id.clone())
                    .or_default()
                    .push(channel.clone());
            }
        }
        by_server
            .into_iter()
            .map(|(server_id, mut channels)| {
                channels.sort();
                MembershipEntry {
                    server_id,
                    channels,
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // datagram ingestion
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
            match option {
                PduOption::ClientNick { nickname } => self.on_client_nick(&id, nickname).await,
                PduOption::ClientMembership { servers } => {
                    self.on_client_membership(&id, servers).await
                }
                PduOption::Server { port } => self.on_server(&id, src, port).await,
                PduOption::ServerChannels { channels } => {
                    self.on_server_channels(&id, channels).await
                }
                PduOption::ServerInvite {
                    channel_id,
                    client_ids,
                } => self.on_server_invite(&id, channel_id, client_ids).await,
            }
        }
    }

    async fn on_client_nick(&mut self, sender: &str, nickname: String) {
        match self.users.get(sender) {
            None => {
                self.users.insert(sender.to_string(), nickname.clone());
                info!("lobby: {} joined as {:?}", sender, nickname);
                self.emit(Event::ClientNew {
                    id: sender.to_string(),
                    nickname,
                })
                .await;
            }
            Some(current) if *current != nickname => {
                self.users.insert(sender.to_string(), nickname.clone());
                info!("lobby: {} is now {:?}", sender, nickname);
                self.emit(Event::NickChanged {
                    id: sender.to_string(),
                    nickname,
                })
                .await;
            }
            Some(_) => {}
        }
        self.user_deadlines
            .restart(sender.to_string(), self.cfg.net.peer_timeout);
    }

    async fn on_client_membership(&mut self, sender: &str, servers: Vec<MembershipEntry>) {
        for entry in servers {
            let MembershipEntry {
                server_id,
                channels,
            } = entry;
            for channel in channels {
                let inserted = self
                    .membership
                    .entry((server_id.clone(), channel.clone()))
                    .or_default()
                    .insert(sender.to_string());
                if inserted {
                    self.emit(Event::MembershipChanged {
                        server_id: server_id.clone(),
                        channel,
                    })
                    .await;
                }
            }
        }
    }

    async fn on_server(&mut self, sender: &str, src: SocketAddr, port: u16) {
        if !self.sessions.contains_key(&(sender.to_string(), None)) {
            let peer = SocketAddr::new(src.ip(), port);
            match self.open_session(sender, None, peer).await {
                Ok(()) => {
                    info!("discovered server {} at {}", sender, peer);
                    self.emit(Event::ServerNew {
                        id: sender.to_string(),
                        channel: None,
                    })
                    .await;
                }
                Err(e) => {
                    // No session, no timer: the next announcement retries.
                    warn!("cannot reach server {} at {}: {}", sender, peer, e);
                    return;
                }
            }
        }
        self.server_deadlines
            .restart(sender.to_string(), self.cfg.net.peer_timeout);
    }

    async fn on_server_channels(&mut self, sender: &str, channels: Vec<String>) {
        let Some(peer) = self.control_peer(sender) else {
            debug!("channel list from unknown server {}", sender);
            return;
        };
        for channel in channels {
            if self
                .sessions
                .contains_key(&(sender.to_string(), Some(channel.clone())))
            {
                continue;
            }
            match self.open_session(sender, Some(channel.clone()), peer).await {
                Ok(()) => {
                    self.emit(Event::ServerNew {
                        id: sender.to_string(),
                        channel: Some(channel),
                    })
                    .await;
                }
                Err(e) => warn!("cannot open channel {:?} on {}: {}", channel, sender, e),
            }
        }
    }

    /// An invitation is an implicit join: open the channel session, announce
    /// ourselves on it, and record every invitee as a member.
    async fn on_server_invite(&mut self, sender: &str, channel: String, client_ids: Vec<String>) {
        let Some(peer) = self.control_peer(sender) else {
            debug!("invite from unknown server {}", sender);
            return;
        };
        if !self
            .sessions
            .contains_key(&(sender.to_string(), Some(channel.clone())))
        {
            if let Err(e) = self.open_session(sender, Some(channel.clone()), peer).await {
                warn!("cannot honor invite into {:?} on {}: {}", channel, sender, e);
                return;
            }
            info!("invited into {:?} on {}", channel, sender);
            self.send_command(
                sender,
                Some(&channel),
                &Command::Join {
                    channel: channel.clone(),
                },
            )
            .await;
            self.emit(Event::ServerNew {
                id: sender.to_string(),
                channel: Some(channel.clone()),
            })
            .await;
        }
        let mut invited = client_ids;
        invited.push(self.id.clone());
        for client_id in invited {
            let inserted = self
                .membership
                .entry((sender.to_string(), channel.clone()))
                .or_default()
                .insert(client_id);
            if inserted {
                self.emit(Event::MembershipChanged {
                    server_id: sender.to_string(),
                    channel: channel.clone(),
                })
                .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // user commands
    // -------------------------------------------------------------------------

    async fn on_user_command(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::Join { channel, server_id } => self.join(channel, server_id).await,
            UserCommand::Say {
                text,
                channel,
                server_id,
            } => {
                self.send_command(&server_id, Some(&channel), &Command::Say { text })
                    .await
            }
            UserCommand::Standby {
                peer_id,
                channel,
                server_id,
            } => {
                self.send_command(&server_id, Some(&channel), &Command::Standby { peer_id })
                    .await
            }
            UserCommand::Invite {
                client_ids,
                channel,
                server_id,
            } => {
                self.send_command(&server_id, Some(&channel), &Command::Invite { client_ids })
                    .await
            }
            UserCommand::Exit { channel, server_id } => self.exit(channel, server_id).await,
            UserCommand::SetNickname(nickname) => {
                info!("nickname {:?} -> {:?}", self.nickname, nickname);
                self.nickname = nickname;
            }
            UserCommand::Lobby(reply) => {
                let _ = reply.send(self.users.clone());
            }
            UserCommand::Sessions(reply) => {
                let _ = reply.send(self.sessions.keys().cloned().collect());
            }
            UserCommand::Membership(reply) => {
                let _ = reply.send(self.membership.clone());
            }
            UserCommand::History {
                server_id,
                channel,
                reply,
            } => {
                let lines = self
                    .history
                    .get(&(server_id, channel))
                    .cloned()
                    .unwrap_or_default();
                let _ = reply.send(lines);
            }
        }
    }

    async fn join(&mut self, channel: String, server_id: String) {
        let Some(peer) = self.control_peer(&server_id) else {
            error!("join {:?}: unknown server {}", channel, server_id);
            return;
        };
        if !self
            .sessions
            .contains_key(&(server_id.clone(), Some(channel.clone())))
        {
            if let Err(e) = self
                .open_session(&server_id, Some(channel.clone()), peer)
                .await
            {
                warn!("join {:?} on {}: {}", channel, server_id, e);
                return;
            }
            self.emit(Event::ServerNew {
                id: server_id.clone(),
                channel: Some(channel.clone()),
            })
            .await;
        }
        self.send_command(
            &server_id,
            Some(&channel),
            &Command::Join {
                channel: channel.clone(),
            },
        )
        .await;
        let inserted = self
            .membership
            .entry((server_id.clone(), channel.clone()))
            .or_default()
            .insert(self.id.clone());
        if inserted {
            self.emit(Event::MembershipChanged {
                server_id: server_id.clone(),
                channel,
            })
            .await;
        }
        self.announce_membership().await;
    }

    async fn exit(&mut self, channel: String, server_id: String) {
        if !self
            .sessions
            .contains_key(&(server_id.clone(), Some(channel.clone())))
        {
            error!("exit {:?}: no session on {}", channel, server_id);
            return;
        }
        self.send_command(&server_id, Some(&channel), &Command::Exit)
            .await;
        if self
            .membership
            .remove(&(server_id.clone(), channel.clone()))
            .is_some()
        {
            self.emit(Event::MembershipChanged { server_id, channel }).await;
        }
        self.announce_membership().await;
    }

    // -------------------------------------------------------------------------
    // TCP ingestion
    // -------------------------------------------------------------------------

    async fn on_tcp_frame(&mut self, slot: SlotKey, payload: Option<Vec<u8>>) {
        let Some(payload) = payload else {
            if let Some(session) = self.sessions.remove(&slot) {
                session.reader.abort();
                debug!("session {:?} closed by server", slot);
            }
            // Without a live socket we are no longer in that channel, so
            // stop announcing it.
            let (server_id, channel) = slot;
            if let Some(channel) = channel {
                if self
                    .membership
                    .remove(&(server_id.clone(), channel.clone()))
                    .is_some()
                {
                    self.emit(Event::MembershipChanged { server_id, channel }).await;
                }
            }
            return;
        };
        let (server_id, channel) = slot;
        match Command::parse(&payload) {
            Ok(Command::SayFrom { author_id, text }) => {
                let Some(channel) = channel else {
                    debug!("relay on control session of {}; ignoring", server_id);
                    return;
                };
                self.on_say(server_id, channel, author_id, text).await;
            }
            Ok(Command::Pdu(pdu)) => {
                for option in pdu.options {
                    if let PduOption::ServerInvite {
                        channel_id,
                        client_ids,
                    } = option
                    {
                        self.on_server_invite(&server_id, channel_id, client_ids)
                            .await;
                    }
                }
            }
            Ok(other) => debug!("ignoring {:?} from server {}", other, server_id),
            Err(e) => {
                warn!("closing session ({}, {:?}): {}", server_id, channel, e);
                if let Some(session) = self.sessions.remove(&(server_id, channel)) {
                    session.reader.abort();
                }
            }
        }
    }

    async fn on_say(
        &mut self,
        server_id: String,
        channel: String,
        author_id: String,
        text: String,
    ) {
        let nick = self
            .users
            .get(&author_id)
            .cloned()
            .unwrap_or_else(|| author_id.clone());
        let line = format!("[{}] {}: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), nick, text);
        self.history
            .entry((server_id.clone(), channel.clone()))
            .or_default()
            .push(line.clone());
        self.emit(Event::MessageReceived {
            server_id,
            channel,
            line,
        })
        .await;
    }

    // -------------------------------------------------------------------------
    // liveness
    // -------------------------------------------------------------------------

    async fn on_deadlines(&mut self) {
        let now = Instant::now();
        for user in self.user_deadlines.pop_expired(now) {
            if self.users.remove(&user).is_some() {
                info!("lobby: {} timed out", user);
                self.emit(Event::ClientRemoved { id: user }).await;
            }
        }
        for server_id in self.server_deadlines.pop_expired(now) {
            self.drop_server(&server_id).await;
        }
    }

    /// Close every session of a silent server, then drop its bookkeeping.
    async fn drop_server(&mut self, server_id: &str) {
        let slots: Vec<SlotKey> = self
            .sessions
            .keys()
            .filter(|(sid, _)| sid == server_id)
            .cloned()
            .collect();
        for slot in slots {
            if let Some(session) = self.sessions.remove(&slot) {
                session.reader.abort();
            }
        }
        let stale: Vec<ChannelKey> = self
            .membership
            .keys()
            .filter(|(sid, _)| sid == server_id)
            .cloned()
            .collect();
        for key in stale {
            self.membership.remove(&key);
        }
        info!("server {} timed out", server_id);
        self.emit(Event::ServerRemoved {
            id: server_id.to_string(),
        })
        .await;
    }

    // -------------------------------------------------------------------------
    // session plumbing
    // -------------------------------------------------------------------------

    fn control_peer(&self, server_id: &str) -> Option<SocketAddr> {
        self.sessions
            .get(&(server_id.to_string(), None))
            .map(|s| s.peer)
    }

    async fn open_session(
        &mut self,
        server_id: &str,
        channel: Option<String>,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let stream = timeout(self.cfg.net.waiting_time, TcpStream::connect(peer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        let (read_half, writer) = stream.into_split();
        let slot = (server_id.to_string(), channel);
        let reader = spawn_frame_reader(
            read_half,
            slot.clone(),
            self.frame_tx.clone(),
            self.cancel.child_token(),
        );
        self.sessions.insert(
            slot,
            Session {
                peer,
                writer,
                reader,
            },
        );
        Ok(())
    }

    async fn send_command(&mut self, server_id: &str, channel: Option<&str>, command: &Command) {
        let slot = (server_id.to_string(), channel.map(str::to_string));
        let waiting = self.cfg.net.waiting_time;
        let Some(session) = self.sessions.get_mut(&slot) else {
            error!("no session for server {} channel {:?}", server_id, channel);
            return;
        };
        let frame = match command.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("cannot encode command: {}", e);
                return;
            }
        };
        if let Err(e) = send_frame(&mut session.writer, &frame, waiting).await {
            warn!("send to {} {:?} failed: {}", server_id, channel, e);
        }
    }

    fn close_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.reader.abort();
        }
    }

    async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }
}

async fn sleep_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
