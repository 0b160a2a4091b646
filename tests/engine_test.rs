//! Engine integration tests.
//!
//! Each test gives its engines unique announcement ports and plays postman:
//! discovery PDUs are injected by plain unicast into an engine's socket, so
//! nothing here depends on the host actually delivering multicast. TCP flows
//! through real loopback connections to a real server engine. The one
//! full-multicast test at the bottom skips itself when the environment
//! cannot loop multicast back.
//!
//! Run with: cargo test --test engine_test

use instantsoup::{
    Announcer, ClientConfig, ClientEngine, ClientHandle, Event, NetConfig, PduOption, PeerPdu,
    ServerConfig, ServerEngine, ServerHandle,
};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Shrunken protocol timing so liveness tests finish in milliseconds.
fn net_config(udp_port: u16) -> NetConfig {
    NetConfig {
        udp_port,
        pdu_interval: Duration::from_millis(200),
        peer_timeout: Duration::from_millis(1200),
        waiting_time: Duration::from_millis(500),
        ..NetConfig::default()
    }
}

fn client_config(nickname: &str, udp_port: u16) -> ClientConfig {
    ClientConfig {
        nickname: nickname.to_string(),
        net: net_config(udp_port),
    }
}

fn server_config(udp_port: u16) -> ServerConfig {
    ServerConfig {
        tcp_port: 0,
        net: net_config(udp_port),
    }
}

/// Unicast PDU injector standing in for the multicast fabric.
struct Injector {
    socket: UdpSocket,
}

impl Injector {
    async fn new() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    async fn send(&self, pdu: &PeerPdu, to_port: u16) {
        let bytes = pdu.build().unwrap();
        self.socket
            .send_to(&bytes, ("127.0.0.1", to_port))
            .await
            .unwrap();
    }

    async fn nick(&self, id: &str, nickname: &str, to_port: u16) {
        self.send(
            &PeerPdu::with_option(
                id,
                PduOption::ClientNick {
                    nickname: nickname.to_string(),
                },
            ),
            to_port,
        )
        .await;
    }

    async fn server(&self, id: &str, tcp_port: u16, to_port: u16) {
        self.send(
            &PeerPdu::with_option(id, PduOption::Server { port: tcp_port }),
            to_port,
        )
        .await;
    }
}

async fn wait_for(
    events: &mut mpsc::Receiver<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert no event matching `pred` shows up within `window`.
async fn expect_none(
    events: &mut mpsc::Receiver<Event>,
    window: Duration,
    pred: impl Fn(&Event) -> bool,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) => assert!(!pred(&event), "unexpected event: {:?}", event),
            Ok(None) | Err(_) => return,
        }
    }
}

async fn wait_member(server: &ServerHandle, channel: &str, client_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let channels = server.channels().await;
        if channels
            .get(channel)
            .is_some_and(|members| members.contains(client_id))
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never appeared in {:?} (channels: {:?})",
            client_id,
            channel,
            channels
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Stand up a client that has discovered the given server under the alias
/// `sid`, with its nickname already attributed in the server's lobby.
async fn discovered_client(
    nickname: &str,
    udp_port: u16,
    sid: &str,
    server: &ServerHandle,
    server_udp_port: u16,
    injector: &Injector,
) -> (ClientHandle, mpsc::Receiver<Event>) {
    let (client, mut events) = ClientEngine::spawn(client_config(nickname, udp_port)).unwrap();
    injector.nick(client.id(), nickname, server_udp_port).await;
    injector.server(sid, server.port(), udp_port).await;
    wait_for(&mut events, |e| {
        matches!(e, Event::ServerNew { id, channel: None } if id == sid)
    })
    .await;
    (client, events)
}

// =============================================================================
// LOBBY
// =============================================================================

#[tokio::test]
async fn lobby_tracks_peers_and_nick_changes() {
    let (client, mut events) = ClientEngine::spawn(client_config("me", 40610)).unwrap();
    let injector = Injector::new().await;

    injector.nick("peer-1", "alice", 40610).await;
    let event = wait_for(&mut events, |e| matches!(e, Event::ClientNew { .. })).await;
    assert_eq!(
        event,
        Event::ClientNew {
            id: "peer-1".into(),
            nickname: "alice".into()
        }
    );
    assert_eq!(client.lobby().await.get("peer-1"), Some(&"alice".to_string()));

    // A repeated identical announcement is idempotent; a changed nickname
    // updates in place.
    injector.nick("peer-1", "alice", 40610).await;
    injector.nick("peer-1", "alice2", 40610).await;
    let event = wait_for(&mut events, |e| {
        matches!(e, Event::NickChanged { .. } | Event::ClientNew { .. })
    })
    .await;
    assert_eq!(
        event,
        Event::NickChanged {
            id: "peer-1".into(),
            nickname: "alice2".into()
        }
    );
    assert_eq!(
        client.lobby().await.get("peer-1"),
        Some(&"alice2".to_string())
    );

    client.shutdown();
}

#[tokio::test]
async fn silent_peer_is_evicted_exactly_once() {
    let (client, mut events) = ClientEngine::spawn(client_config("me", 40620)).unwrap();
    let injector = Injector::new().await;

    injector.nick("peer-1", "alice", 40620).await;
    wait_for(&mut events, |e| matches!(e, Event::ClientNew { .. })).await;

    // No further announcements: the eviction window runs out.
    let event = wait_for(&mut events, |e| matches!(e, Event::ClientRemoved { .. })).await;
    assert_eq!(
        event,
        Event::ClientRemoved {
            id: "peer-1".into()
        }
    );
    assert!(client.lobby().await.is_empty());
    expect_none(&mut events, Duration::from_millis(400), |e| {
        matches!(e, Event::ClientRemoved { .. })
    })
    .await;

    client.shutdown();
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[tokio::test]
async fn repeated_server_announcements_open_one_session() {
    let (server, _server_events) = ServerEngine::spawn(server_config(40630)).unwrap();
    let (client, mut events) = ClientEngine::spawn(client_config("me", 40631)).unwrap();
    let injector = Injector::new().await;

    injector.server("S", server.port(), 40631).await;
    injector.server("S", server.port(), 40631).await;
    wait_for(&mut events, |e| {
        matches!(e, Event::ServerNew { id, channel: None } if id == "S")
    })
    .await;

    injector.server("S", server.port(), 40631).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sessions = client.sessions().await;
    assert_eq!(sessions, vec![("S".to_string(), None)]);
    expect_none(&mut events, Duration::from_millis(200), |e| {
        matches!(e, Event::ServerNew { .. })
    })
    .await;

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn silent_server_is_evicted_with_sessions_closed() {
    let (server, _server_events) = ServerEngine::spawn(server_config(40640)).unwrap();
    let (client, mut events) = ClientEngine::spawn(client_config("me", 40641)).unwrap();
    let injector = Injector::new().await;

    injector.server("S", server.port(), 40641).await;
    wait_for(&mut events, |e| matches!(e, Event::ServerNew { .. })).await;

    let event = wait_for(&mut events, |e| matches!(e, Event::ServerRemoved { .. })).await;
    assert_eq!(event, Event::ServerRemoved { id: "S".into() });
    assert!(client.sessions().await.is_empty());
    expect_none(&mut events, Duration::from_millis(400), |e| {
        matches!(e, Event::ServerRemoved { .. })
    })
    .await;

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn join_from_unannounced_host_is_dropped() {
    let (server, _server_events) = ServerEngine::spawn(server_config(40650)).unwrap();
    let (client, mut events) = ClientEngine::spawn(client_config("ghost", 40651)).unwrap();
    let injector = Injector::new().await;

    // The server never saw a CLIENT_NICK from this host, so the join
    // cannot be attributed and is dropped.
    injector.server("S", server.port(), 40651).await;
    wait_for(&mut events, |e| matches!(e, Event::ServerNew { .. })).await;
    client.join("#general", "S").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.channels().await.is_empty());

    client.shutdown();
    server.shutdown();
}

// =============================================================================
// CHANNELS
// =============================================================================

#[tokio::test]
async fn say_fans_out_to_channel_members() {
    let (server, _server_events) = ServerEngine::spawn(server_config(40660)).unwrap();
    let injector = Injector::new().await;

    let (alice, mut alice_events) =
        discovered_client("alice", 40661, "S", &server, 40660, &injector).await;
    alice.join("#general", "S").await;
    wait_member(&server, "#general", alice.id()).await;

    let (bob, mut bob_events) =
        discovered_client("bob", 40662, "S", &server, 40660, &injector).await;
    // Bob needs alice in his lobby to render her nickname.
    injector.nick(alice.id(), "alice", 40662).await;
    wait_for(&mut bob_events, |e| matches!(e, Event::ClientNew { .. })).await;
    bob.join("#general", "S").await;
    wait_member(&server, "#general", bob.id()).await;

    alice.say("hi", "#general", "S").await;

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;
    let Event::MessageReceived {
        server_id,
        channel,
        line,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(server_id, "S");
    assert_eq!(channel, "#general");
    assert!(line.ends_with("alice: hi"), "line was {:?}", line);
    assert_eq!(bob.history("S", "#general").await, vec![line]);

    // The sender is a member too and gets her own relay back.
    wait_for(&mut alice_events, |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;

    let channels = server.channels().await;
    assert_eq!(channels["#general"].len(), 2);

    alice.shutdown();
    bob.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn exit_stops_delivery_to_the_leaver() {
    let (server, _server_events) = ServerEngine::spawn(server_config(40670)).unwrap();
    let injector = Injector::new().await;

    let (alice, mut alice_events) =
        discovered_client("alice", 40671, "S", &server, 40670, &injector).await;
    alice.join("#general", "S").await;
    wait_member(&server, "#general", alice.id()).await;

    let (bob, mut bob_events) =
        discovered_client("bob", 40672, "S", &server, 40670, &injector).await;
    bob.join("#general", "S").await;
    wait_member(&server, "#general", bob.id()).await;

    bob.exit("#general", "S").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let channels = server.channels().await;
        let gone = channels
            .get("#general")
            .map_or(true, |members| !members.contains(bob.id()));
        if gone {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "bob never left");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    alice.say("anyone?", "#general", "S").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;
    expect_none(&mut bob_events, Duration::from_millis(400), |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await;

    alice.shutdown();
    bob.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn private_channel_invite_onboards_the_invitee() {
    let (server, _server_events) = ServerEngine::spawn(server_config(40680)).unwrap();
    let injector = Injector::new().await;

    // Attribution is per host address, so order matters on loopback: the
    // last CLIENT_NICK the server saw decides who a new join belongs to.
    let (alice, mut alice_events) =
        discovered_client("alice", 40681, "S", &server, 40680, &injector).await;
    alice.join("@secret", "S").await;
    wait_member(&server, "@secret", alice.id()).await;
    wait_for(&mut alice_events, |e| {
        matches!(e, Event::MembershipChanged { channel, .. } if channel == "@secret")
    })
    .await;

    let (bob, mut bob_events) =
        discovered_client("bob", 40682, "S", &server, 40680, &injector).await;
    bob.join("#general", "S").await;
    wait_member(&server, "#general", bob.id()).await;

    alice
        .invite(vec![bob.id().to_string()], "@secret", "S")
        .await;

    // Bob is pulled into the private channel through his existing session.
    wait_member(&server, "@secret", bob.id()).await;
    wait_for(&mut bob_events, |e| {
        matches!(e, Event::ServerNew { channel: Some(ch), .. } if ch == "@secret")
    })
    .await;
    let membership = bob.membership().await;
    let members = &membership[&("S".to_string(), "@secret".to_string())];
    assert!(members.contains(bob.id()));

    alice.shutdown();
    bob.shutdown();
    server.shutdown();
}

// =============================================================================
// MULTICAST END-TO-END
// =============================================================================

/// Full-stack discovery over real multicast, including the rule that
/// private channels are never advertised. Skips itself when the host cannot
/// loop multicast back (some CI sandboxes cannot).
#[tokio::test]
async fn server_never_advertises_private_channels() {
    let udp_port = 40690;
    let (server, _server_events) = ServerEngine::spawn(server_config(udp_port)).unwrap();
    let observer = Announcer::bind(&net_config(udp_port)).unwrap();

    // Probe: does this host deliver its own multicast at all?
    let mut buf = [0u8; 2048];
    let mut saw_server = false;
    let probe_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < probe_deadline {
        let remaining = probe_deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, observer.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                if let Ok(pdu) = PeerPdu::parse(&buf[..len]) {
                    if pdu.id == server.id()
                        && pdu
                            .options
                            .iter()
                            .any(|o| matches!(o, PduOption::Server { .. }))
                    {
                        saw_server = true;
                        break;
                    }
                }
            }
            _ => break,
        }
    }
    if !saw_server {
        eprintln!("multicast loopback unavailable; skipping");
        server.shutdown();
        return;
    }

    // Multicast works: run a client on the same fabric, no injection.
    let (alice, mut alice_events) =
        ClientEngine::spawn(client_config("alice", udp_port)).unwrap();
    let event = wait_for(&mut alice_events, |e| {
        matches!(e, Event::ServerNew { channel: None, .. })
    })
    .await;
    let Event::ServerNew { id: sid, .. } = event else {
        unreachable!()
    };

    alice.join("#general", &sid).await;
    wait_member(&server, "#general", alice.id()).await;
    alice.join("@secret", &sid).await;
    wait_member(&server, "@secret", alice.id()).await;

    // Watch announcements long enough to cover the accelerated and the
    // periodic channel list; "@secret" must never appear.
    let mut channel_lists = 0;
    let watch_deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
    while tokio::time::Instant::now() < watch_deadline {
        let remaining = watch_deadline.saturating_duration_since(tokio::time::Instant::now());
        let Ok(Ok((len, _))) = timeout(remaining, observer.recv_from(&mut buf)).await else {
            break;
        };
        let Ok(pdu) = PeerPdu::parse(&buf[..len]) else {
            continue;
        };
        if pdu.id != server.id() {
            continue;
        }
        for option in &pdu.options {
            if let PduOption::ServerChannels { channels } = option {
                channel_lists += 1;
                assert!(channels.contains(&"#general".to_string()));
                assert!(
                    !channels.iter().any(|c| c.starts_with('@')),
                    "private channel advertised: {:?}",
                    channels
                );
            }
        }
    }
    assert!(channel_lists > 0, "no channel announcements observed");

    alice.shutdown();
    server.shutdown();
}
