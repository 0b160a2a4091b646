//! Protocol constants, engine configuration, and the event vocabulary.
//!
//! Timing values are the protocol's reference values; the configs carry them
//! as fields so tests can shrink the windows without touching the constants.

use std::net::Ipv4Addr;
use std::time::Duration;

// =============================================================================
// MULTICAST TRANSPORT
// =============================================================================

/// IPv4 multicast group every InstantSOUP host joins. Administratively
/// scoped (239/8): announcements never leave the local network.
pub const GROUP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 99, 63);

/// UDP port for all announcements. Bound with address reuse so every engine
/// on a host (client and any servers) shares it.
pub const BROADCAST_PORT: u16 = 55555;

/// Reference base for server TCP listeners. Discovery is by advertisement,
/// not by well-known port; passing port 0 lets the OS assign one instead.
pub const SERVER_BASE_PORT: u16 = 49190;

/// Upper bound on an encoded PDU. Keeps every announcement inside a single
/// unfragmented IP datagram on common 1500-byte MTU links.
pub const MAX_DATAGRAM: usize = 1400;

// =============================================================================
// TIMING
// =============================================================================

/// Interval between regular keep-alive PDUs.
pub const REGULAR_PDU_INTERVAL: Duration = Duration::from_millis(15_000);

/// Bound on TCP connect and send completion. A server that cannot be
/// reached within this window is retried on its next announcement.
pub const DEFAULT_WAITING_TIME: Duration = Duration::from_millis(1_000);

/// Eviction window for peers and servers: two missed regular PDUs plus the
/// waiting allowance. A fresh PDU restarts the window.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(31_000);

/// Heavier options (memberships, channel lists) ride along on every fourth
/// regular PDU rather than every one.
pub const HEAVY_PDU_CADENCE: u32 = 4;

/// Delay before the one-shot channel announcement a server schedules when a
/// new client appears in the lobby.
pub const CHANNELS_ANNOUNCE_DELAY: Duration = Duration::from_millis(1_000);

/// Depth of the command and event queues between an engine and its caller.
pub const QUEUE_DEPTH: usize = 64;

/// Channels whose name starts with this are private: never advertised, and
/// entered by invitation only.
pub const PRIVATE_CHANNEL_PREFIX: char = '@';

/// Whether a channel name marks a private channel.
pub fn is_private_channel(name: &str) -> bool {
    name.starts_with(PRIVATE_CHANNEL_PREFIX)
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Transport and timing parameters shared by both engines.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Multicast group to join.
    pub group: Ipv4Addr,
    /// UDP announcement port.
    pub udp_port: u16,
    /// Regular PDU interval.
    pub pdu_interval: Duration,
    /// Peer/server eviction window.
    pub peer_timeout: Duration,
    /// TCP connect/send bound.
    pub waiting_time: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            group: GROUP_ADDR,
            udp_port: BROADCAST_PORT,
            pdu_interval: REGULAR_PDU_INTERVAL,
            peer_timeout: DEFAULT_TIMEOUT,
            waiting_time: DEFAULT_WAITING_TIME,
        }
    }
}

/// Client engine configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Nickname announced in `CLIENT_NICK` options.
    pub nickname: String,
    pub net: NetConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            net: NetConfig::default(),
        }
    }
}

/// Server engine configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listening port to advertise. 0 asks the OS for a free port,
    /// which is read back and advertised instead.
    pub tcp_port: u16,
    pub net: NetConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: SERVER_BASE_PORT,
            net: NetConfig::default(),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Typed events an engine delivers to its presentation layer.
///
/// Ordering within one event kind follows the engine's reactor order; a
/// `ServerNew` for a server always precedes any `MessageReceived` that
/// references it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A previously unknown peer appeared in the lobby.
    ClientNew { id: String, nickname: String },
    /// A lobby peer went silent past the eviction window.
    ClientRemoved { id: String },
    /// A known peer announced a different nickname.
    NickChanged { id: String, nickname: String },
    /// A server (channel `None`) or one of its channels was discovered and
    /// a TCP session to it is open.
    ServerNew {
        id: String,
        channel: Option<String>,
    },
    /// A server went silent; all of its sessions were closed.
    ServerRemoved { id: String },
    /// Somebody's channel membership changed.
    MembershipChanged { server_id: String, channel: String },
    /// A relayed chat line arrived and was appended to the channel history.
    MessageReceived {
        server_id: String,
        channel: String,
        line: String,
    },
}
