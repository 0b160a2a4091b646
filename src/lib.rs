pub mod codec;
pub mod net;

pub use codec::{CodecError, Command, MembershipEntry, PduOption, PeerPdu};
pub use net::{
    Announcer, ClientConfig, ClientEngine, ClientHandle, DeadlineMap, Event, NetConfig,
    ServerConfig, ServerEngine, ServerHandle,
};
pub use net::{
    BROADCAST_PORT, DEFAULT_TIMEOUT, DEFAULT_WAITING_TIME, GROUP_ADDR, REGULAR_PDU_INTERVAL,
    SERVER_BASE_PORT,
};
