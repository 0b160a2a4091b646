//! Wire codecs for the two InstantSOUP framing languages.
//!
//! UDP multicast carries *peer PDUs*: a NUL-terminated sender id followed by
//! a greedy sequence of tagged options running to the end of the datagram.
//! TCP carries *commands*: a little-endian `u32` length prefix and a payload
//! of NUL-separated fields led by an ASCII verb.
//!
//! A full peer PDU may also travel as a command payload (the server invites
//! clients into private channels this way); [`Command::parse`] falls back to
//! the PDU language whenever the payload does not match the verb language.
//!
//! All integers are little-endian. All strings are UTF-8 and, inside PDUs,
//! NUL-terminated — which means no field may itself contain a NUL byte.
//! Builders reject such values instead of emitting unparseable bytes.

use thiserror::Error;

// =============================================================================
// OPTION TAGS
// =============================================================================

pub const OPT_CLIENT_NICK: u8 = 0x01;
pub const OPT_CLIENT_MEMBERSHIP: u8 = 0x02;
pub const OPT_SERVER: u8 = 0x10;
pub const OPT_SERVER_CHANNELS: u8 = 0x11;
pub const OPT_SERVER_INVITE: u8 = 0x12;

/// Size of the `u32` length prefix on a TCP command frame.
pub const FRAME_HEADER_LEN: usize = 4;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A UDP datagram did not decode as a peer PDU. The datagram is dropped;
    /// peer state is left untouched.
    #[error("malformed pdu: {0}")]
    MalformedPdu(&'static str),

    /// A TCP payload did not decode as a command (nor, where applicable, as
    /// a framed peer PDU).
    #[error("malformed command: {0}")]
    MalformedCommand(&'static str),

    /// Not enough bytes buffered to decode a full frame. The caller keeps
    /// accumulating and retries once more bytes arrive.
    #[error("frame truncated: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    /// A value cannot be represented on the wire (embedded NUL, or a
    /// collection larger than its `u8` count field).
    #[error("unencodable value: {0}")]
    Unencodable(&'static str),
}

// =============================================================================
// PEER PDU
// =============================================================================

/// One server's worth of channel memberships inside a `CLIENT_MEMBERSHIP`
/// option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry {
    pub server_id: String,
    pub channels: Vec<String>,
}

/// A single tagged option inside a peer PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduOption {
    /// `0x01` — the sender's current nickname.
    ClientNick { nickname: String },
    /// `0x02` — the sender's public channel memberships, grouped by server.
    ClientMembership { servers: Vec<MembershipEntry> },
    /// `0x10` — the sender hosts a server listening on this TCP port.
    Server { port: u16 },
    /// `0x11` — the public channels the sending server currently hosts.
    ServerChannels { channels: Vec<String> },
    /// `0x12` — invitation of the listed clients into a channel.
    ServerInvite {
        channel_id: String,
        client_ids: Vec<String>,
    },
}

impl PduOption {
    pub fn tag(&self) -> u8 {
        match self {
            PduOption::ClientNick { .. } => OPT_CLIENT_NICK,
            PduOption::ClientMembership { .. } => OPT_CLIENT_MEMBERSHIP,
            PduOption::Server { .. } => OPT_SERVER,
            PduOption::ServerChannels { .. } => OPT_SERVER_CHANNELS,
            PduOption::ServerInvite { .. } => OPT_SERVER_INVITE,
        }
    }
}

/// One UDP multicast datagram: sender id plus zero or more options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPdu {
    pub id: String,
    pub options: Vec<PduOption>,
}

impl PeerPdu {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            options: Vec::new(),
        }
    }

    pub fn with_option(id: impl Into<String>, option: PduOption) -> Self {
        Self {
            id: id.into(),
            options: vec![option],
        }
    }

    /// Decode a whole datagram. Options are consumed greedily until the
    /// buffer is exhausted; anything short, unknown, or non-UTF-8 fails the
    /// entire datagram.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let id = r.cstring()?;
        let mut options = Vec::new();
        while !r.is_empty() {
            options.push(parse_option(&mut r)?);
        }
        Ok(Self { id, options })
    }

    /// Encode to datagram bytes. Exact inverse of [`PeerPdu::parse`] on
    /// well-formed values.
    pub fn build(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(64);
        put_cstring(&mut out, &self.id)?;
        for option in &self.options {
            build_option(&mut out, option)?;
        }
        Ok(out)
    }
}

fn parse_option(r: &mut Reader<'_>) -> Result<PduOption, CodecError> {
    let tag = r.u8()?;
    match tag {
        OPT_CLIENT_NICK => Ok(PduOption::ClientNick {
            nickname: r.cstring()?,
        }),
        OPT_CLIENT_MEMBERSHIP => {
            let num_servers = r.u8()?;
            let mut servers = Vec::with_capacity(num_servers as usize);
            for _ in 0..num_servers {
                let server_id = r.cstring()?;
                let num_channels = r.u8()?;
                let mut channels = Vec::with_capacity(num_channels as usize);
                for _ in 0..num_channels {
                    channels.push(r.cstring()?);
                }
                servers.push(MembershipEntry {
                    server_id,
                    channels,
                });
            }
            Ok(PduOption::ClientMembership { servers })
        }
        OPT_SERVER => Ok(PduOption::Server { port: r.u16_le()? }),
        OPT_SERVER_CHANNELS => {
            let num_channels = r.u8()?;
            let mut channels = Vec::with_capacity(num_channels as usize);
            for _ in 0..num_channels {
                channels.push(r.cstring()?);
            }
            Ok(PduOption::ServerChannels { channels })
        }
        OPT_SERVER_INVITE => {
            let channel_id = r.cstring()?;
            let num_clients = r.u8()?;
            let mut client_ids = Vec::with_capacity(num_clients as usize);
            for _ in 0..num_clients {
                client_ids.push(r.cstring()?);
            }
            Ok(PduOption::ServerInvite {
                channel_id,
                client_ids,
            })
        }
        _ => Err(CodecError::MalformedPdu("unknown option tag")),
    }
}

fn build_option(out: &mut Vec<u8>, option: &PduOption) -> Result<(), CodecError> {
    out.push(option.tag());
    match option {
        PduOption::ClientNick { nickname } => put_cstring(out, nickname)?,
        PduOption::ClientMembership { servers } => {
            out.push(count_u8(servers.len())?);
            for entry in servers {
                put_cstring(out, &entry.server_id)?;
                out.push(count_u8(entry.channels.len())?);
                for channel in &entry.channels {
                    put_cstring(out, channel)?;
                }
            }
        }
        PduOption::Server { port } => out.extend_from_slice(&port.to_le_bytes()),
        PduOption::ServerChannels { channels } => {
            out.push(count_u8(channels.len())?);
            for channel in channels {
                put_cstring(out, channel)?;
            }
        }
        PduOption::ServerInvite {
            channel_id,
            client_ids,
        } => {
            put_cstring(out, channel_id)?;
            out.push(count_u8(client_ids.len())?);
            for id in client_ids {
                put_cstring(out, id)?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// COMMANDS (TCP)
// =============================================================================

/// A decoded TCP command payload.
///
/// `Say` is the client→server form; `SayFrom` is the server→member relay
/// form carrying the attributed author and a trailing NUL. The two are
/// distinguished purely by shape, so a round trip preserves direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `JOIN\0<channel>`
    Join { channel: String },
    /// `SAY\0<text>`
    Say { text: String },
    /// `SAY\0<author_id>\0<text>\0`
    SayFrom { author_id: String, text: String },
    /// `EXIT`
    Exit,
    /// `STANDBY\0<peer_id>` — vocabulary only; accepted and ignored.
    Standby { peer_id: String },
    /// `INVITE\0<client_id>[\0<client_id>…]`
    Invite { client_ids: Vec<String> },
    /// A full peer PDU framed as a command payload.
    Pdu(PeerPdu),
}

impl Command {
    /// Decode a command payload (the bytes *inside* the length prefix).
    ///
    /// Anything that does not match the verb language — unknown verb or
    /// wrong operand shape — falls back to the peer-PDU language; if that
    /// fails too the payload is malformed and the connection policy
    /// applies.
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::MalformedCommand("empty payload"));
        }
        let parts: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
        match parts[0] {
            b"JOIN" if parts.len() == 2 => Ok(Command::Join {
                channel: field(parts[1])?,
            }),
            b"SAY" if parts.len() == 2 => Ok(Command::Say {
                text: field(parts[1])?,
            }),
            b"SAY" if parts.len() == 4 && parts[3].is_empty() => Ok(Command::SayFrom {
                author_id: field(parts[1])?,
                text: field(parts[2])?,
            }),
            b"EXIT" if parts.len() == 1 => Ok(Command::Exit),
            b"STANDBY" if parts.len() == 2 => Ok(Command::Standby {
                peer_id: field(parts[1])?,
            }),
            b"INVITE" if parts.len() >= 2 => Ok(Command::Invite {
                client_ids: parts[1..]
                    .iter()
                    .map(|p| field(p))
                    .collect::<Result<_, _>>()?,
            }),
            _ => PeerPdu::parse(payload)
                .map(Command::Pdu)
                .map_err(|_| CodecError::MalformedCommand("not a command")),
        }
    }

    /// Encode the command payload (without the length prefix).
    pub fn build(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(32);
        match self {
            Command::Join { channel } => {
                out.extend_from_slice(b"JOIN\0");
                put_field(&mut out, channel)?;
            }
            Command::Say { text } => {
                out.extend_from_slice(b"SAY\0");
                put_field(&mut out, text)?;
            }
            Command::SayFrom { author_id, text } => {
                out.extend_from_slice(b"SAY\0");
                put_field(&mut out, author_id)?;
                out.push(0);
                put_field(&mut out, text)?;
                out.push(0);
            }
            Command::Exit => out.extend_from_slice(b"EXIT"),
            Command::Standby { peer_id } => {
                out.extend_from_slice(b"STANDBY\0");
                put_field(&mut out, peer_id)?;
            }
            Command::Invite { client_ids } => {
                if client_ids.is_empty() {
                    return Err(CodecError::Unencodable("invite with no client ids"));
                }
                out.extend_from_slice(b"INVITE");
                for id in client_ids {
                    out.push(0);
                    put_field(&mut out, id)?;
                }
            }
            Command::Pdu(pdu) => out = pdu.build()?,
        }
        Ok(out)
    }

    /// Encode the command as a complete length-prefixed frame, ready to
    /// write to a TCP stream.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        Ok(encode_frame(&self.build()?))
    }
}

/// Prefix a payload with its little-endian `u32` length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Try to split one frame off the front of a receive buffer.
///
/// Returns the payload slice and the total number of bytes consumed
/// (prefix included). [`CodecError::Truncated`] means the caller should
/// read more bytes and retry; it is not a protocol violation.
pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(CodecError::Truncated {
            have: buf.len(),
            need: FRAME_HEADER_LEN,
        });
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let need = FRAME_HEADER_LEN + len;
    if buf.len() < need {
        return Err(CodecError::Truncated {
            have: buf.len(),
            need,
        });
    }
    Ok((&buf[FRAME_HEADER_LEN..need], need))
}

// =============================================================================
// PRIMITIVES
// =============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(CodecError::MalformedPdu("short option body"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16_le(&mut self) -> Result<u16, CodecError> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn cstring(&mut self) -> Result<String, CodecError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::MalformedPdu("unterminated string"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| CodecError::MalformedPdu("invalid utf-8"))?;
        self.pos += nul + 1;
        Ok(s.to_string())
    }
}

fn put_cstring(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    if s.as_bytes().contains(&0) {
        return Err(CodecError::Unencodable("embedded NUL in string"));
    }
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

fn put_field(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    if s.as_bytes().contains(&0) {
        return Err(CodecError::Unencodable("embedded NUL in field"));
    }
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn count_u8(len: usize) -> Result<u8, CodecError> {
    u8::try_from(len).map_err(|_| CodecError::Unencodable("count exceeds u8"))
}

fn field(bytes: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| CodecError::MalformedCommand("invalid utf-8"))
}

// =============================================================================
// TESTS
// =============================================================================
