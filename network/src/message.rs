//! Protocol messages and their payload encodings.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use consensus::{
    Block, BlockHash, BlockHeader, Decodable, DecodeError, Decoder, Encodable, Encoder, ZERO_HASH,
    sha256d,
};

use crate::{NODE_NETWORK, NetworkError, PROTOCOL_VERSION};

pub const COMMAND_SIZE: usize = 12;
pub const MESSAGE_HEADER_SIZE: usize = 24;
pub const MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;
pub const MAX_HEADERS_PER_MESSAGE: u64 = 2000;
pub const MAX_INV_PER_MESSAGE: u64 = 50_000;

/// NUL padded ASCII command name.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command([u8; COMMAND_SIZE]);

impl Command {
    pub const VERSION: Self = Self::from_static("version");
    pub const VERACK: Self = Self::from_static("verack");
    pub const PING: Self = Self::from_static("ping");
    pub const PONG: Self = Self::from_static("pong");
    pub const GETHEADERS: Self = Self::from_static("getheaders");
    pub const HEADERS: Self = Self::from_static("headers");
    pub const GETDATA: Self = Self::from_static("getdata");
    pub const INV: Self = Self::from_static("inv");
    pub const BLOCK: Self = Self::from_static("block");
    pub const SENDHEADERS: Self = Self::from_static("sendheaders");
    pub const SENDCMPCT: Self = Self::from_static("sendcmpct");
    pub const WTXIDRELAY: Self = Self::from_static("wtxidrelay");
    pub const SENDADDRV2: Self = Self::from_static("sendaddrv2");
    pub const FEEFILTER: Self = Self::from_static("feefilter");
    pub const GETADDR: Self = Self::from_static("getaddr");

    const fn from_static(name: &str) -> Self {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= COMMAND_SIZE);
        let mut out = [0u8; COMMAND_SIZE];
        let mut i = 0;
        while i < bytes.len() {
            out[i] = bytes[i];
            i += 1;
        }
        Self(out)
    }

    pub fn new(name: &str) -> Result<Self, NetworkError> {
        if name.len() > COMMAND_SIZE || !name.is_ascii() {
            return Err(NetworkError::violation(format!("invalid command '{name}'")));
        }
        let mut out = [0u8; COMMAND_SIZE];
        out[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self(out))
    }

    pub fn from_bytes(bytes: [u8; COMMAND_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_SIZE] {
        &self.0
    }

    pub fn name(&self) -> String {
        self.0
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| char::from(*byte))
            .collect()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self.name())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: Command,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn for_payload(magic: [u8; 4], command: Command, payload: &[u8]) -> Self {
        Self {
            magic,
            command,
            length: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic);
        out.extend_from_slice(self.command.as_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.checksum);
    }

    pub fn decode(bytes: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        let mut command = [0u8; COMMAND_SIZE];
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        command.copy_from_slice(&bytes[4..16]);
        length.copy_from_slice(&bytes[16..20]);
        checksum.copy_from_slice(&bytes[20..24]);
        Self {
            magic,
            command: Command(command),
            length: u32::from_le_bytes(length),
            checksum,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetAddr {
    pub services: u64,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddr {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn unspecified() -> Self {
        Self {
            services: 0,
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip.octets());
        encoder.write_u16_be(self.port);
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            services: decoder.read_u64_le()?,
            ip: Ipv6Addr::from(decoder.read_fixed::<16>()?),
            port: decoder.read_u16_be()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddr,
    pub sender: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(peer: SocketAddr, user_agent: &str, start_height: i32, nonce: u64) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();
        Self {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp,
            receiver: NetAddr::new(peer, NODE_NETWORK),
            sender: NetAddr::unspecified(),
            nonce,
            user_agent: user_agent.to_string(),
            start_height,
            relay: false,
        }
    }
}

impl Encodable for VersionMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u64_le(self.services);
        encoder.write_i64_le(self.timestamp);
        self.receiver.encode(encoder);
        self.sender.encode(encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_var_str(&self.user_agent);
        encoder.write_i32_le(self.start_height);
        encoder.write_bool(self.relay);
    }
}

impl Decodable for VersionMessage {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            services: decoder.read_u64_le()?,
            timestamp: decoder.read_i64_le()?,
            receiver: NetAddr::decode(decoder)?,
            sender: NetAddr::decode(decoder)?,
            nonce: decoder.read_u64_le()?,
            user_agent: decoder.read_var_str()?,
            start_height: decoder.read_i32_le()?,
            relay: if decoder.is_empty() {
                true
            } else {
                decoder.read_bool()?
            },
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<BlockHash>,
    pub stop_hash: BlockHash,
}

impl GetHeadersMessage {
    /// Requests as many headers as the peer will send after `hash`.
    pub fn from_hash(hash: BlockHash) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            locator: vec![hash],
            stop_hash: ZERO_HASH,
        }
    }
}

impl Encodable for GetHeadersMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.locator.len() as u64);
        for hash in &self.locator {
            encoder.write_bytes(hash);
        }
        encoder.write_bytes(&self.stop_hash);
    }
}

impl Decodable for GetHeadersMessage {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let count = decoder.read_count(MAX_HEADERS_PER_MESSAGE)?;
        let locator = (0..count)
            .map(|_| decoder.read_fixed())
            .collect::<Result<_, _>>()?;
        Ok(Self {
            version,
            locator,
            stop_hash: decoder.read_fixed()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InventoryType {
    Tx,
    Block,
    WitnessBlock,
    Other(u32),
}

impl InventoryType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Tx => 1,
            Self::Block => 2,
            Self::WitnessBlock => 0x4000_0002,
            Self::Other(value) => value,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Tx,
            2 => Self::Block,
            0x4000_0002 => Self::WitnessBlock,
            other => Self::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InventoryType,
    pub hash: BlockHash,
}

impl Inventory {
    pub fn block(hash: BlockHash) -> Self {
        Self {
            kind: InventoryType::Block,
            hash,
        }
    }
}

fn encode_inventory(items: &[Inventory], encoder: &mut Encoder) {
    encoder.write_varint(items.len() as u64);
    for item in items {
        encoder.write_u32_le(item.kind.as_u32());
        encoder.write_bytes(&item.hash);
    }
}

fn decode_inventory(decoder: &mut Decoder<'_>) -> Result<Vec<Inventory>, DecodeError> {
    let count = decoder.read_count(MAX_INV_PER_MESSAGE)?;
    (0..count)
        .map(|_| {
            Ok(Inventory {
                kind: InventoryType::from_u32(decoder.read_u32_le()?),
                hash: decoder.read_fixed()?,
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    GetData(Vec<Inventory>),
    Inv(Vec<Inventory>),
    Block(Block),
    SendHeaders,
    SendCmpct { announce: bool, version: u64 },
    WtxidRelay,
    SendAddrV2,
    FeeFilter(i64),
    GetAddr,
    Unknown { command: Command, payload: Vec<u8> },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Self::Version(_) => Command::VERSION,
            Self::Verack => Command::VERACK,
            Self::Ping(_) => Command::PING,
            Self::Pong(_) => Command::PONG,
            Self::GetHeaders(_) => Command::GETHEADERS,
            Self::Headers(_) => Command::HEADERS,
            Self::GetData(_) => Command::GETDATA,
            Self::Inv(_) => Command::INV,
            Self::Block(_) => Command::BLOCK,
            Self::SendHeaders => Command::SENDHEADERS,
            Self::SendCmpct { .. } => Command::SENDCMPCT,
            Self::WtxidRelay => Command::WTXIDRELAY,
            Self::SendAddrV2 => Command::SENDADDRV2,
            Self::FeeFilter(_) => Command::FEEFILTER,
            Self::GetAddr => Command::GETADDR,
            Self::Unknown { command, .. } => *command,
        }
    }

    /// Capability announcements a peer may send while the handshake is
    /// still in flight.
    pub fn is_auxiliary(&self) -> bool {
        matches!(
            self,
            Self::SendHeaders
                | Self::SendCmpct { .. }
                | Self::WtxidRelay
                | Self::SendAddrV2
                | Self::FeeFilter(_)
                | Self::Ping(_)
        )
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Self::Version(version) => version.consensus_encode(&mut encoder),
            Self::Ping(nonce) | Self::Pong(nonce) => encoder.write_u64_le(*nonce),
            Self::GetHeaders(request) => request.consensus_encode(&mut encoder),
            Self::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.consensus_encode(&mut encoder);
                }
            }
            Self::GetData(items) | Self::Inv(items) => encode_inventory(items, &mut encoder),
            Self::Block(block) => block.consensus_encode(&mut encoder),
            Self::SendCmpct { announce, version } => {
                encoder.write_bool(*announce);
                encoder.write_u64_le(*version);
            }
            Self::FeeFilter(rate) => encoder.write_i64_le(*rate),
            Self::Unknown { payload, .. } => encoder.write_bytes(payload),
            Self::Verack
            | Self::SendHeaders
            | Self::WtxidRelay
            | Self::SendAddrV2
            | Self::GetAddr => {}
        }
        encoder.into_inner()
    }

    pub fn decode(command: Command, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            Command::VERSION => Self::Version(VersionMessage::consensus_decode(&mut decoder)?),
            Command::VERACK => Self::Verack,
            Command::PING => Self::Ping(decoder.read_u64_le()?),
            Command::PONG => Self::Pong(decoder.read_u64_le()?),
            Command::GETHEADERS => {
                Self::GetHeaders(GetHeadersMessage::consensus_decode(&mut decoder)?)
            }
            Command::HEADERS => {
                let count = decoder.read_count(MAX_HEADERS_PER_MESSAGE)?;
                let headers = (0..count)
                    .map(|_| BlockHeader::consensus_decode(&mut decoder))
                    .collect::<Result<_, _>>()?;
                Self::Headers(headers)
            }
            Command::GETDATA => Self::GetData(decode_inventory(&mut decoder)?),
            Command::INV => Self::Inv(decode_inventory(&mut decoder)?),
            Command::BLOCK => Self::Block(Block::consensus_decode(&mut decoder)?),
            Command::SENDHEADERS => Self::SendHeaders,
            Command::SENDCMPCT => Self::SendCmpct {
                announce: decoder.read_bool()?,
                version: decoder.read_u64_le()?,
            },
            Command::WTXIDRELAY => Self::WtxidRelay,
            Command::SENDADDRV2 => Self::SendAddrV2,
            Command::FEEFILTER => Self::FeeFilter(decoder.read_i64_le()?),
            Command::GETADDR => Self::GetAddr,
            other => {
                return Ok(Self::Unknown {
                    command: other,
                    payload: payload.to_vec(),
                });
            }
        };
        decoder.finish()?;
        Ok(message)
    }
}
