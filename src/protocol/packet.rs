//! Packet opcodes and fixed protocol values

/// Packets sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ClientPacket {
    Hello = 0,
    Query = 1,
    Data = 2,
    Cancel = 3,
    Ping = 4,
}

impl From<ClientPacket> for u64 {
    fn from(packet: ClientPacket) -> Self {
        packet as u64
    }
}

/// Packets sent by the server that this driver understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ServerPacket {
    Hello = 0,
    Data = 1,
    Exception = 2,
    Progress = 3,
    Pong = 4,
    EndOfStream = 5,
    ProfileInfo = 6,
    TableColumns = 11,
}

impl From<ServerPacket> for u64 {
    fn from(packet: ServerPacket) -> Self {
        packet as u64
    }
}

impl TryFrom<u64> for ServerPacket {
    type Error = u64;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ServerPacket::Hello),
            1 => Ok(ServerPacket::Data),
            2 => Ok(ServerPacket::Exception),
            3 => Ok(ServerPacket::Progress),
            4 => Ok(ServerPacket::Pong),
            5 => Ok(ServerPacket::EndOfStream),
            6 => Ok(ServerPacket::ProfileInfo),
            11 => Ok(ServerPacket::TableColumns),
            other => Err(other),
        }
    }
}

/// Query kind: issued directly by this client
pub const QUERY_INITIAL: u64 = 1;

/// Client interface kind
pub const INTERFACE_TCP: u64 = 1;

/// Query processing stage requested from the server
pub const STAGE_COMPLETE: u64 = 2;

pub const COMPRESSION_DISABLED: u64 = 0;
pub const COMPRESSION_ENABLED: u64 = 1;

/// Client identity advertised in hello and query packets
pub const CLIENT_NAME: &str = "chwire";
pub const CLIENT_VERSION_MAJOR: u64 = 19;
pub const CLIENT_VERSION_MINOR: u64 = 17;
pub const CLIENT_VERSION_PATCH: u64 = 5;
pub const CLIENT_REVISION: u64 = 54428;

/// Server revisions that introduced optional hello fields
pub const REVISION_WITH_SERVER_TIMEZONE: u64 = 54058;
pub const REVISION_WITH_SERVER_DISPLAY_NAME: u64 = 54372;
pub const REVISION_WITH_VERSION_PATCH: u64 = 54401;
