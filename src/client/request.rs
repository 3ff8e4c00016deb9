//! Client request serialization

use crate::block::{write_data_payload, Block};
use crate::config::{SettingValue, Settings};
use crate::protocol::packet::{
    CLIENT_VERSION_PATCH, COMPRESSION_DISABLED, COMPRESSION_ENABLED, INTERFACE_TCP, QUERY_INITIAL,
    STAGE_COMPLETE,
};
use crate::protocol::{ClientPacket, Writer};

use super::handshake::write_client_info;

/// Address reported as the query's origin
const CLIENT_ADDRESS: &str = "[::ffff:127.0.0.1]:0";

static EMPTY_BLOCK: Block = Block::new();

/// Encode a Query packet for `sql`. The compression flag follows the writer.
pub fn write_query(wr: &mut Writer, hostname: &str, settings: &Settings, sql: &str) {
    wr.uvarint(ClientPacket::Query.into());
    wr.string("");

    wr.uvarint(QUERY_INITIAL);
    wr.string("");
    wr.string("");
    wr.string(CLIENT_ADDRESS);
    wr.uvarint(INTERFACE_TCP);
    // OS user, then client hostname.
    wr.string(hostname);
    wr.string(hostname);
    write_client_info(wr);
    wr.string("");
    wr.uvarint(CLIENT_VERSION_PATCH);

    write_settings(wr, settings);

    wr.uvarint(STAGE_COMPLETE);
    wr.uvarint(if wr.compression() {
        COMPRESSION_ENABLED
    } else {
        COMPRESSION_DISABLED
    });
    wr.string(sql);
}

/// Encode settings as name/value pairs ended by an empty name.
pub fn write_settings(wr: &mut Writer, settings: &Settings) {
    for (name, value) in settings.iter() {
        wr.string(name);
        match value {
            SettingValue::Text(v) => wr.string(v),
            SettingValue::Int(v) => wr.uvarint(*v as u64),
            SettingValue::UInt(v) => wr.uvarint(*v),
            SettingValue::Bool(v) => wr.bool(*v),
        }
    }
    wr.string("");
}

/// Encode a Data packet. `None` sends the empty block that ends a stream.
pub fn write_block(wr: &mut Writer, block: Option<&Block>) {
    wr.uvarint(ClientPacket::Data.into());
    write_data_payload(wr, block.unwrap_or(&EMPTY_BLOCK));
}

pub fn write_ping(wr: &mut Writer) {
    wr.uvarint(ClientPacket::Ping.into());
}

pub fn write_cancel(wr: &mut Writer) {
    wr.uvarint(ClientPacket::Cancel.into());
}
