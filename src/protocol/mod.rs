//! Wire protocol definitions for the native TCP interface
//!
//! Integers travel as LEB128 varints or little-endian fixed-width values,
//! strings are varint length-prefixed, and block payloads may be wrapped in
//! LZ4 compression frames.

pub mod codec;
pub mod compress;
pub mod exception;
pub mod info;
pub mod packet;

pub use codec::{Reader, Writer};
pub use exception::{read_exception, Exception, DEFAULT_MAX_EXCEPTION_DEPTH};
pub use info::{ProfileInfo, Progress, ServerInfo, TableColumns};
pub use packet::{ClientPacket, ServerPacket};
