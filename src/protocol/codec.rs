//! Primitive wire encoding
//!
//! - Unsigned LEB128 varints for lengths, counts and opcodes
//! - Little-endian fixed-width integers and floats
//! - Varint length-prefixed byte strings
//! - Single-byte booleans
//!
//! [`Reader`] buffers an async byte stream and bounds every socket read by
//! its current timeout. [`Writer`] assembles a whole request in memory and
//! writes it out in one flush.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::compress::{self, FrameHeader, CHECKSUM_SIZE, FRAME_PREFIX_SIZE, HEADER_SIZE};
use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const MAX_VARINT_LEN: usize = 10;

/// Largest string or column payload accepted on read (1 GB)
pub const MAX_STRING_SIZE: usize = 1024 * 1024 * 1024;

/// Decompressed frame being consumed inside a compressed region
#[derive(Default)]
struct Decompressed {
    data: Vec<u8>,
    pos: usize,
}

impl Decompressed {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

pub struct Reader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    end: usize,
    timeout: Option<Duration>,
    compression: bool,
    block: Option<Decompressed>,
}

macro_rules! read_fixed {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            pub async fn $name(&mut self) -> Result<$ty> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                self.read_exact(&mut bytes).await?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        )*
    };
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; READ_BUFFER_SIZE],
            pos: 0,
            end: 0,
            timeout: None,
            compression: false,
            block: None,
        }
    }

    /// Enable decompression of the regions bracketed by
    /// [`begin_compressed`](Self::begin_compressed).
    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Deadline applied to each socket read from now on.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn begin_compressed(&mut self) {
        if self.compression {
            self.block = Some(Decompressed::default());
        }
    }

    pub fn end_compressed(&mut self) {
        if let Some(block) = self.block.take() {
            if block.remaining() > 0 {
                tracing::trace!(
                    "Discarding {} unread decompressed bytes",
                    block.remaining()
                );
            }
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let read = self.inner.read(&mut self.buf[..]);
        let n = match self.timeout {
            Some(t) => tokio::time::timeout(t, read)
                .await
                .map_err(|_| Error::Timeout(t))??,
            None => read.await?,
        };

        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }

        self.pos = 0;
        self.end = n;
        Ok(())
    }

    async fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.end {
                self.fill().await?;
            }
            let n = (self.end - self.pos).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        self.read_raw(&mut prefix).await?;
        let header = FrameHeader::parse(&prefix)?;

        let mut frame = vec![0u8; header.compressed_size];
        frame[..HEADER_SIZE].copy_from_slice(&prefix[CHECKSUM_SIZE..]);
        self.read_raw(&mut frame[HEADER_SIZE..]).await?;

        compress::decode_frame(&header, &frame)
    }

    /// Fill `out` completely, from the socket or from decompressed frames
    /// when inside a compressed region.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if self.block.is_none() {
            return self.read_raw(out).await;
        }

        let mut filled = 0;
        while filled < out.len() {
            let exhausted = self.block.as_ref().map_or(true, |b| b.remaining() == 0);
            if exhausted {
                let data = self.next_frame().await?;
                self.block = Some(Decompressed { data, pos: 0 });
                continue;
            }

            if let Some(block) = self.block.as_mut() {
                let n = block.remaining().min(out.len() - filled);
                out[filled..filled + n].copy_from_slice(&block.data[block.pos..block.pos + n]);
                block.pos += n;
                filled += n;
            }
        }
        Ok(())
    }

    pub async fn u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    pub async fn bool(&mut self) -> Result<bool> {
        Ok(self.u8().await? != 0)
    }

    pub async fn uvarint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.u8().await?;
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                break;
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte < 0x80 {
                return Ok(value);
            }
            shift += 7;
        }
        Err(Error::Protocol("varint overflows a 64-bit integer".to_string()))
    }

    read_fixed! {
        i8 => i8,
        i16 => i16,
        u16 => u16,
        i32 => i32,
        u32 => u32,
        i64 => i64,
        u64 => u64,
        f32 => f32,
        f64 => f64,
    }

    pub async fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_STRING_SIZE {
            return Err(Error::Protocol(format!("read of {} bytes is too large", len)));
        }
        let mut data = vec![0u8; len];
        self.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Length-prefixed raw bytes
    pub async fn string_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.uvarint().await?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_STRING_SIZE)
            .ok_or_else(|| Error::Protocol(format!("string length {} is too large", len)))?;
        self.bytes(len).await
    }

    /// Length-prefixed string, invalid UTF-8 replaced lossily
    pub async fn string(&mut self) -> Result<String> {
        let bytes = self.string_bytes().await?;
        Ok(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

/// In-memory request builder
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
    compression: bool,
}

macro_rules! write_fixed {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self, value: $ty) {
                self.buf.extend_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

impl Writer {
    pub fn new(compression: bool) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            compression,
        }
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn uvarint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    write_fixed! {
        i8 => i8,
        i16 => i16,
        u16 => u16,
        i32 => i32,
        u32 => u32,
        i64 => i64,
        u64 => u64,
        f32 => f32,
        f64 => f64,
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn string(&mut self, value: impl AsRef<[u8]>) {
        let bytes = value.as_ref();
        self.uvarint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Everything `f` writes ends up in compression frames when compression
    /// is enabled, and is written as-is otherwise.
    pub fn with_compression<F: FnOnce(&mut Self)>(&mut self, f: F) {
        if !self.compression {
            f(self);
            return;
        }

        let start = self.buf.len();
        f(self);
        let body = self.buf.split_off(start);
        compress::write_frames(&mut self.buf, &body);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Write the buffered bytes to `w` and clear the buffer.
    pub async fn flush_to<W>(&mut self, w: &mut W, timeout: Option<Duration>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = &self.buf;
        let write = async move {
            w.write_all(buf).await?;
            w.flush().await
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, write)
                .await
                .map_err(|_| Error::Timeout(t))??,
            None => write.await?,
        }

        self.buf.clear();
        Ok(())
    }
}
