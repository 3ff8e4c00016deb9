//! Compression envelope for block payloads
//!
//! A compressed region is a sequence of frames:
//!
//! ```text
//! +----------+--------+-----------------+-------------------+---------+
//! | checksum | method | compressed size | decompressed size | payload |
//! +----------+--------+-----------------+-------------------+---------+
//!   16 bytes   1 byte    4 bytes LE         4 bytes LE
//! ```
//!
//! The compressed size includes the 9 header bytes that follow the checksum.
//! The checksum is CityHash128 over header and payload, high half first.

use cityhash_rs::cityhash_102_128;

use crate::error::{Error, Result};

pub const CHECKSUM_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 9;
pub const FRAME_PREFIX_SIZE: usize = CHECKSUM_SIZE + HEADER_SIZE;

pub const METHOD_NONE: u8 = 0x02;
pub const METHOD_LZ4: u8 = 0x82;

/// Uncompressed bytes per frame on write
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest frame accepted on read (1 GB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024;

fn checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    cityhash_102_128(data).rotate_right(64).to_le_bytes()
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(arr)
}

/// Compress `data` into one or more LZ4 frames appended to `out`.
pub fn write_frames(out: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(MAX_CHUNK_SIZE) {
        write_frame(out, chunk);
    }
}

fn write_frame(out: &mut Vec<u8>, chunk: &[u8]) {
    let compressed = lz4_flex::block::compress(chunk);

    let start = out.len();
    out.extend_from_slice(&[0u8; CHECKSUM_SIZE]);
    out.push(METHOD_LZ4);
    out.extend_from_slice(&((compressed.len() + HEADER_SIZE) as u32).to_le_bytes());
    out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);

    let sum = checksum(&out[start + CHECKSUM_SIZE..]);
    out[start..start + CHECKSUM_SIZE].copy_from_slice(&sum);
}

/// Parsed frame prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: [u8; CHECKSUM_SIZE],
    pub method: u8,
    pub compressed_size: usize,
    pub decompressed_size: usize,
}

impl FrameHeader {
    pub fn parse(prefix: &[u8; FRAME_PREFIX_SIZE]) -> Result<Self> {
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&prefix[..CHECKSUM_SIZE]);

        let method = prefix[CHECKSUM_SIZE];
        let compressed_size = le_u32(&prefix[CHECKSUM_SIZE + 1..]) as usize;
        let decompressed_size = le_u32(&prefix[CHECKSUM_SIZE + 5..]) as usize;

        if compressed_size < HEADER_SIZE {
            return Err(Error::Compression(format!(
                "compressed size {} is smaller than the frame header",
                compressed_size
            )));
        }
        if compressed_size > MAX_FRAME_SIZE || decompressed_size > MAX_FRAME_SIZE {
            return Err(Error::Compression(format!(
                "frame too large: {} compressed, {} decompressed",
                compressed_size, decompressed_size
            )));
        }

        Ok(Self {
            checksum,
            method,
            compressed_size,
            decompressed_size,
        })
    }

    /// Bytes following the 25-byte prefix.
    pub fn payload_len(&self) -> usize {
        self.compressed_size - HEADER_SIZE
    }
}

/// Verify and decompress one frame. `frame` holds the 9 header bytes
/// followed by the payload.
pub fn decode_frame(header: &FrameHeader, frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() != header.compressed_size {
        return Err(Error::Compression(format!(
            "frame has {} bytes, header says {}",
            frame.len(),
            header.compressed_size
        )));
    }
    if checksum(frame) != header.checksum {
        return Err(Error::Compression("checksum mismatch".to_string()));
    }

    let payload = &frame[HEADER_SIZE..];
    let data = match header.method {
        METHOD_LZ4 => lz4_flex::block::decompress(payload, header.decompressed_size)
            .map_err(|e| Error::Compression(format!("LZ4 decompression failed: {}", e)))?,
        METHOD_NONE => payload.to_vec(),
        other => {
            return Err(Error::Compression(format!(
                "unknown compression method 0x{:02x}",
                other
            )))
        }
    };

    if data.len() != header.decompressed_size {
        return Err(Error::Compression(format!(
            "decompressed {} bytes, header says {}",
            data.len(),
            header.decompressed_size
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_frames(mut buf: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            let mut prefix = [0u8; FRAME_PREFIX_SIZE];
            prefix.copy_from_slice(&buf[..FRAME_PREFIX_SIZE]);
            let header = FrameHeader::parse(&prefix).unwrap();
            let frame = &buf[CHECKSUM_SIZE..CHECKSUM_SIZE + header.compressed_size];
            out.push(decode_frame(&header, frame).unwrap());
            buf = &buf[CHECKSUM_SIZE + header.compressed_size..];
        }
        out
    }

    #[test]
    fn test_frame_roundtrip() {
        let data = b"block info and columns, block info and columns".repeat(20);
        let mut buf = Vec::new();
        write_frames(&mut buf, &data);

        assert_eq!(buf[CHECKSUM_SIZE], METHOD_LZ4);
        let frames = split_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], data);
    }

    #[test]
    fn test_large_payload_is_chunked() {
        let data: Vec<u8> = (0..MAX_CHUNK_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let mut buf = Vec::new();
        write_frames(&mut buf, &data);

        let frames = split_frames(&buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), MAX_CHUNK_SIZE);
        assert_eq!(frames.concat(), data);
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut buf = Vec::new();
        write_frames(&mut buf, b"hello hello hello hello");
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        prefix.copy_from_slice(&buf[..FRAME_PREFIX_SIZE]);
        let header = FrameHeader::parse(&prefix).unwrap();
        let err = decode_frame(&header, &buf[CHECKSUM_SIZE..]).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_header_rejects_undersized_frame() {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        prefix[CHECKSUM_SIZE] = METHOD_LZ4;
        prefix[CHECKSUM_SIZE + 1] = 3;
        assert!(matches!(
            FrameHeader::parse(&prefix),
            Err(Error::Compression(_))
        ));
    }
}
