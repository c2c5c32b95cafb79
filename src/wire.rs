// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Framed wire codec for file records on a TCP stream.
//!
//! A session is a sequence of file records, optionally preceded by a count
//! header announcing how many records follow. All integers are unsigned
//! 64-bit big-endian.
//!
//! ```text
//! [count header : u64]            only when the sender opted in
//!
//! [file record]
//!   name_len    : u64             ≤ 4096
//!   name        : name_len bytes  UTF-8, logical filename, no path
//!   dest_len    : u64             ≤ 4096, may be 0
//!   dest_path   : dest_len bytes  receiver-relative destination
//!   key_len     : u64             ≤ 256, may be 0
//!   key         : key_len bytes   opaque downstream key
//!   side_len    : u64             ≤ 64, may be 0
//!   side        : side_len bytes  opaque capture label
//!   size        : u64             payload byte count
//!   payload     : size bytes
//!   ACK         : 1 byte 0x00     receiver → sender
//! ```
//!
//! The sender must not start record *i+1* before the ACK of record *i*
//! arrives on the same connection. Length caps are enforced on both encode
//! and decode so a violation fails the connection, never the filesystem.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{HaulError, Result};

pub const MAX_NAME: u64 = 4096;
pub const MAX_DEST: u64 = 4096;
pub const MAX_KEY: u64 = 256;
pub const MAX_SIDE: u64 = 64;

/// Single ACK byte sent by the receiver after each persisted record.
pub const ACK: u8 = 0x00;

/// Chunk size for payload streaming in both directions.
pub const CHUNK: usize = 1 << 20;

/// Decoded header of one file record. The payload itself is streamed
/// separately by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    /// Logical filename (no path component).
    pub name: String,
    /// Receiver-relative destination path; empty means "store under name".
    pub dest_path: String,
    /// Opaque downstream key, may be empty.
    pub key: String,
    /// Opaque capture label, may be empty.
    pub side: String,
    /// Payload byte count.
    pub size: u64,
}

impl RecordMeta {
    /// Reject any field over its wire cap before it reaches a socket.
    pub fn check_caps(&self) -> Result<()> {
        check_len("name", self.name.len() as u64, MAX_NAME)?;
        check_len("dest", self.dest_path.len() as u64, MAX_DEST)?;
        check_len("key", self.key.len() as u64, MAX_KEY)?;
        check_len("side", self.side.len() as u64, MAX_SIDE)?;
        Ok(())
    }
}

fn check_len(field: &str, len: u64, cap: u64) -> Result<()> {
    if len > cap {
        return Err(HaulError::Protocol(format!("{field} too long: {len}")));
    }
    Ok(())
}

/// Encode the record header (everything up to and including `size`) into a
/// fresh buffer. The caller streams the payload after it.
pub fn encode_header(meta: &RecordMeta) -> Result<BytesMut> {
    meta.check_caps()?;
    let mut buf = BytesMut::with_capacity(
        8 * 5 + meta.name.len() + meta.dest_path.len() + meta.key.len() + meta.side.len(),
    );
    buf.put_u64(meta.name.len() as u64);
    buf.put_slice(meta.name.as_bytes());
    buf.put_u64(meta.dest_path.len() as u64);
    buf.put_slice(meta.dest_path.as_bytes());
    buf.put_u64(meta.key.len() as u64);
    buf.put_slice(meta.key.as_bytes());
    buf.put_u64(meta.side.len() as u64);
    buf.put_slice(meta.side.as_bytes());
    buf.put_u64(meta.size);
    Ok(buf)
}

/// Write the optional count header announcing `count` records on this
/// connection. Sender side, blocking.
pub fn write_count_header<W: Write>(w: &mut W, count: u64) -> Result<()> {
    w.write_u64::<BigEndian>(count)?;
    Ok(())
}

/// Read the count header. Receiver side.
pub async fn read_count_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    Ok(r.read_u64().await?)
}

/// Decode one record header from the stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before a
/// new record started. Any violation of the length caps, or EOF mid-record,
/// is a fatal protocol error on this connection.
pub async fn read_record_meta<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<RecordMeta>> {
    let name_len = match r.read_u64().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_len("name", name_len, MAX_NAME)?;
    let name = read_string(r, name_len).await?;

    let dest_len = r.read_u64().await?;
    check_len("dest", dest_len, MAX_DEST)?;
    let dest_path = read_string(r, dest_len).await?;

    let key_len = r.read_u64().await?;
    check_len("key", key_len, MAX_KEY)?;
    let key = read_string(r, key_len).await?;

    let side_len = r.read_u64().await?;
    check_len("side", side_len, MAX_SIDE)?;
    let side = read_string(r, side_len).await?;

    let size = r.read_u64().await?;

    Ok(Some(RecordMeta { name, dest_path, key, side, size }))
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R, len: u64) -> Result<String> {
    if len == 0 {
        return Ok(String::new());
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| HaulError::Protocol(format!("invalid UTF-8 field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, dest: &str, key: &str, side: &str, size: u64) -> RecordMeta {
        RecordMeta {
            name: name.to_string(),
            dest_path: dest.to_string(),
            key: key.to_string(),
            side: side.to_string(),
            size,
        }
    }

    #[tokio::test]
    async fn header_round_trips() {
        let m = meta("frame_camera01_000000001.jpg", "CAP_1/camera01/frame.jpg", "CAP_1_V0", "FE", 1234);
        let encoded = encode_header(&m).unwrap();
        let decoded = read_record_meta(&mut encoded.as_ref()).await.unwrap().unwrap();
        assert_eq!(decoded, m);
    }

    #[tokio::test]
    async fn empty_optional_fields_round_trip() {
        let m = meta("a.jpg", "", "", "", 10);
        let encoded = encode_header(&m).unwrap();
        // name_len + name + three zero length prefixes + size
        assert_eq!(encoded.len(), 8 + 5 + 8 * 3 + 8);
        let decoded = read_record_meta(&mut encoded.as_ref()).await.unwrap().unwrap();
        assert_eq!(decoded, m);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let empty: &[u8] = &[];
        let got = read_record_meta(&mut &*empty).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn name_at_cap_is_accepted_one_over_rejected() {
        let at_cap = meta(&"x".repeat(MAX_NAME as usize), "", "", "", 0);
        let encoded = encode_header(&at_cap).unwrap();
        assert!(read_record_meta(&mut encoded.as_ref()).await.unwrap().is_some());

        let over = meta(&"x".repeat(MAX_NAME as usize + 1), "", "", "", 0);
        assert!(encode_header(&over).is_err());

        // Hand-craft the oversized length prefix the encoder refuses to emit.
        let mut crafted = BytesMut::new();
        crafted.put_u64(MAX_NAME + 1);
        crafted.put_slice(&vec![b'x'; MAX_NAME as usize + 1]);
        let err = read_record_meta(&mut crafted.as_ref()).await.unwrap_err();
        assert!(matches!(err, HaulError::Protocol(_)));
    }

    #[tokio::test]
    async fn side_cap_enforced() {
        let over = meta("a.jpg", "", "", &"s".repeat(MAX_SIDE as usize + 1), 0);
        assert!(encode_header(&over).is_err());
    }

    #[tokio::test]
    async fn count_header_round_trips() {
        let mut buf = Vec::new();
        write_count_header(&mut buf, 3).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 3]);
        let got = read_count_header(&mut buf.as_slice()).await.unwrap();
        assert_eq!(got, 3);
    }

    #[tokio::test]
    async fn truncated_record_is_protocol_error() {
        let m = meta("frame.jpg", "d/p", "", "", 0);
        let encoded = encode_header(&m).unwrap();
        let cut = &encoded[..encoded.len() - 4];
        assert!(read_record_meta(&mut &*cut).await.is_err());
    }
}
