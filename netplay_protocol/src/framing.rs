// Stream primitives for the TCP session channel.
//
// TCP messages are length-implicit: each message id owns its own body layout,
// so there is no outer length prefix. This module provides the building
// blocks the catalog in `message.rs` is written with: big-endian integers,
// NUL-terminated names, and `u32`-length-prefixed blobs.
//
// A `MAX_BLOB_SIZE` constant (64 MB) protects against unbounded allocation
// from malformed or malicious length prefixes. Save files and ROM-adjacent
// assets are the largest expected payloads.

use std::io::{self, BufRead, Read, Write};

use crate::error::ProtocolError;

/// Maximum accepted blob size (64 MB).
pub const MAX_BLOB_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum accepted name length, excluding the terminator.
pub const MAX_NAME_LEN: usize = 1024;

pub fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// Read a NUL-terminated name. Bytes that are not valid UTF-8 are replaced,
/// names are only used as cache keys.
pub fn read_name<R: BufRead>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut raw = Vec::new();
    reader
        .take(MAX_NAME_LEN as u64 + 1)
        .read_until(0, &mut raw)?;
    match raw.pop() {
        Some(0) => Ok(String::from_utf8_lossy(&raw).into_owned()),
        _ if raw.len() >= MAX_NAME_LEN => Err(ProtocolError::BlobTooLarge(raw.len() as u32)),
        _ => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

/// Read a `u32` length prefix followed by that many bytes.
pub fn read_blob<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u32(reader)?;
    if len > MAX_BLOB_SIZE {
        return Err(ProtocolError::BlobTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_name<W: Write>(writer: &mut W, name: &str) -> io::Result<()> {
    writer.write_all(name.as_bytes())?;
    writer.write_all(&[0])
}

pub fn write_blob<W: Write>(writer: &mut W, blob: &[u8]) -> io::Result<()> {
    let len = u32::try_from(blob.len())
        .ok()
        .filter(|len| *len <= MAX_BLOB_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("blob too large: {} bytes (max {MAX_BLOB_SIZE})", blob.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn name_then_blob() {
        let mut buf = Vec::new();
        write_name(&mut buf, "mario.sra").unwrap();
        write_blob(&mut buf, &[1, 2, 3]).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_name(&mut cursor).unwrap(), "mario.sra");
        assert_eq!(read_blob(&mut cursor).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn empty_blob() {
        let mut buf = Vec::new();
        write_blob(&mut buf, &[]).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
        assert!(read_blob(&mut Cursor::new(buf)).unwrap().is_empty());
    }

    #[test]
    fn rejects_oversized_blob_prefix() {
        let fake_len = (MAX_BLOB_SIZE + 1).to_be_bytes();
        let err = read_blob(&mut Cursor::new(fake_len.to_vec())).unwrap_err();
        assert!(matches!(err, ProtocolError::BlobTooLarge(_)));
    }

    #[test]
    fn unterminated_name_is_eof() {
        let err = read_name(&mut Cursor::new(b"abc".to_vec())).unwrap_err();
        match err {
            ProtocolError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn overlong_name_rejected() {
        let raw = vec![b'a'; MAX_NAME_LEN + 10];
        let err = read_name(&mut Cursor::new(raw)).unwrap_err();
        assert!(matches!(err, ProtocolError::BlobTooLarge(_)));
    }

    #[test]
    fn integers_are_big_endian() {
        let mut cursor = Cursor::new(vec![0, 0, 1, 0, 0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(read_u32(&mut cursor).unwrap(), 256);
        assert_eq!(read_i32(&mut cursor).unwrap(), -2);
    }
}
