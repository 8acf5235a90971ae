//! Row block encoding for chunk files
//!
//! Format:
//! - 4 bytes: magic `GSCK`
//! - 4 bytes: row count
//! - 4 bytes: payload length
//! - N bytes: LZ4 (size-prepended) of bincode-encoded rows
//! - 4 bytes: CRC32 of everything before it

use crate::{GridError, Result, Row};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const MAGIC: &[u8; 4] = b"GSCK";
const HEADER_SIZE: usize = 12;

/// Encode one block of rows
pub fn encode_block(rows: &[Row]) -> Result<Bytes> {
    let raw = bincode::serialize(rows)?;
    let payload = lz4_flex::compress_prepend_size(&raw);

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + 4);
    buf.put_slice(MAGIC);
    buf.put_u32_le(rows.len() as u32);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);

    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);

    Ok(buf.freeze())
}

/// Rows recovered from a file, plus the error that stopped the scan
#[derive(Debug, Default)]
pub struct BlockScan {
    pub rows: Vec<Row>,
    pub error: Option<GridError>,
}

/// Decode consecutive blocks, keeping every block before the first bad one
pub fn decode_blocks(data: &[u8]) -> BlockScan {
    let mut scan = BlockScan::default();
    let mut offset = 0;

    while offset < data.len() {
        match decode_block(&data[offset..]) {
            Ok((rows, consumed)) => {
                scan.rows.extend(rows);
                offset += consumed;
            }
            Err(e) => {
                scan.error = Some(e);
                break;
            }
        }
    }

    scan
}

fn decode_block(data: &[u8]) -> Result<(Vec<Row>, usize)> {
    if data.len() < HEADER_SIZE + 4 {
        return Err(GridError::InvalidFormat("Block too short".into()));
    }
    if &data[..4] != MAGIC {
        return Err(GridError::InvalidFormat("Invalid block magic".into()));
    }

    let mut cursor = std::io::Cursor::new(&data[4..HEADER_SIZE]);
    let count = cursor.get_u32_le() as usize;
    let payload_len = cursor.get_u32_le() as usize;

    let end = HEADER_SIZE + payload_len;
    if data.len() < end + 4 {
        return Err(GridError::InvalidFormat("Incomplete block".into()));
    }

    let expected = (&data[end..end + 4]).get_u32_le();
    let actual = crc32fast::hash(&data[..end]);
    if expected != actual {
        return Err(GridError::ChecksumMismatch { expected, actual });
    }

    let raw = lz4_flex::decompress_size_prepended(&data[HEADER_SIZE..end])
        .map_err(|e| GridError::Compression(e.to_string()))?;
    let rows: Vec<Row> = bincode::deserialize(&raw)?;
    if rows.len() != count {
        return Err(GridError::Corruption(format!(
            "block declares {} rows, holds {}",
            count,
            rows.len()
        )));
    }

    Ok((rows, end + 4))
}
