use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::stm::error::{StmError, StmResult};

// Snapshot format versions this build understands. Version 0 predates the
// current payload encoding; such snapshots are recognized but unusable and
// force a full replay of the log.
pub const SNAPSHOT_FORMAT: i8 = 1;
pub const SNAPSHOT_FORMAT_V0: i8 = 0;

// Format tag, covered offset, payload version, payload size.
const HEADER_BYTES: usize = 1 + 8 + 1 + 4;

// Fixed-format metadata stored in front of every snapshot payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    // All log entries up to and including this offset are reflected in the
    // payload.
    pub offset: i64,

    // Version of the payload encoding. Opaque to this layer, interpreted
    // only by the application hooks.
    pub version: i8,

    pub snapshot_size: i32,
}

// A snapshot of the derived state as of `header.offset`. Immutable once
// constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmSnapshot {
    pub header: SnapshotHeader,
    pub data: Bytes,
}

impl StmSnapshot {
    pub fn create(version: i8, offset: i64, data: Bytes) -> Self {
        StmSnapshot {
            header: SnapshotHeader {
                offset,
                version,
                snapshot_size: data.len() as i32,
            },
            data,
        }
    }
}

// Writes the header fields in fixed order followed by the payload verbatim.
pub fn encode(snapshot: &StmSnapshot) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_BYTES + snapshot.data.len());
    buf.put_i8(SNAPSHOT_FORMAT);
    buf.put_i64(snapshot.header.offset);
    buf.put_i8(snapshot.header.version);
    buf.put_i32(snapshot.header.snapshot_size);
    buf.extend_from_slice(&snapshot.data);
    buf.freeze()
}

// Decodes snapshot bytes. Returns None for the recognized legacy format,
// whose payload this build cannot use; callers fall back to replaying the
// log. A version newer than this build means the data was written by a
// newer build, which a correct deployment never downgrades from.
pub fn decode(mut buf: Bytes) -> StmResult<Option<StmSnapshot>> {
    if buf.remaining() < 1 {
        return Err(StmError::CorruptSnapshot("empty snapshot file".to_string()));
    }

    let format = buf.get_i8();
    if format == SNAPSHOT_FORMAT_V0 {
        return Ok(None);
    }
    if format != SNAPSHOT_FORMAT {
        return Err(StmError::UnsupportedSnapshotFormat(format));
    }

    if buf.remaining() < HEADER_BYTES - 1 {
        return Err(StmError::CorruptSnapshot(format!(
            "truncated header, {} bytes left",
            buf.remaining()
        )));
    }
    let offset = buf.get_i64();
    let version = buf.get_i8();
    let snapshot_size = buf.get_i32();

    if snapshot_size < 0 || buf.remaining() != snapshot_size as usize {
        return Err(StmError::CorruptSnapshot(format!(
            "header claims {} payload bytes, found {}",
            snapshot_size,
            buf.remaining()
        )));
    }

    Ok(Some(StmSnapshot {
        header: SnapshotHeader {
            offset,
            version,
            snapshot_size,
        },
        data: buf,
    }))
}
