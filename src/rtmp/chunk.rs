//! RTMP chunk stream framer: header codec and message segmentation.
//!
//! Functions here are pure per call — the only state that persists across
//! chunks (the previous header, the in-progress reassembly buffer) lives in
//! `SessionState` on the caller's side, per the single-chunk-stream
//! restriction described in the crate's design notes.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const EXTENDED_TIMESTAMP_MARKER: u32 = 0x00FF_FFFF;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated chunk header or payload")]
    Truncated,
}

async fn read_exact_mapped<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
) -> Result<(), ChunkError> {
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ChunkError::Truncated),
        Err(e) => Err(ChunkError::Io(e)),
    }
}

/// The fully reconstructed, logical header for one chunk: every field
/// populated regardless of how many of them this particular chunk carried
/// explicitly on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub format: u8,
    pub csid: u32,
    pub timestamp: u32,
    pub length: u32,
    pub typeid: u8,
    pub streamid: u32,
}

/// What one chunk actually carried on the wire, before inheritance is
/// applied. Absent fields are `None` and must come from the previous header
/// on the same `csid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunkHeader {
    pub format: u8,
    pub csid: u32,
    pub timestamp: Option<u32>,
    pub length: Option<u32>,
    pub typeid: Option<u8>,
    pub streamid: Option<u32>,
}

/// Read one chunk header off the wire: basic header (1-3 bytes), the
/// format-dependent message header body, and the extended timestamp suffix
/// if the (possibly delta) timestamp field is the `0x00FFFFFF` marker.
///
/// Format 3 never reads an extended timestamp suffix, even following a
/// message whose timestamp required one — this proxy does not attempt to
/// track whether the previous chunk on this `csid` used extension.
pub async fn read_raw_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<RawChunkHeader, ChunkError> {
    let mut first = [0u8; 1];
    read_exact_mapped(r, &mut first).await?;

    let format = (first[0] >> 6) & 0x03;
    let csid_raw = first[0] & 0x3F;

    let csid = match csid_raw {
        0 => {
            let mut b = [0u8; 1];
            read_exact_mapped(r, &mut b).await?;
            b[0] as u32 + 64
        }
        1 => {
            let mut b = [0u8; 2];
            read_exact_mapped(r, &mut b).await?;
            u16::from_be_bytes(b) as u32 + 64
        }
        n => n as u32,
    };

    let (mut timestamp, mut length, mut typeid, mut streamid) = (None, None, None, None);

    match format {
        0 => {
            let mut b = [0u8; 11];
            read_exact_mapped(r, &mut b).await?;
            timestamp = Some(u32::from_be_bytes([0, b[0], b[1], b[2]]));
            length = Some(u32::from_be_bytes([0, b[3], b[4], b[5]]));
            typeid = Some(b[6]);
            streamid = Some(u32::from_le_bytes([b[7], b[8], b[9], b[10]]));
        }
        1 => {
            let mut b = [0u8; 7];
            read_exact_mapped(r, &mut b).await?;
            timestamp = Some(u32::from_be_bytes([0, b[0], b[1], b[2]]));
            length = Some(u32::from_be_bytes([0, b[3], b[4], b[5]]));
            typeid = Some(b[6]);
        }
        2 => {
            let mut b = [0u8; 3];
            read_exact_mapped(r, &mut b).await?;
            timestamp = Some(u32::from_be_bytes([0, b[0], b[1], b[2]]));
        }
        _ => {}
    }

    if let Some(ts) = timestamp {
        if ts == EXTENDED_TIMESTAMP_MARKER {
            let mut ext = [0u8; 4];
            read_exact_mapped(r, &mut ext).await?;
            timestamp = Some(u32::from_be_bytes(ext));
        }
    }

    Ok(RawChunkHeader {
        format,
        csid,
        timestamp,
        length,
        typeid,
        streamid,
    })
}

/// Apply the format-dependent inheritance rules to reconstruct a full
/// logical header from a raw wire header plus the previous header seen on
/// the same chunk stream.
///
/// - format 0: nothing inherited.
/// - format 1: inherits `streamid`.
/// - format 2: inherits `streamid`, `length`, `typeid`.
/// - format 3: inherits `streamid`, `length`, `typeid`, `timestamp`.
pub fn reconstruct_header(raw: &RawChunkHeader, last: Option<&ChunkHeader>) -> ChunkHeader {
    let last = last.copied().unwrap_or(ChunkHeader {
        format: 0,
        csid: raw.csid,
        timestamp: 0,
        length: 0,
        typeid: 0,
        streamid: 0,
    });

    match raw.format {
        0 => ChunkHeader {
            format: 0,
            csid: raw.csid,
            timestamp: raw.timestamp.unwrap_or(0),
            length: raw.length.unwrap_or(0),
            typeid: raw.typeid.unwrap_or(0),
            streamid: raw.streamid.unwrap_or(0),
        },
        1 => ChunkHeader {
            format: 1,
            csid: raw.csid,
            timestamp: raw.timestamp.unwrap_or(0),
            length: raw.length.unwrap_or(0),
            typeid: raw.typeid.unwrap_or(0),
            streamid: last.streamid,
        },
        2 => ChunkHeader {
            format: 2,
            csid: raw.csid,
            timestamp: raw.timestamp.unwrap_or(0),
            length: last.length,
            typeid: last.typeid,
            streamid: last.streamid,
        },
        _ => ChunkHeader {
            format: 3,
            csid: raw.csid,
            timestamp: last.timestamp,
            length: last.length,
            typeid: last.typeid,
            streamid: last.streamid,
        },
    }
}

fn write_basic_header(out: &mut Vec<u8>, format: u8, csid: u32) {
    if csid < 64 {
        out.push((format << 6) | csid as u8);
    } else if csid < 64 + 256 {
        out.push(format << 6);
        out.push((csid - 64) as u8);
    } else {
        out.push((format << 6) | 1);
        out.extend_from_slice(&((csid - 64) as u16).to_be_bytes());
    }
}

/// Serialize one chunk header. `header.length` and `header.typeid` are only
/// written for formats 0 and 1; `header.streamid` only for format 0;
/// `header.timestamp` for formats 0-2 (format 3 carries no timestamp field
/// of its own, see `read_raw_header`).
///
/// Unlike the common source-language bug this proxy was derived from, the
/// extended-timestamp suffix here always carries the true timestamp value,
/// never the clamped `0xFFFFFF` marker.
pub fn write_header(out: &mut Vec<u8>, header: &ChunkHeader) {
    write_basic_header(out, header.format, header.csid);

    let extended = header.timestamp >= EXTENDED_TIMESTAMP_MARKER;
    let ts_field: u32 = if extended {
        EXTENDED_TIMESTAMP_MARKER
    } else {
        header.timestamp
    };

    match header.format {
        0 => {
            out.extend_from_slice(&ts_field.to_be_bytes()[1..]);
            out.extend_from_slice(&header.length.to_be_bytes()[1..]);
            out.push(header.typeid);
            out.extend_from_slice(&header.streamid.to_le_bytes());
        }
        1 => {
            out.extend_from_slice(&ts_field.to_be_bytes()[1..]);
            out.extend_from_slice(&header.length.to_be_bytes()[1..]);
            out.push(header.typeid);
        }
        2 => {
            out.extend_from_slice(&ts_field.to_be_bytes()[1..]);
        }
        _ => {}
    }

    if extended {
        out.extend_from_slice(&header.timestamp.to_be_bytes());
    }
}

/// Segment `payload` into chunks under `header`'s csid/typeid/streamid/
/// timestamp: the first chunk uses format 0 and states the full payload
/// length; every subsequent chunk uses format 3 and repeats only the basic
/// header (plus the extended-timestamp suffix, if the message's timestamp
/// required one).
pub fn frame_message(header: &ChunkHeader, payload: &[u8], chunk_size: u32) -> Vec<u8> {
    debug_assert!(chunk_size > 0);
    let chunk_size = chunk_size as usize;
    let mut out = Vec::with_capacity(payload.len() + payload.len() / chunk_size.max(1) * 16 + 16);

    let first = ChunkHeader {
        format: 0,
        length: payload.len() as u32,
        ..*header
    };
    let cont = ChunkHeader {
        format: 3,
        ..first
    };

    let mut offset = 0;
    let mut first_chunk = true;
    loop {
        let remaining = payload.len() - offset;
        let take = remaining.min(chunk_size);

        write_header(&mut out, if first_chunk { &first } else { &cont });
        out.extend_from_slice(&payload[offset..offset + take]);
        offset += take;
        first_chunk = false;

        if offset >= payload.len() {
            break;
        }
    }

    out
}
