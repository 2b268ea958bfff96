/// Binary wire codec.
///
/// Inbound update packets are big-endian:
///
/// ```text
///  0      4 total length (informational, not checked)
///  4      4 subject id
///  8      2 update count N
///  10+14i 1 level
///  11+14i 1 side (0 demand, otherwise supply)
///  12+14i 8 scaled value (i64)
///  20+14i 4 volume (u32)
/// ```
///
/// Outbound score records are 12 bytes in host byte order: subject id then
/// scaled score. The paired receiver reads them back with the same layout.
///
/// Decoding only validates framing. A level index >= 10 decodes fine and is
/// dropped later by the book.

use crate::error::{DecodeError, EncodeError};
use crate::types::*;

/// Length field + subject id + update count.
pub const HEADER_LEN: usize = 10;

/// Bytes per level update.
pub const UPDATE_LEN: usize = 14;

/// Size of an outbound score record.
pub const SCORE_LEN: usize = 12;

/// Decode one update packet. Never returns a partial message.
pub fn decode(data: &[u8]) -> Result<UpdateMessage, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::TooShort { len: data.len() });
    }

    let subject_id = read_u32(data, 4);
    let count = read_u16(data, 8);

    let needed = HEADER_LEN + UPDATE_LEN * count as usize;
    if data.len() < needed {
        return Err(DecodeError::Truncated {
            declared: count,
            needed,
            available: data.len(),
        });
    }

    let mut updates = Vec::with_capacity(count as usize);
    let mut pos = HEADER_LEN;
    for _ in 0..count {
        updates.push(LevelUpdate {
            level: data[pos],
            side: Side::from_wire(data[pos + 1]),
            value: read_i64(data, pos + 2),
            volume: read_u32(data, pos + 10),
        });
        pos += UPDATE_LEN;
    }

    Ok(UpdateMessage { subject_id, updates })
}

/// Subject id of a raw packet without decoding the rest. Used to pick a
/// worker shard before the packet is handed over.
#[inline(always)]
pub fn peek_subject(data: &[u8]) -> Option<SubjectId> {
    if data.len() < 8 {
        return None;
    }
    Some(read_u32(data, 4))
}

/// Encode an update packet. The length field counts the bytes after itself.
pub fn encode_update(msg: &UpdateMessage) -> Result<Vec<u8>, EncodeError> {
    let count = u16::try_from(msg.updates.len()).map_err(|_| EncodeError::TooManyUpdates {
        count: msg.updates.len(),
    })?;
    let body_len = 6 + UPDATE_LEN * count as usize;
    let mut out = Vec::with_capacity(4 + body_len);

    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&msg.subject_id.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    for u in &msg.updates {
        out.push(u.level);
        out.push(u.side.to_wire());
        out.extend_from_slice(&u.value.to_be_bytes());
        out.extend_from_slice(&u.volume.to_be_bytes());
    }
    Ok(out)
}

/// Encode an outbound score record in host byte order.
#[inline(always)]
pub fn encode_score(msg: &ScoreMessage) -> [u8; SCORE_LEN] {
    let mut out = [0u8; SCORE_LEN];
    out[..4].copy_from_slice(&msg.subject_id.to_ne_bytes());
    out[4..].copy_from_slice(&msg.score.to_ne_bytes());
    out
}

/// Decode an outbound score record (receiver side).
#[inline(always)]
pub fn decode_score(buf: &[u8; SCORE_LEN]) -> ScoreMessage {
    let mut sid = [0u8; 4];
    let mut score = [0u8; 8];
    sid.copy_from_slice(&buf[..4]);
    score.copy_from_slice(&buf[4..]);
    ScoreMessage {
        subject_id: u32::from_ne_bytes(sid),
        score: i64::from_ne_bytes(score),
    }
}

// Callers have already checked the bounds.

#[inline(always)]
fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([data[pos], data[pos + 1]])
}

#[inline(always)]
fn read_u32(data: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[pos..pos + 4]);
    u32::from_be_bytes(b)
}

#[inline(always)]
fn read_i64(data: &[u8], pos: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[pos..pos + 8]);
    i64::from_be_bytes(b)
}
