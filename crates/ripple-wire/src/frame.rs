//! Length-prefixed framing
//!
//! Frame = Length (u32, big-endian) + JSON payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use ripple_core::{RippleError, RippleResult};

/// Length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum payload size
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode one message as a frame
pub fn encode_frame<T: Serialize>(message: &T) -> RippleResult<Bytes> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(RippleError::InvalidWireFormat(format!(
            "Frame too large: {} > {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode one message from the front of `buf`
///
/// Returns `Ok(None)` until a whole frame is buffered; consumed bytes are
/// removed from `buf`.
pub fn decode_frame<T: DeserializeOwned>(buf: &mut BytesMut) -> RippleResult<Option<T>> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RippleError::InvalidWireFormat(format!(
            "Frame length {} exceeds {}",
            len, MAX_FRAME_SIZE
        )));
    }
    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(len);
    let message = serde_json::from_slice(&payload)?;
    Ok(Some(message))
}
