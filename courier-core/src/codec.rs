//! Payload encoding and decoding at the transport boundary.
//!
//! The transport itself trades only in opaque byte strings. These traits are
//! the seam where applications plug in their own payload representation.

use bytes::Bytes;

use crate::error::CodecError;

/// Types that can be encoded into an MQTT message payload.
pub trait EncodePayload {
    fn encode_payload(&self) -> Result<Bytes, CodecError>;
}

/// Types that can be decoded from an MQTT message payload.
pub trait DecodePayload: Sized {
    fn decode_payload(payload: &Bytes) -> Result<Self, CodecError>;
}

impl EncodePayload for Bytes {
    fn encode_payload(&self) -> Result<Bytes, CodecError> {
        Ok(self.clone())
    }
}

impl DecodePayload for Bytes {
    fn decode_payload(payload: &Bytes) -> Result<Self, CodecError> {
        Ok(payload.clone())
    }
}

impl EncodePayload for Vec<u8> {
    fn encode_payload(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl DecodePayload for Vec<u8> {
    fn decode_payload(payload: &Bytes) -> Result<Self, CodecError> {
        Ok(payload.to_vec())
    }
}

impl EncodePayload for String {
    fn encode_payload(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl DecodePayload for String {
    fn decode_payload(payload: &Bytes) -> Result<Self, CodecError> {
        String::from_utf8(payload.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
