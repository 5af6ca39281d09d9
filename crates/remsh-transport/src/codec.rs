//! Primitive encodings of the remsh wire format.
//!
//! Every multi-byte integer is written big-endian. Decoders never hand back
//! partial values: short input fails with [`FrameError::Truncated`] and the
//! caller is expected to drop the whole frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::FrameError;

const FLAG_NULL: u8 = 0;
const FLAG_PRESENT: u8 = 1;
const NULL_STRING_LENGTH: i32 = -1;

/// A value with a fixed binary representation on the wire.
pub trait WireCodec: Sized {
    /// Appends the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Reads one value from the front of `buf`.
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError>;
}

/// Encodes `value` into `buf`.
pub fn encode<T: WireCodec>(buf: &mut BytesMut, value: &T) {
    value.encode(buf);
}

/// Decodes one `T` from the front of `buf`.
pub fn decode<T: WireCodec, B: Buf>(buf: &mut B) -> Result<T, FrameError> {
    T::decode(buf)
}

/// A fieldless enum carried on the wire as a single ordinal byte.
pub trait WireEnum: Copy + Sized + 'static {
    /// Name used in decode errors.
    const NAME: &'static str;
    /// All variants, indexed by ordinal.
    const VARIANTS: &'static [Self];

    /// Position of this variant in [`WireEnum::VARIANTS`].
    fn ordinal(self) -> u8;
}

/// Writes the ordinal byte of `value`.
pub fn encode_enum<E: WireEnum>(buf: &mut BytesMut, value: E) {
    buf.put_u8(value.ordinal());
}

/// Reads an ordinal byte and maps it back to a variant of `E`.
pub fn decode_enum<E: WireEnum, B: Buf>(buf: &mut B) -> Result<E, FrameError> {
    ensure(buf, E::NAME, 1)?;
    let ordinal = buf.get_u8();
    E::VARIANTS
        .get(ordinal as usize)
        .copied()
        .ok_or(FrameError::InvalidOrdinal {
            kind: E::NAME,
            ordinal,
            count: E::VARIANTS.len() as u8,
        })
}

/// Implements [`WireEnum`] and [`WireCodec`] for a `#[repr(u8)]` enum whose
/// discriminants match the listed order.
macro_rules! wire_enum {
    ($ty:ty, $name:literal, [$($variant:path),+ $(,)?]) => {
        impl $crate::codec::WireEnum for $ty {
            const NAME: &'static str = $name;
            const VARIANTS: &'static [Self] = &[$($variant),+];

            fn ordinal(self) -> u8 {
                self as u8
            }
        }

        impl $crate::codec::WireCodec for $ty {
            fn encode(&self, buf: &mut bytes::BytesMut) {
                $crate::codec::encode_enum(buf, *self);
            }

            fn decode<B: bytes::Buf>(buf: &mut B) -> ::core::result::Result<Self, $crate::error::FrameError> {
                $crate::codec::decode_enum(buf)
            }
        }
    };
}

pub(crate) use wire_enum;

fn ensure<B: Buf>(buf: &B, field: &'static str, needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn decode_null_flag<B: Buf>(buf: &mut B, field: &'static str) -> Result<bool, FrameError> {
    ensure(buf, field, 1)?;
    match buf.get_u8() {
        FLAG_NULL => Ok(false),
        FLAG_PRESENT => Ok(true),
        other => Err(FrameError::InvalidNullFlag(other)),
    }
}

fn decode_payload<B: Buf>(buf: &mut B, field: &'static str, length: i32) -> Result<Bytes, FrameError> {
    if length < 0 {
        return Err(FrameError::InvalidLength { field, length });
    }
    let length = length as usize;
    ensure(buf, field, length)?;
    Ok(buf.copy_to_bytes(length))
}

impl WireCodec for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        ensure(buf, "bool", 1)?;
        match buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FrameError::InvalidBool(other)),
        }
    }
}

impl WireCodec for i32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        ensure(buf, "int32", 4)?;
        Ok(buf.get_i32())
    }
}

impl WireCodec for i64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(*self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        ensure(buf, "int64", 8)?;
        Ok(buf.get_i64())
    }
}

impl WireCodec for Option<Bytes> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(FLAG_NULL),
            Some(bytes) => {
                buf.put_u8(FLAG_PRESENT);
                buf.put_i32(bytes.len() as i32);
                buf.put_slice(bytes);
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        if !decode_null_flag(buf, "bytes")? {
            return Ok(None);
        }
        ensure(buf, "bytes length", 4)?;
        let length = buf.get_i32();
        decode_payload(buf, "bytes", length).map(Some)
    }
}

impl WireCodec for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(FLAG_PRESENT);
        buf.put_i32(self.len() as i32);
        buf.put_slice(self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        Option::<Bytes>::decode(buf)?.ok_or(FrameError::UnexpectedNull("bytes"))
    }
}

impl WireCodec for Option<String> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_i32(NULL_STRING_LENGTH),
            Some(s) => {
                buf.put_i32(s.len() as i32);
                buf.put_slice(s.as_bytes());
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        ensure(buf, "string length", 4)?;
        let length = buf.get_i32();
        if length == NULL_STRING_LENGTH {
            return Ok(None);
        }
        let raw = decode_payload(buf, "string", length)?;
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| FrameError::InvalidUtf8)
    }
}

impl WireCodec for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.len() as i32);
        buf.put_slice(self.as_bytes());
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        Option::<String>::decode(buf)?.ok_or(FrameError::UnexpectedNull("string"))
    }
}

impl WireCodec for Uuid {
    fn encode(&self, buf: &mut BytesMut) {
        let (most, least) = self.as_u64_pair();
        buf.put_i64(most as i64);
        buf.put_i64(least as i64);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        ensure(buf, "uuid", 16)?;
        let most = buf.get_i64() as u64;
        let least = buf.get_i64() as u64;
        Ok(Uuid::from_u64_pair(most, least))
    }
}

impl WireCodec for Option<Uuid> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(FLAG_NULL),
            Some(id) => {
                buf.put_u8(FLAG_PRESENT);
                id.encode(buf);
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        if !decode_null_flag(buf, "uuid")? {
            return Ok(None);
        }
        Uuid::decode(buf).map(Some)
    }
}
