//! This module defines a binary encoding interface suitable for consensus
//! critical data: wire payloads hash identically on every node and database
//! keys preserve their intended byte order.
//!
//! Integers encode as fixed-width big-endian (keys sort correctly that way),
//! collections carry a bitcoin-style compact size length prefix so that lock
//! payloads keep the classic bitcoin-family framing.

use std::io::{self, Error, Read, Write};

use anyhow::format_err;
use bitcoin::hashes::Hash as BitcoinHash;
use thiserror::Error;

/// Data which can be encoded in a consensus-consistent way
pub trait Encodable {
    /// Encode an object with a well-defined format.
    /// Returns the number of bytes written on success.
    ///
    /// The only errors returned are errors propagated from the writer.
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error>;

    /// [`Self::consensus_encode`] to a newly allocated `Vec<u8>`
    fn consensus_encode_to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![];
        self.consensus_encode(&mut bytes)
            .expect("writing to a Vec can't fail");
        bytes
    }

    /// Hash of the consensus encoding using the default engine for `H`
    fn consensus_hash<H>(&self) -> H
    where
        H: bitcoin::hashes::Hash,
        H::Engine: Write,
    {
        let mut engine = H::engine();
        self.consensus_encode(&mut engine)
            .expect("writing to a HashEngine can't fail");
        H::from_engine(engine)
    }
}

/// Data which can be decoded in a consensus-consistent way
pub trait Decodable: Sized {
    /// Decode an object with a well-defined format
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError>;

    /// Decode an object and require the reader to be fully consumed
    fn consensus_decode_whole(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = io::Cursor::new(data);
        let decoded = Self::consensus_decode(&mut reader)?;
        if (reader.position() as usize) != data.len() {
            return Err(DecodeError::new_custom(format_err!(
                "{} trailing bytes after decoded object",
                data.len() - reader.position() as usize
            )));
        }
        Ok(decoded)
    }
}

#[derive(Debug, Error)]
#[error("decoding failed: {0:#}")]
pub struct DecodeError(anyhow::Error);

impl DecodeError {
    pub fn new_custom(e: anyhow::Error) -> Self {
        Self(e)
    }

    pub fn from_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self(e.into())
    }
}

macro_rules! impl_encode_decode_num_as_plain {
    ($num_type:ty) => {
        impl Encodable for $num_type {
            fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
                let bytes = self.to_be_bytes();
                writer.write_all(&bytes[..])?;
                Ok(bytes.len())
            }
        }

        impl Decodable for $num_type {
            fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
                let mut bytes = [0u8; (<$num_type>::BITS / 8) as usize];
                r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
                Ok(<$num_type>::from_be_bytes(bytes))
            }
        }
    };
}

impl_encode_decode_num_as_plain!(u8);
impl_encode_decode_num_as_plain!(u16);
impl_encode_decode_num_as_plain!(u32);
impl_encode_decode_num_as_plain!(u64);

impl Encodable for bool {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        u8::from(*self).consensus_encode(writer)
    }
}

impl Decodable for bool {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        match u8::consensus_decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::new_custom(format_err!(
                "invalid boolean byte {b}"
            ))),
        }
    }
}

impl Encodable for () {
    fn consensus_encode<W: Write>(&self, _writer: &mut W) -> Result<usize, Error> {
        Ok(0)
    }
}

impl Decodable for () {
    fn consensus_decode<R: Read>(_r: &mut R) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl Encodable for [u8; 32] {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        writer.write_all(self)?;
        Ok(32)
    }
}

impl Decodable for [u8; 32] {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut bytes = [0u8; 32];
        r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
        Ok(bytes)
    }
}

/// Bitcoin-style variable length integer used as the length prefix of
/// serialized collections. Non-minimal encodings are rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompactSize(pub u64);

impl Encodable for CompactSize {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        match self.0 {
            0..=0xFC => {
                writer.write_all(&[self.0 as u8])?;
                Ok(1)
            }
            0xFD..=0xFFFF => {
                writer.write_all(&[0xFD])?;
                writer.write_all(&(self.0 as u16).to_le_bytes())?;
                Ok(3)
            }
            0x1_0000..=0xFFFF_FFFF => {
                writer.write_all(&[0xFE])?;
                writer.write_all(&(self.0 as u32).to_le_bytes())?;
                Ok(5)
            }
            _ => {
                writer.write_all(&[0xFF])?;
                writer.write_all(&self.0.to_le_bytes())?;
                Ok(9)
            }
        }
    }
}

impl Decodable for CompactSize {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut first = [0u8; 1];
        r.read_exact(&mut first).map_err(DecodeError::from_err)?;
        let value = match first[0] {
            0xFD => {
                let mut bytes = [0u8; 2];
                r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
                let value = u64::from(u16::from_le_bytes(bytes));
                if value < 0xFD {
                    return Err(DecodeError::new_custom(format_err!(
                        "non-minimal compact size"
                    )));
                }
                value
            }
            0xFE => {
                let mut bytes = [0u8; 4];
                r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
                let value = u64::from(u32::from_le_bytes(bytes));
                if value < 0x1_0000 {
                    return Err(DecodeError::new_custom(format_err!(
                        "non-minimal compact size"
                    )));
                }
                value
            }
            0xFF => {
                let mut bytes = [0u8; 8];
                r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
                let value = u64::from_le_bytes(bytes);
                if value < 0x1_0000_0000 {
                    return Err(DecodeError::new_custom(format_err!(
                        "non-minimal compact size"
                    )));
                }
                value
            }
            b => u64::from(b),
        };
        Ok(CompactSize(value))
    }
}

/// Upper bound on decoded collection lengths, to stop a malicious length
/// prefix from forcing a huge allocation before the stream runs dry.
const MAX_COLLECTION_ITEMS: u64 = 1_000_000;

impl<T: Encodable> Encodable for Vec<T> {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        let mut len = CompactSize(self.len() as u64).consensus_encode(writer)?;
        for item in self {
            len += item.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let CompactSize(count) = CompactSize::consensus_decode(r)?;
        if count > MAX_COLLECTION_ITEMS {
            return Err(DecodeError::new_custom(format_err!(
                "collection length {count} exceeds limit"
            )));
        }
        let mut items = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            items.push(T::consensus_decode(r)?);
        }
        Ok(items)
    }
}

impl Encodable for str {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        let mut len = CompactSize(self.len() as u64).consensus_encode(writer)?;
        writer.write_all(self.as_bytes())?;
        Ok(len + self.len())
    }
}

impl Encodable for String {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        self.as_str().consensus_encode(writer)
    }
}

impl Decodable for String {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let CompactSize(len) = CompactSize::consensus_decode(r)?;
        if len > MAX_COLLECTION_ITEMS {
            return Err(DecodeError::new_custom(format_err!(
                "string length {len} exceeds limit"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
        String::from_utf8(bytes).map_err(DecodeError::from_err)
    }
}

macro_rules! impl_encode_decode_hash_as_bytes {
    ($hash_type:ty) => {
        impl Encodable for $hash_type {
            fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
                writer.write_all(&self.to_byte_array())?;
                Ok(32)
            }
        }

        impl Decodable for $hash_type {
            fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
                let mut bytes = [0u8; 32];
                r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
                Ok(<$hash_type>::from_byte_array(bytes))
            }
        }
    };
}

impl_encode_decode_hash_as_bytes!(bitcoin::Txid);
impl_encode_decode_hash_as_bytes!(bitcoin::BlockHash);

impl Encodable for bitcoin::OutPoint {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        writer.write_all(&self.txid.to_byte_array())?;
        writer.write_all(&self.vout.to_le_bytes())?;
        Ok(36)
    }
}

impl Decodable for bitcoin::OutPoint {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut txid = [0u8; 32];
        r.read_exact(&mut txid).map_err(DecodeError::from_err)?;
        let mut vout = [0u8; 4];
        r.read_exact(&mut vout).map_err(DecodeError::from_err)?;
        Ok(bitcoin::OutPoint {
            txid: bitcoin::Txid::from_byte_array(txid),
            vout: u32::from_le_bytes(vout),
        })
    }
}

impl Encodable for tbls::Signature {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        let bytes = self.encode_compressed();
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }
}

impl Decodable for tbls::Signature {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut bytes = [0u8; 96];
        r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
        tbls::Signature::decode_compressed(&bytes)
            .ok_or_else(|| DecodeError::new_custom(format_err!("invalid compressed G2 point")))
    }
}

/// Implements [`Encodable`] and [`Decodable`] for a struct by encoding its
/// fields in declaration order.
#[macro_export]
macro_rules! impl_consensus_encoding {
    ($type:ty, $($field:tt),+ $(,)?) => {
        impl $crate::encoding::Encodable for $type {
            fn consensus_encode<W: std::io::Write>(
                &self,
                writer: &mut W,
            ) -> Result<usize, std::io::Error> {
                let mut len = 0;
                $(len += self.$field.consensus_encode(writer)?;)+
                Ok(len)
            }
        }

        impl $crate::encoding::Decodable for $type {
            fn consensus_decode<R: std::io::Read>(
                r: &mut R,
            ) -> Result<Self, $crate::encoding::DecodeError> {
                Ok(Self {
                    $($field: $crate::encoding::Decodable::consensus_decode(r)?,)+
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::{CompactSize, Decodable, Encodable};

    fn roundtrip<T: Encodable + Decodable + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = value.consensus_encode_to_vec();
        let decoded = T::consensus_decode_whole(&bytes).expect("decodes");
        assert_eq!(value, decoded);
    }

    #[test]
    fn compact_size_boundaries() {
        for value in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            roundtrip(CompactSize(value));
        }

        assert_eq!(CompactSize(0xFC).consensus_encode_to_vec().len(), 1);
        assert_eq!(CompactSize(0xFD).consensus_encode_to_vec().len(), 3);
        assert_eq!(CompactSize(0x1_0000).consensus_encode_to_vec().len(), 5);
    }

    #[test]
    fn compact_size_rejects_non_minimal() {
        // 0xFD prefix carrying a value that fits a single byte
        let bytes = [0xFDu8, 0x01, 0x00];
        assert!(CompactSize::consensus_decode_whole(&bytes).is_err());
    }

    #[test]
    fn vec_roundtrip() {
        roundtrip(vec![1u32, 2, 3]);
        roundtrip(Vec::<u32>::new());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = 7u32.consensus_encode_to_vec();
        bytes.push(0);
        assert!(u32::consensus_decode_whole(&bytes).is_err());
    }

    #[test]
    fn outpoint_matches_bitcoin_wire_layout() {
        use bitcoin::hashes::Hash;

        let outpoint = bitcoin::OutPoint {
            txid: bitcoin::Txid::from_byte_array([7u8; 32]),
            vout: 258,
        };
        let bytes = outpoint.consensus_encode_to_vec();
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..32], &[7u8; 32]);
        // vout is little-endian on the wire
        assert_eq!(&bytes[32..], &[2, 1, 0, 0]);
        roundtrip(outpoint);
    }
}
