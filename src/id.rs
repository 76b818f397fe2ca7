use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::BitXor,
};
use thiserror::Error;

/// Length of an `Identifier` in bytes.
pub const ID_LEN: usize = 20;

/// Point in the Kademlia key space. Identifies both peers and stored values.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Identifier(#[serde(with = "byte_array")] [u8; ID_LEN]);

impl Identifier {
    /// Generate a new random identifier.
    pub fn random() -> Self {
        rand::random()
    }

    /// Create an identifier by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let hash = Sha1::digest(bytes);
        Self(hash.into())
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &Identifier) -> Distance {
        Distance((*self ^ *other).0)
    }

    /// Flip the bit at the given index (0 is the most significant bit).
    ///
    /// Panics if index is out of bounds.
    pub fn flip_bit(self, index: usize) -> Self {
        let mut bytes = self.0;
        let (byte_index, bit_index) = (index / 8, index % 8);

        let actual_bit_index = 7 - bit_index;
        bytes[byte_index] ^= 1 << actual_bit_index;

        bytes.into()
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> u32 {
        let mut bits = 0;

        for byte in self.0 {
            bits += byte.leading_zeros();

            if byte != 0 {
                break;
            }
        }

        bits
    }

    /// Random identifier sharing exactly `prefix_len` leading bits with `self`.
    pub fn random_with_prefix(&self, prefix_len: usize) -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes: [u8; ID_LEN] = rng.gen();

        for index in 0..prefix_len.min(ID_LEN * 8) {
            let (byte_index, mask) = (index / 8, 0x80u8 >> (index % 8));
            bytes[byte_index] = (bytes[byte_index] & !mask) | (self.0[byte_index] & mask);
        }

        let mut id = Self(bytes);
        if prefix_len < ID_LEN * 8 {
            // Force the first differing bit so the result lands in the right bucket.
            let (byte_index, mask) = (prefix_len / 8, 0x80u8 >> (prefix_len % 8));
            if (id.0[byte_index] & mask) == (self.0[byte_index] & mask) {
                id = id.flip_bit(prefix_len);
            }
        }

        id
    }
}

impl AsRef<[u8]> for Identifier {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Identifier> for [u8; ID_LEN] {
    fn from(id: Identifier) -> [u8; ID_LEN] {
        id.0
    }
}

impl From<[u8; ID_LEN]> for Identifier {
    fn from(bytes: [u8; ID_LEN]) -> Identifier {
        Self(bytes)
    }
}

#[derive(Debug, Error)]
#[error("invalid identifier length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for Identifier {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl BitXor for Identifier {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (src, dst) in rhs.0.iter().zip(self.0.iter_mut()) {
            *dst ^= *src;
        }

        self
    }
}

impl Distribution<Identifier> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Identifier {
        Identifier(rng.gen())
    }
}

impl fmt::LowerHex for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Short form is enough to tell peers apart in logs.
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

/// XOR distance between two identifiers, ordered as an unsigned big-endian integer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);

    /// Number of leading bits shared by the two identifiers this distance was computed from.
    pub fn common_prefix_len(&self) -> usize {
        Identifier(self.0).leading_zeros() as usize
    }
}

mod byte_array {
    use super::ID_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; ID_LEN], s: S) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; ID_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        let buf = buf.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{}", ID_LEN);
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}
