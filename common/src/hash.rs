use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Data that is a cryptographic hash of `BYTES` long.
///
/// This is a generic wrapper around a fixed-size byte array that provides:
/// - `0x`-prefixed hexadecimal serialization/deserialization
/// - Display and debug formatting
///
/// # Examples
///
/// ```ignore
/// use agora_common::Hash;
///
/// // Parse from hex string, with or without the `0x` prefix
/// let hash: Hash<32> = "0x0d8d00cdd4657ac84d82f0a56067634a7adfdf43da41cb534bcaa45060973d21"
///     .parse()
///     .unwrap();
///
/// // Convert back to a prefixed hex string
/// let hex_string = hash.to_string();
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash<const BYTES: usize>([u8; BYTES]);

impl<const BYTES: usize> Default for Hash<BYTES> {
    fn default() -> Self {
        Self::new([0u8; BYTES])
    }
}

// Implement Serialize/Deserialize manually since generic const arrays don't auto-derive
impl<const BYTES: usize> Serialize for Hash<BYTES> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de, const BYTES: usize> Deserialize<'de> for Hash<BYTES> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<const BYTES: usize> Hash<BYTES> {
    /// Creates a new hash from a byte array.
    #[inline]
    pub const fn new(bytes: [u8; BYTES]) -> Self {
        Self(bytes)
    }
}

impl<const BYTES: usize> AsRef<[u8]> for Hash<BYTES> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const BYTES: usize> fmt::Debug for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(&format!("Hash<{BYTES}>")).field(&hex::encode(self)).finish()
    }
}

impl<const BYTES: usize> fmt::Display for Hash<BYTES> {
    /// Formats the hash as a `0x`-prefixed lowercase hexadecimal string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self))
    }
}

impl<const BYTES: usize> FromStr for Hash<BYTES> {
    type Err = hex::FromHexError;

    /// Parses a hash from a hexadecimal string. The `0x` prefix is optional.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The string is not valid hexadecimal
    /// - The decoded bytes do not match the expected length `BYTES`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0; BYTES];
        hex::decode_to_slice(digits, &mut bytes)?;
        Ok(Self::new(bytes))
    }
}

/// A 32-byte block hash.
pub type BlockHash = Hash<32>;
