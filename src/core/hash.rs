//! Hash and total-difficulty primitives
//!
//! Both types travel inside gossip messages:
//! - `Hash` is a fixed 32-byte SHA-256 digest
//! - `TotalDifficulty` is an arbitrary precision counter encoded as a
//!   decimal string on the wire

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A 32-byte block or transaction hash
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Hash arbitrary bytes
    pub fn digest(data: &[u8]) -> Self {
        Hash(sha256(data))
    }

    /// The all-zero hash, used as "no hash"
    pub fn zero() -> Self {
        Hash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Hash(out))
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

/// Cumulative chain difficulty
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TotalDifficulty(pub u128);

impl TotalDifficulty {
    pub fn new(value: u128) -> Self {
        TotalDifficulty(value)
    }

    /// Add the difficulty of one more block
    pub fn add(&self, difficulty: u64) -> Self {
        TotalDifficulty(self.0.saturating_add(difficulty as u128))
    }
}

impl fmt::Display for TotalDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TotalDifficulty {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TotalDifficulty(s.parse()?))
    }
}

impl Serialize for TotalDifficulty {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TotalDifficulty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| de::Error::custom(format!("invalid total difficulty: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let hash = Hash::digest(b"hello world");
        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(hash.short(), "b94d27b9");
    }

    #[test]
    fn test_hash_hex() {
        let hash = Hash::digest(b"block");
        let parsed = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(Hash::from_hex("abcd").is_err());
        assert!(Hash::zero().is_zero());
        assert!(!hash.is_zero());
    }

    #[test]
    fn test_total_difficulty_is_decimal_on_the_wire() {
        let td = TotalDifficulty::new(340_282_366_920_938_463_463_374_607_431_768_211_455);
        let json = serde_json::to_string(&td).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211455\"");

        let bytes = bincode::serialize(&TotalDifficulty::new(42)).unwrap();
        let decoded: TotalDifficulty = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, TotalDifficulty::new(42));

        assert!(serde_json::from_str::<TotalDifficulty>("\"12x\"").is_err());
    }

    #[test]
    fn test_total_difficulty_ordering() {
        let td = TotalDifficulty::new(10);
        assert!(td.add(5) > td);
        assert_eq!(td.add(5), TotalDifficulty::new(15));
    }
}
