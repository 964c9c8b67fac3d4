use std::convert::TryFrom;
use std::fmt;

use serde::de;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256, Sha512};

use crate::error::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Algorithm {
    SHA256,
    SHA512,
}

impl Algorithm {
    /// Length of the hex encoding produced by this algorithm.
    pub fn encoded_len(&self) -> usize {
        match self {
            Algorithm::SHA256 => 64,
            Algorithm::SHA512 => 128,
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            Algorithm::SHA256 => Hasher::Sha256(Sha256::new()),
            Algorithm::SHA512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl TryFrom<&str> for Algorithm {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "sha256" => Ok(Algorithm::SHA256),
            "sha512" => Ok(Algorithm::SHA512),
            _ => Err(Error::InvalidDigest(value.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::SHA256 => write!(f, "sha256"),
            Algorithm::SHA512 => write!(f, "sha512"),
        }
    }
}

/// A content address `<algorithm>:<hex>`.
///
/// The hex portion is canonicalized to lowercase on construction, so equality
/// and hashing are case-insensitive with respect to the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    encoded: String,
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Digest the given bytes in one pass.
    pub fn compute(algorithm: Algorithm, bytes: &[u8]) -> Digest {
        let mut hasher = algorithm.hasher();
        hasher.update(bytes);
        hasher.finalize()
    }

    /// Tag form used by the referrers fallback scheme,
    /// `<algorithm>-<first 32 hex characters>`.
    pub fn to_referrers_tag(&self) -> String {
        format!("{}-{}", self.algorithm, &self.encoded[..32])
    }
}

impl TryFrom<&str> for Digest {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let (algorithm, encoded) = match value.split_once(':') {
            Some(parts) => parts,
            None => return Err(Error::InvalidDigest(value.to_string())),
        };

        let algorithm = Algorithm::try_from(algorithm)?;
        if encoded.len() != algorithm.encoded_len() {
            return Err(Error::InvalidDigest(value.to_string()));
        }
        if !encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(value.to_string()));
        }

        Ok(Digest {
            algorithm,
            encoded: encoded.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", &self.algorithm, &self.encoded)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Digest::try_from(string.as_str()).map_err(de::Error::custom)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Incremental hashing state for a single transfer.
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(hasher) => hasher.update(bytes),
            Hasher::Sha512(hasher) => hasher.update(bytes),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Sha256(hasher) => Digest {
                algorithm: Algorithm::SHA256,
                encoded: format!("{:x}", hasher.finalize()),
            },
            Hasher::Sha512(hasher) => Digest {
                algorithm: Algorithm::SHA512,
                encoded: format!("{:x}", hasher.finalize()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_sha256() {
        let digest =
            Digest::try_from("sha256:a658f2ea6b48ffbd284dc14d82f412a89f30851d0fb7ad01c86f245f0a5ab149")
                .unwrap();
        assert_eq!(digest.algorithm(), Algorithm::SHA256);
        assert_eq!(
            digest.encoded(),
            "a658f2ea6b48ffbd284dc14d82f412a89f30851d0fb7ad01c86f245f0a5ab149"
        );
    }

    #[test]
    fn rejects_short_hex() {
        assert!(matches!(
            Digest::try_from("sha256:5"),
            Err(Error::InvalidDigest(_))
        ));
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(Digest::try_from(""), Err(Error::InvalidDigest(_))));
    }

    #[test]
    fn rejects_off_by_one_lengths() {
        let short = format!("sha256:{}", "a".repeat(63));
        let long = format!("sha256:{}", "a".repeat(65));
        assert!(Digest::try_from(short.as_str()).is_err());
        assert!(Digest::try_from(long.as_str()).is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let value = format!("sha666:{}", "a".repeat(64));
        assert!(Digest::try_from(value.as_str()).is_err());
    }

    #[test]
    fn rejects_non_hex_characters() {
        let value = format!("sha256:{}", "g".repeat(64));
        assert!(Digest::try_from(value.as_str()).is_err());
    }

    #[test]
    fn canonicalizes_to_lowercase() {
        let upper = format!("sha256:{}", "A1B2".repeat(16));
        let lower = format!("sha256:{}", "a1b2".repeat(16));
        let parsed_upper = Digest::try_from(upper.as_str()).unwrap();
        let parsed_lower = Digest::try_from(lower.as_str()).unwrap();
        assert_eq!(parsed_upper, parsed_lower);
        assert_eq!(parsed_upper.to_string(), lower);
    }

    #[test]
    fn round_trips_display() {
        let value = "sha256:1b640322f9a983281970daaeba1a6d303f399d67890644389ff419d951963e20";
        assert_eq!(Digest::try_from(value).unwrap().to_string(), value);

        let value = format!("sha512:{}", "0123456789abcdef".repeat(8));
        assert_eq!(Digest::try_from(value.as_str()).unwrap().to_string(), value);
    }

    #[test]
    fn referrers_tag_truncates_hex() {
        let digest =
            Digest::try_from("sha256:1b640322f9a983281970daaeba1a6d303f399d67890644389ff419d951963e20")
                .unwrap();
        assert_eq!(digest.to_referrers_tag(), "sha256-1b640322f9a983281970daaeba1a6d30");
    }

    #[test]
    fn computes_known_value() {
        let digest = Digest::compute(Algorithm::SHA256, b"");
        assert_eq!(
            digest.to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
