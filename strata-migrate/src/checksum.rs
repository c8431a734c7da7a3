//! Versioned changeset checksums.
//!
//! A checksum is written as `"<version>:<hex digest>"`. Old generations stay
//! valid forever: a stored checksum is always recomputed under its own
//! generation, never under the current one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::action::Action;
use crate::error::{MigrateResult, MigrationError};

/// Digest algorithm generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChecksumVersion {
    /// SHA-256 over the canonical JSON of each action.
    V1,
    /// As V1, but raw SQL text is whitespace-normalised first.
    V2,
}

impl ChecksumVersion {
    /// The generation new checksums are written with.
    pub const LATEST: ChecksumVersion = ChecksumVersion::V2;

    /// Numeric tag used in the text form.
    pub fn number(&self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Look up a generation by number.
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// A versioned digest of a changeset's actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    /// Generation that produced the digest.
    pub version: ChecksumVersion,
    /// Lower-case hex digest.
    pub digest: String,
}

impl Checksum {
    /// Compute the checksum of `actions` under `version`.
    ///
    /// Only action content participates; remarks, descriptions and other
    /// cosmetic metadata do not.
    pub fn compute(actions: &[Action], version: ChecksumVersion) -> MigrateResult<Self> {
        let mut hasher = Sha256::new();
        for (i, action) in actions.iter().enumerate() {
            let canonical = match (version, action.without_cosmetics()) {
                (ChecksumVersion::V2, Action::Sql { sql }) => Action::Sql {
                    sql: sql.split_whitespace().collect::<Vec<_>>().join(" "),
                },
                (_, other) => other,
            };
            let json = serde_json::to_string(&canonical)
                .map_err(|e| MigrationError::serialization(e.to_string()))?;
            if i > 0 {
                hasher.update(b":");
            }
            hasher.update(json.as_bytes());
        }
        Ok(Self {
            version,
            digest: hex::encode(hasher.finalize()),
        })
    }

    /// Parse the `"<version>:<hex>"` form.
    pub fn parse(text: &str) -> MigrateResult<Self> {
        let invalid = || MigrationError::configuration(format!("invalid checksum '{}'", text));
        let (version, digest) = text.trim().split_once(':').ok_or_else(invalid)?;
        let version = version
            .parse::<u32>()
            .ok()
            .and_then(ChecksumVersion::from_number)
            .ok_or_else(invalid)?;
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        Ok(Self {
            version,
            digest: digest.to_lowercase(),
        })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.digest)
    }
}

impl FromStr for Checksum {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
