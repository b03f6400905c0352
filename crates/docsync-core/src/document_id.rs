//! Document identifiers
//!
//! Every document in a tree is addressed by a random 16-byte id. The textual
//! form is bs58check, which is short, copy-paste friendly and detects typos.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when parsing a document ID
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DocumentIdError {
    #[error("Invalid bs58check encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid document ID length: expected 16 bytes, got {0}")]
    InvalidLength(usize),
}

/// Globally unique document identifier (`guid`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId([u8; 16]);

impl DocumentId {
    /// Generate a new random document ID
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encode as bs58check
    pub fn to_bs58check(&self) -> String {
        bs58::encode(&self.0).with_check().into_string()
    }

    /// Decode from bs58check
    pub fn from_bs58check(s: &str) -> Result<Self, DocumentIdError> {
        let bytes = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| DocumentIdError::InvalidEncoding(e.to_string()))?;

        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DocumentIdError::InvalidLength(bytes.len()))?;

        Ok(Self(bytes))
    }

    /// File name used by directory-backed storage
    pub fn file_name(&self) -> String {
        format!("{}.automerge", self.to_bs58check())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bs58check())
    }
}

impl FromStr for DocumentId {
    type Err = DocumentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bs58check(s)
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_bs58check())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_bs58check(&s).map_err(serde::de::Error::custom)
    }
}
