//! Pre-shared advertisement key and its binding to one device.

use crate::identity::DeviceIdentity;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of an AES-128 advertisement key in bytes.
pub const KEY_LEN: usize = 16;

/// Errors returned when parsing a pre-shared key.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseKeyError {
    #[error("invalid key: expected {expected} hex characters, got {0}", expected = KEY_LEN * 2)]
    InvalidLength(usize),
    #[error("invalid key: not valid hex")]
    InvalidHex,
}

/// The advertisement key configured for the target device.
///
/// Formatting never reveals more than the first 8 hex characters.
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey([u8; KEY_LEN]);

impl PresharedKey {
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// First key byte, repeated unencrypted in every advertisement.
    pub fn check_byte(&self) -> u8 {
        self.0[0]
    }
}

impl From<[u8; KEY_LEN]> for PresharedKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl FromStr for PresharedKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != KEY_LEN * 2 {
            return Err(ParseKeyError::InvalidLength(s.len()));
        }

        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseKeyError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}...", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresharedKey({self})")
    }
}

/// The target device and the key that decrypts its advertisements.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBinding {
    pub identity: DeviceIdentity,
    pub key: PresharedKey,
}
