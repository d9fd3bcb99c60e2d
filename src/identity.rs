//! Device identity normalization and matching.
//!
//! Configured identifiers come in many shapes (`AA:BB:CC:DD:EE:FF`,
//! `aa-bb-cc-dd-ee-ff`, `aabbccddeeff`), while the radio backends report
//! addresses as raw bytes. Both routes end up in the same canonical form:
//! lowercase hex octets separated by colons.

use std::fmt;
use std::str::FromStr;

/// Separators stripped before re-grouping.
const SEPARATORS: [char; 2] = [':', '-'];

/// A device identifier in canonical form.
///
/// The inner string is always canonical, so derived equality and hashing
/// compare canonical forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Canonicalize a raw identifier string.
///
/// Strips `:` and `-`, lowercases, then re-inserts `:` every two characters.
/// No validation is applied: odd-length or non-hex input is grouped
/// mechanically, with a trailing single character forming its own group.
///
/// # Example
/// ```
/// use victron_ble_mqtt::identity::canonicalize;
///
/// assert_eq!(canonicalize("AA-BB-CC-DD-EE-FF").as_str(), "aa:bb:cc:dd:ee:ff");
/// ```
pub fn canonicalize(raw: &str) -> DeviceIdentity {
    let compact: Vec<char> = raw
        .chars()
        .filter(|c| !SEPARATORS.contains(c))
        .flat_map(char::to_lowercase)
        .collect();

    let canonical = compact
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":");

    DeviceIdentity(canonical)
}

/// True when both identities share a canonical form.
///
/// Never a substring or prefix match.
pub fn matches(observed: &DeviceIdentity, target: &DeviceIdentity) -> bool {
    observed == target
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceIdentity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(canonicalize(s))
    }
}

impl From<[u8; 6]> for DeviceIdentity {
    fn from(bytes: [u8; 6]) -> Self {
        DeviceIdentity(format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        ))
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for DeviceIdentity {
    fn from(addr: bluer::Address) -> Self {
        Self::from(addr.0)
    }
}
