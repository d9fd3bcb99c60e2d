//! Victron "Instant Readout" advertisement codec.
//!
//! Victron devices broadcast their state inside the manufacturer-specific
//! data of a BLE advertisement. After the company identifier the payload is:
//!
//! | offset | size | meaning                                   |
//! |--------|------|-------------------------------------------|
//! | 0      | 1    | record prefix, always `0x10`              |
//! | 1      | 1    | reserved                                  |
//! | 2      | 2    | model id (little-endian)                  |
//! | 4      | 1    | record type                               |
//! | 5      | 2    | IV / data counter (little-endian)         |
//! | 7      | 1    | first byte of the advertisement key       |
//! | 8..    |      | AES-128-CTR encrypted record              |
//!
//! See:
//! https://community.victronenergy.com/questions/187303/victron-bluetooth-advertising-protocol.html

pub mod solar_charger;

use crate::key::PresharedKey;
use crate::telemetry::Codec;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

pub use solar_charger::{ChargerError, OperationMode, SolarChargerRecord};

/// Victron Energy company identifier for manufacturer data lookup.
pub const VICTRON_MANUFACTURER_ID: u16 = 0x02E1;

/// Victron company identifier in advertisement byte order, for pattern matching.
#[cfg(feature = "bluer")]
pub const VICTRON_MANUFACTURER_ID_BYTES: [u8; 2] = [0xE1, 0x02];

/// First byte of every Instant Readout payload.
pub const INSTANT_READOUT_PREFIX: u8 = 0x10;

/// Record type carried by solar chargers (SmartSolar / BlueSolar MPPT).
pub const RECORD_TYPE_SOLAR_CHARGER: u8 = 0x01;

/// Bytes before the encrypted record starts.
const HEADER_LEN: usize = 8;

/// 128-bit little-endian counter mode, as used by the advertisement format.
type Aes128Ctr = ctr::Ctr128LE<Aes128>;

/// Errors that make a whole advertisement unreadable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("advertisement too short: {0} bytes")]
    TooShort(usize),
    #[error("not an instant readout record: prefix {0:#04x}")]
    NotInstantReadout(u8),
    #[error(
        "advertisement key mismatch: payload expects key starting {found:02x}, \
         configured key starts {expected:02x}"
    )]
    KeyMismatch { expected: u8, found: u8 },
    #[error("unsupported record type {0:#04x}")]
    UnsupportedRecord(u8),
    #[error("cipher error: {0}")]
    Cipher(String),
}

/// The unencrypted header of an Instant Readout advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub model_id: u16,
    pub record_type: u8,
    pub iv: u16,
    pub key_check: u8,
}

impl Header {
    /// Parse the header, without touching the encrypted part.
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() <= HEADER_LEN {
            return Err(DecodeError::TooShort(payload.len()));
        }
        if payload[0] != INSTANT_READOUT_PREFIX {
            return Err(DecodeError::NotInstantReadout(payload[0]));
        }

        Ok(Header {
            model_id: u16::from_le_bytes([payload[2], payload[3]]),
            record_type: payload[4],
            iv: u16::from_le_bytes([payload[5], payload[6]]),
            key_check: payload[7],
        })
    }

    /// Whether `key` is the one this advertisement was encrypted with, as far
    /// as the check byte can tell.
    pub fn accepts(&self, key: &PresharedKey) -> bool {
        self.key_check == key.check_byte()
    }
}

/// Run the AES-128-CTR keystream over `data`.
///
/// The counter block is the 16-bit IV zero-extended to 128 bits, little-endian.
/// Encryption and decryption are the same operation.
pub fn apply_keystream(key: &PresharedKey, iv: u16, data: &mut [u8]) -> Result<(), DecodeError> {
    let mut counter = [0u8; 16];
    counter[..2].copy_from_slice(&iv.to_le_bytes());

    let mut cipher = Aes128Ctr::new_from_slices(key.as_bytes(), &counter)
        .map_err(|e| DecodeError::Cipher(e.to_string()))?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Decrypt the record part of an advertisement.
pub fn decrypt(payload: &[u8], key: &PresharedKey) -> Result<(Header, Vec<u8>), DecodeError> {
    let header = Header::parse(payload)?;
    if !header.accepts(key) {
        return Err(DecodeError::KeyMismatch {
            expected: key.check_byte(),
            found: header.key_check,
        });
    }

    let mut plaintext = payload[HEADER_LEN..].to_vec();
    apply_keystream(key, header.iv, &mut plaintext)?;
    Ok((header, plaintext))
}

/// Codec for Victron solar charger advertisements.
#[derive(Debug, Clone, Copy, Default)]
pub struct VictronCodec;

impl Codec for VictronCodec {
    type Record = SolarChargerRecord;

    fn parse(&self, payload: &[u8], key: &PresharedKey) -> Result<Self::Record, DecodeError> {
        let header = Header::parse(payload)?;
        if header.record_type != RECORD_TYPE_SOLAR_CHARGER {
            return Err(DecodeError::UnsupportedRecord(header.record_type));
        }

        let (header, plaintext) = decrypt(payload, key)?;
        Ok(SolarChargerRecord::new(header.model_id, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_KEY, encrypt_record, solar_charger_advertisement};

    #[test]
    fn test_header_parse() {
        let payload = solar_charger_advertisement(&TEST_KEY, 0xBEEF);
        let header = Header::parse(&payload).unwrap();
        assert_eq!(header.record_type, RECORD_TYPE_SOLAR_CHARGER);
        assert_eq!(header.iv, 0xBEEF);
        assert_eq!(header.model_id, 0xA056);
        assert!(header.accepts(&TEST_KEY));
    }

    #[test]
    fn test_header_too_short() {
        assert_eq!(Header::parse(&[]), Err(DecodeError::TooShort(0)));
        assert_eq!(
            Header::parse(&[0x10, 0, 0, 0, 1, 0, 0, 0]),
            Err(DecodeError::TooShort(8))
        );
    }

    #[test]
    fn test_header_wrong_prefix() {
        let mut payload = solar_charger_advertisement(&TEST_KEY, 1);
        payload[0] = 0x02;
        assert_eq!(
            Header::parse(&payload),
            Err(DecodeError::NotInstantReadout(0x02))
        );
    }

    #[test]
    fn test_keystream_round_trip() {
        let plaintext = b"victron instant readout".to_vec();
        let mut buf = plaintext.clone();
        apply_keystream(&TEST_KEY, 0x1234, &mut buf).unwrap();
        assert_ne!(buf, plaintext);
        apply_keystream(&TEST_KEY, 0x1234, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_iv_changes_ciphertext() {
        let mut a = vec![0u8; 12];
        let mut b = vec![0u8; 12];
        apply_keystream(&TEST_KEY, 1, &mut a).unwrap();
        apply_keystream(&TEST_KEY, 2, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let payload = solar_charger_advertisement(&TEST_KEY, 7);
        let other = PresharedKey::new([0xEE; 16]);
        assert_eq!(
            decrypt(&payload, &other),
            Err(DecodeError::KeyMismatch {
                expected: 0xEE,
                found: TEST_KEY.check_byte(),
            })
        );
    }

    #[test]
    fn test_codec_rejects_other_record_types() {
        let payload = encrypt_record(&TEST_KEY, 0x02, 0xA389, 9, &[0u8; 12]);
        assert_eq!(
            VictronCodec.parse(&payload, &TEST_KEY).unwrap_err(),
            DecodeError::UnsupportedRecord(0x02)
        );
    }

    #[test]
    fn test_codec_parses_solar_charger() {
        let payload = solar_charger_advertisement(&TEST_KEY, 0x0101);
        let record = VictronCodec.parse(&payload, &TEST_KEY).unwrap();
        assert_eq!(record.model_id(), 0xA056);
        assert_eq!(record.charge_state(), Ok(Some(OperationMode::Float)));
        assert_eq!(record.battery_voltage(), Ok(Some(13.1)));
    }

    #[test]
    fn test_decode_error_display() {
        assert_eq!(
            DecodeError::TooShort(3).to_string(),
            "advertisement too short: 3 bytes"
        );
        assert_eq!(
            DecodeError::UnsupportedRecord(2).to_string(),
            "unsupported record type 0x02"
        );
    }
}
