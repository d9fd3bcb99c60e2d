use crate::identity::{DeviceIdentity, canonicalize};
use crate::key::PresharedKey;
use crate::victron::{INSTANT_READOUT_PREFIX, RECORD_TYPE_SOLAR_CHARGER, apply_keystream};

/// A stable advertisement key for unit tests.
pub const TEST_KEY: PresharedKey = PresharedKey::new([
    0x0d, 0xf4, 0xd0, 0x39, 0x5b, 0x7d, 0x1a, 0x87, 0x6c, 0x0c, 0x33, 0xec, 0xb9, 0xe7, 0x0d, 0xcd,
]);

/// Solar charger record: FLOAT, no error, 13.1 V, 5.2 A, 1230 Wh, 75 W, load n/a.
pub const SOLAR_CHARGER_PLAINTEXT: [u8; 12] = [
    0x05, // charge state: FLOAT
    0x00, // charger error: none
    0x1E, 0x05, // battery voltage: 1310 * 0.01 V
    0x34, 0x00, // charging current: 52 * 0.1 A
    0x7B, 0x00, // yield today: 123 * 0.01 kWh
    0x4B, 0x00, // PV power: 75 W
    0xFF, 0x01, // load: not available
];

/// The identity every test device broadcasts from.
pub fn test_identity() -> DeviceIdentity {
    canonicalize("AA:BB:CC:DD:EE:FF")
}

/// Build a complete encrypted Instant Readout payload.
pub fn encrypt_record(
    key: &PresharedKey,
    record_type: u8,
    model_id: u16,
    iv: u16,
    plaintext: &[u8],
) -> Vec<u8> {
    let mut payload = vec![INSTANT_READOUT_PREFIX, 0x02];
    payload.extend_from_slice(&model_id.to_le_bytes());
    payload.push(record_type);
    payload.extend_from_slice(&iv.to_le_bytes());
    payload.push(key.check_byte());

    let mut body = plaintext.to_vec();
    apply_keystream(key, iv, &mut body).unwrap();
    payload.extend_from_slice(&body);
    payload
}

/// An encrypted solar charger advertisement carrying [`SOLAR_CHARGER_PLAINTEXT`].
pub fn solar_charger_advertisement(key: &PresharedKey, iv: u16) -> Vec<u8> {
    encrypt_record(
        key,
        RECORD_TYPE_SOLAR_CHARGER,
        0xA056,
        iv,
        &SOLAR_CHARGER_PLAINTEXT,
    )
}
