//! Utility functions for the accel-gyro-ble crate.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Decode a characteristic value as UTF-8 text.
///
/// The sensor encodes every value as plain text. Bytes that are not valid
/// UTF-8 yield [`Error::DecodeFailed`] instead of panicking.
///
/// # Example
///
/// ```
/// use accel_gyro_ble::decode_text;
/// use accel_gyro_ble::ble::MOTION_DATA_CHARACTERISTIC_UUID;
///
/// let text = decode_text(&MOTION_DATA_CHARACTERISTIC_UUID, b"0.01,0.98,-0.12").unwrap();
/// assert_eq!(text, "0.01,0.98,-0.12");
/// ```
pub fn decode_text(characteristic: &Uuid, value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| Error::DecodeFailed {
        uuid: characteristic.to_string(),
        len: value.len(),
    })
}

/// Encode text for writing to a characteristic.
#[inline]
pub fn encode_text(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}
