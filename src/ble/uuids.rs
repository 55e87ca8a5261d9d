//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants exposed by the AccelGyro sensor firmware.

use uuid::Uuid;

// AccelGyro Service (custom)
/// AccelGyro motion sensor service UUID.
pub const ACCEL_GYRO_SERVICE_UUID: Uuid = Uuid::from_u128(0x1688_4184_c1c4_4bd1_a8f1_6adcb272b18b);
/// Set Interval characteristic UUID (Write). Takes the sampling interval as text.
pub const SET_INTERVAL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8142_6a40_f761_4f45_a58b_d27a780aaef9);
/// Motion Data characteristic UUID (Read, Notify). Yields readings as text.
pub const MOTION_DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0246_fac2_1145_409b_88c4_f43d4e05a8c5);
