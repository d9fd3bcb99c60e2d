//! Solar charger (MPPT) record layout.
//!
//! Decrypted record, little-endian:
//!
//! | offset | type      | field                     | unit      | n/a      |
//! |--------|-----------|---------------------------|-----------|----------|
//! | 0      | u8        | charge state              | enum      | `0xFF`   |
//! | 1      | u8        | charger error             | enum      | `0xFF`   |
//! | 2      | i16       | battery voltage           | 0.01 V    | `0x7FFF` |
//! | 4      | i16       | battery charging current  | 0.1 A     | `0x7FFF` |
//! | 6      | u16       | yield today               | 0.01 kWh  | `0xFFFF` |
//! | 8      | u16       | PV power                  | 1 W       | `0xFFFF` |
//! | 10     | u9        | external device load      | 0.1 A     | `0x1FF`  |

use crate::telemetry::{FieldError, FieldReading, FieldValue, Project};

const NA_U8: u8 = 0xFF;
const NA_I16: i16 = 0x7FFF;
const NA_U16: u16 = 0xFFFF;
const NA_LOAD: u16 = 0x1FF;

/// Charger operation mode (VE.Direct `CS` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Off,
    LowPower,
    Fault,
    Bulk,
    Absorption,
    Float,
    Storage,
    EqualizeManual,
    Inverting,
    PowerSupply,
    StartingUp,
    RepeatedAbsorption,
    AutoEqualize,
    BatterySafe,
    ExternalControl,
}

impl OperationMode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Off,
            1 => Self::LowPower,
            2 => Self::Fault,
            3 => Self::Bulk,
            4 => Self::Absorption,
            5 => Self::Float,
            6 => Self::Storage,
            7 => Self::EqualizeManual,
            9 => Self::Inverting,
            11 => Self::PowerSupply,
            245 => Self::StartingUp,
            246 => Self::RepeatedAbsorption,
            247 => Self::AutoEqualize,
            248 => Self::BatterySafe,
            252 => Self::ExternalControl,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::LowPower => "LOW_POWER",
            Self::Fault => "FAULT",
            Self::Bulk => "BULK",
            Self::Absorption => "ABSORPTION",
            Self::Float => "FLOAT",
            Self::Storage => "STORAGE",
            Self::EqualizeManual => "EQUALIZE_MANUAL",
            Self::Inverting => "INVERTING",
            Self::PowerSupply => "POWER_SUPPLY",
            Self::StartingUp => "STARTING_UP",
            Self::RepeatedAbsorption => "REPEATED_ABSORPTION",
            Self::AutoEqualize => "AUTO_EQUALIZE",
            Self::BatterySafe => "BATTERY_SAFE",
            Self::ExternalControl => "EXTERNAL_CONTROL",
        }
    }
}

/// Charger error (VE.Direct `ERR` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargerError {
    NoError,
    BatteryVoltageHigh,
    ChargerTemperatureHigh,
    ChargerOverCurrent,
    ChargerCurrentReversed,
    BulkTimeLimit,
    CurrentSensor,
    TerminalsOverheated,
    ConverterIssue,
    InputVoltageHigh,
    InputCurrentHigh,
    InputShutdownBatteryVoltage,
    InputShutdownCurrentFlow,
    LostCommunication,
    SyncChargingConfig,
    BmsConnectionLost,
    NetworkMisconfigured,
    FactoryCalibrationLost,
    InvalidFirmware,
    UserSettingsInvalid,
}

impl ChargerError {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::NoError,
            2 => Self::BatteryVoltageHigh,
            17 => Self::ChargerTemperatureHigh,
            18 => Self::ChargerOverCurrent,
            19 => Self::ChargerCurrentReversed,
            20 => Self::BulkTimeLimit,
            21 => Self::CurrentSensor,
            26 => Self::TerminalsOverheated,
            28 => Self::ConverterIssue,
            33 => Self::InputVoltageHigh,
            34 => Self::InputCurrentHigh,
            38 => Self::InputShutdownBatteryVoltage,
            39 => Self::InputShutdownCurrentFlow,
            65 => Self::LostCommunication,
            66 => Self::SyncChargingConfig,
            67 => Self::BmsConnectionLost,
            68 => Self::NetworkMisconfigured,
            116 => Self::FactoryCalibrationLost,
            117 => Self::InvalidFirmware,
            119 => Self::UserSettingsInvalid,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NoError => "NO_ERROR",
            Self::BatteryVoltageHigh => "BATTERY_VOLTAGE_HIGH",
            Self::ChargerTemperatureHigh => "CHARGER_TEMPERATURE_HIGH",
            Self::ChargerOverCurrent => "CHARGER_OVER_CURRENT",
            Self::ChargerCurrentReversed => "CHARGER_CURRENT_REVERSED",
            Self::BulkTimeLimit => "BULK_TIME_LIMIT",
            Self::CurrentSensor => "CURRENT_SENSOR",
            Self::TerminalsOverheated => "TERMINALS_OVERHEATED",
            Self::ConverterIssue => "CONVERTER_ISSUE",
            Self::InputVoltageHigh => "INPUT_VOLTAGE_HIGH",
            Self::InputCurrentHigh => "INPUT_CURRENT_HIGH",
            Self::InputShutdownBatteryVoltage => "INPUT_SHUTDOWN_BATTERY_VOLTAGE",
            Self::InputShutdownCurrentFlow => "INPUT_SHUTDOWN_CURRENT_FLOW",
            Self::LostCommunication => "LOST_COMMUNICATION",
            Self::SyncChargingConfig => "SYNC_CHARGING_CONFIG",
            Self::BmsConnectionLost => "BMS_CONNECTION_LOST",
            Self::NetworkMisconfigured => "NETWORK_MISCONFIGURED",
            Self::FactoryCalibrationLost => "FACTORY_CALIBRATION_LOST",
            Self::InvalidFirmware => "INVALID_FIRMWARE",
            Self::UserSettingsInvalid => "USER_SETTINGS_INVALID",
        }
    }
}

/// Product name for a solar charger model id (VE.Direct `PID`).
pub fn model_name(model_id: u16) -> Option<&'static str> {
    Some(match model_id {
        0xA042 => "BlueSolar MPPT 75|15",
        0xA043 => "BlueSolar MPPT 100|15",
        0xA044 => "BlueSolar MPPT 100|30",
        0xA045 => "BlueSolar MPPT 100|50",
        0xA046 => "BlueSolar MPPT 150|70",
        0xA047 => "BlueSolar MPPT 150|100",
        0xA049 => "BlueSolar MPPT 100|50 rev2",
        0xA04A => "BlueSolar MPPT 100|30 rev2",
        0xA04B => "BlueSolar MPPT 150|35 rev2",
        0xA04C => "BlueSolar MPPT 75|10",
        0xA04D => "BlueSolar MPPT 150|45",
        0xA04E => "BlueSolar MPPT 150|60",
        0xA04F => "BlueSolar MPPT 150|85",
        0xA050 => "SmartSolar MPPT 250|100",
        0xA051 => "SmartSolar MPPT 150|100",
        0xA052 => "SmartSolar MPPT 150|85",
        0xA053 => "SmartSolar MPPT 75|15",
        0xA054 => "SmartSolar MPPT 75|10",
        0xA055 => "SmartSolar MPPT 100|15",
        0xA056 => "SmartSolar MPPT 100|30",
        0xA057 => "SmartSolar MPPT 100|50",
        0xA058 => "SmartSolar MPPT 150|35",
        0xA059 => "SmartSolar MPPT 150|100 rev2",
        0xA05A => "SmartSolar MPPT 150|85 rev2",
        0xA05B => "SmartSolar MPPT 250|70",
        0xA05C => "SmartSolar MPPT 250|85",
        0xA05D => "SmartSolar MPPT 250|60",
        0xA05E => "SmartSolar MPPT 250|45",
        0xA05F => "SmartSolar MPPT 100|20",
        0xA060 => "SmartSolar MPPT 100|20 48V",
        0xA061 => "SmartSolar MPPT 150|45",
        0xA062 => "SmartSolar MPPT 150|60",
        0xA063 => "SmartSolar MPPT 150|70",
        0xA064 => "SmartSolar MPPT 250|85 rev2",
        0xA065 => "SmartSolar MPPT 250|100 rev2",
        0xA066 => "BlueSolar MPPT 100|20",
        0xA067 => "BlueSolar MPPT 100|20 48V",
        0xA068 => "SmartSolar MPPT 250|60 rev2",
        0xA069 => "SmartSolar MPPT 250|70 rev2",
        0xA06A => "SmartSolar MPPT 150|45 rev2",
        0xA06B => "SmartSolar MPPT 150|60 rev2",
        0xA06C => "SmartSolar MPPT 150|70 rev2",
        0xA06D => "SmartSolar MPPT 150|85 rev3",
        0xA06E => "SmartSolar MPPT 150|100 rev3",
        0xA06F => "BlueSolar MPPT 150|45 rev2",
        0xA070 => "BlueSolar MPPT 150|60 rev2",
        0xA071 => "BlueSolar MPPT 150|70 rev2",
        _ => return None,
    })
}

/// A decrypted solar charger record.
///
/// Accessors read lazily so a short record still yields the fields it has.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarChargerRecord {
    model_id: u16,
    data: Vec<u8>,
}

impl SolarChargerRecord {
    pub fn new(model_id: u16, data: Vec<u8>) -> Self {
        Self { model_id, data }
    }

    pub fn model_id(&self) -> u16 {
        self.model_id
    }

    /// Product name, or the raw id for models missing from the table.
    pub fn model_name(&self) -> String {
        match model_name(self.model_id) {
            Some(name) => name.to_string(),
            None => format!("Unknown device {:#06x}", self.model_id),
        }
    }

    fn bytes<const N: usize>(&self, offset: usize) -> Result<[u8; N], FieldError> {
        self.data
            .get(offset..offset + N)
            .and_then(|s| s.try_into().ok())
            .ok_or(FieldError::Truncated {
                needed: offset + N,
                available: self.data.len(),
            })
    }

    fn u8_at(&self, offset: usize) -> Result<u8, FieldError> {
        self.bytes::<1>(offset).map(|[b]| b)
    }

    fn i16_at(&self, offset: usize) -> Result<i16, FieldError> {
        self.bytes(offset).map(i16::from_le_bytes)
    }

    fn u16_at(&self, offset: usize) -> Result<u16, FieldError> {
        self.bytes(offset).map(u16::from_le_bytes)
    }

    pub fn charge_state(&self) -> Result<Option<OperationMode>, FieldError> {
        match self.u8_at(0)? {
            NA_U8 => Ok(None),
            code => OperationMode::from_code(code)
                .map(Some)
                .ok_or(FieldError::UnknownCode(code)),
        }
    }

    pub fn charger_error(&self) -> Result<Option<ChargerError>, FieldError> {
        match self.u8_at(1)? {
            NA_U8 => Ok(None),
            code => ChargerError::from_code(code)
                .map(Some)
                .ok_or(FieldError::UnknownCode(code)),
        }
    }

    /// Battery voltage in volts.
    pub fn battery_voltage(&self) -> Result<Option<f64>, FieldError> {
        Ok(match self.i16_at(2)? {
            NA_I16 => None,
            raw => Some(f64::from(raw) / 100.0),
        })
    }

    /// Battery charging current in amperes.
    pub fn battery_charging_current(&self) -> Result<Option<f64>, FieldError> {
        Ok(match self.i16_at(4)? {
            NA_I16 => None,
            raw => Some(f64::from(raw) / 10.0),
        })
    }

    /// Energy harvested today in watt-hours.
    pub fn yield_today(&self) -> Result<Option<i64>, FieldError> {
        Ok(match self.u16_at(6)? {
            NA_U16 => None,
            raw => Some(i64::from(raw) * 10),
        })
    }

    /// PV power in watts.
    pub fn solar_power(&self) -> Result<Option<i64>, FieldError> {
        Ok(match self.u16_at(8)? {
            NA_U16 => None,
            raw => Some(i64::from(raw)),
        })
    }

    /// Load output current in amperes.
    pub fn external_device_load(&self) -> Result<Option<f64>, FieldError> {
        Ok(match self.u16_at(10)? & NA_LOAD {
            NA_LOAD => None,
            raw => Some(f64::from(raw) / 10.0),
        })
    }
}

fn named<T>(
    value: Result<Option<T>, FieldError>,
    name: fn(T) -> &'static str,
) -> Result<Option<FieldValue>, FieldError> {
    value.map(|v| v.map(|v| FieldValue::from(name(v))))
}

fn float(value: Result<Option<f64>, FieldError>) -> Result<Option<FieldValue>, FieldError> {
    value.map(|v| v.map(FieldValue::Float))
}

fn integer(value: Result<Option<i64>, FieldError>) -> Result<Option<FieldValue>, FieldError> {
    value.map(|v| v.map(FieldValue::Integer))
}

impl Project for SolarChargerRecord {
    fn fields(&self) -> Vec<FieldReading> {
        vec![
            FieldReading::new("model_name", Ok(Some(FieldValue::Text(self.model_name())))),
            FieldReading::new("charge_state", named(self.charge_state(), OperationMode::name)),
            FieldReading::new("charger_error", named(self.charger_error(), ChargerError::name)),
            FieldReading::new("battery_voltage", float(self.battery_voltage())),
            FieldReading::new(
                "battery_charging_current",
                float(self.battery_charging_current()),
            ),
            FieldReading::new("yield_today", integer(self.yield_today())),
            FieldReading::new("solar_power", integer(self.solar_power())),
            FieldReading::new("external_device_load", float(self.external_device_load())),
        ]
    }
}
