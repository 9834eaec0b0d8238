use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Em2Error;

/// Highest axis number the controller accepts (master + four channels).
pub const MAX_AXES: u8 = 5;

/// Axis number of the master/timing channel.
pub const MASTER_AXIS: u8 = 1;

/// Trigger/gate source governing when the electrometer captures samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    SoftwareTrigger,
    SoftwareGate,
    HardwareTrigger,
    HardwareGate,
}

impl SyncMode {
    /// Trigger source token sent with `TRIG:MODE`.
    pub fn trigger_source(self) -> &'static str {
        match self {
            SyncMode::SoftwareTrigger | SyncMode::SoftwareGate => "SOFTWARE",
            SyncMode::HardwareTrigger => "HARDWARE",
            SyncMode::HardwareGate => "GATE",
        }
    }

    pub fn is_software(self) -> bool {
        matches!(self, SyncMode::SoftwareTrigger | SyncMode::SoftwareGate)
    }

    /// Hardware modes need `TRIG:INPU` before arming.
    pub fn needs_trigger_input(self) -> bool {
        !self.is_software()
    }

    /// Number of triggers armed for a requested repetition count.
    pub fn armed_repetitions(self, requested: u64) -> u64 {
        if self.is_software() { 1 } else { requested }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMode::SoftwareTrigger => "software_trigger",
            SyncMode::SoftwareGate => "software_gate",
            SyncMode::HardwareTrigger => "hardware_trigger",
            SyncMode::HardwareGate => "hardware_gate",
        };
        f.write_str(name)
    }
}

impl FromStr for SyncMode {
    type Err = Em2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "software_trigger" | "software" => Ok(SyncMode::SoftwareTrigger),
            "software_gate" => Ok(SyncMode::SoftwareGate),
            "hardware_trigger" | "hardware" => Ok(SyncMode::HardwareTrigger),
            "hardware_gate" | "gate" => Ok(SyncMode::HardwareGate),
            other => Err(Em2Error::Usage(format!(
                "Unknown synchronization mode '{other}'"
            ))),
        }
    }
}

/// State reported to the host for every axis of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    On,
    Moving,
    Fault,
}

impl AcquisitionState {
    /// Total mapping of the `ACQU:STAT?` answer. Unknown text is a fault.
    pub fn from_status(status: &str) -> Self {
        match status.trim() {
            "STATE_ACQUIRING" | "STATE_RUNNING" => AcquisitionState::Moving,
            "STATE_ON" => AcquisitionState::On,
            "STATE_FAULT" => AcquisitionState::Fault,
            other => {
                log::warn!("Unknown electrometer state '{other}', reporting Fault");
                AcquisitionState::Fault
            }
        }
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::On => f.write_str("On"),
            AcquisitionState::Moving => f.write_str("Moving"),
            AcquisitionState::Fault => f.write_str("Fault"),
        }
    }
}

/// Derived state together with the raw status text it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: AcquisitionState,
    pub status: String,
}

impl StatusReport {
    pub fn from_status(status: impl Into<String>) -> Self {
        let status = status.into();
        Self {
            state: AcquisitionState::from_status(&status),
            status,
        }
    }

    pub fn is_moving(&self) -> bool {
        self.state == AcquisitionState::Moving
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            state: AcquisitionState::On,
            status: String::new(),
        }
    }
}

/// External trigger lines of the electrometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerInput {
    Dio(u8),
    DiffIo(u8),
}

impl TriggerInput {
    /// Index of the line in the instrument's input table.
    pub fn code(self) -> u8 {
        match self {
            TriggerInput::Dio(n) => n.saturating_sub(1),
            TriggerInput::DiffIo(n) => n.saturating_add(3),
        }
    }
}

impl fmt::Display for TriggerInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerInput::Dio(n) => write!(f, "DIO_{n}"),
            TriggerInput::DiffIo(n) => write!(f, "DIFF_IO_{n}"),
        }
    }
}

impl FromStr for TriggerInput {
    type Err = Em2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_uppercase();
        let invalid = || Em2Error::Usage(format!("Unknown trigger input '{s}'"));

        let (line, max, build): (&str, u8, fn(u8) -> TriggerInput) =
            if let Some(rest) = name.strip_prefix("DIFF_IO_") {
                (rest, 9, TriggerInput::DiffIo)
            } else if let Some(rest) = name.strip_prefix("DIO_") {
                (rest, 4, TriggerInput::Dio)
            } else {
                return Err(invalid());
            };

        match line.parse::<u8>() {
            Ok(n) if (1..=max).contains(&n) => Ok(build(n)),
            _ => Err(invalid()),
        }
    }
}

/// Role of an axis: the master owns timing, the others measure current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisRole {
    Master,
    Measurement { channel: u8 },
}

impl AxisRole {
    pub fn of(axis: u8) -> Result<Self, Em2Error> {
        match axis {
            MASTER_AXIS => Ok(AxisRole::Master),
            2..=MAX_AXES => Ok(AxisRole::Measurement { channel: axis - 1 }),
            _ => Err(Em2Error::Usage(format!(
                "Axis {axis} is out of range 1..={MAX_AXES}"
            ))),
        }
    }
}

/// Value handed back to the host for one axis after a readout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reading {
    Empty,
    Scalar(f64),
    Series(Vec<f64>),
}

impl Reading {
    pub fn is_empty(&self) -> bool {
        matches!(self, Reading::Empty)
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Reading::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_series(&self) -> Option<&[f64]> {
        match self {
            Reading::Series(v) => Some(v),
            _ => None,
        }
    }
}

/// Per-axis extra attributes of measurement channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisParameter {
    Range,
    Inversion,
    InstantCurrent,
    Formula,
}

impl FromStr for AxisParameter {
    type Err = Em2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "range" => Ok(AxisParameter::Range),
            "inversion" => Ok(AxisParameter::Inversion),
            "instantcurrent" => Ok(AxisParameter::InstantCurrent),
            "formula" => Ok(AxisParameter::Formula),
            _ => Err(Em2Error::Usage(format!("Unknown axis parameter '{s}'"))),
        }
    }
}

/// Value of an axis or controller parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Text(String),
    Flag(bool),
    Number(f64),
}

impl ParameterValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Text(s) => f.write_str(s),
            ParameterValue::Flag(b) => write!(f, "{b}"),
            ParameterValue::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Flag(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Number(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AcquisitionState::from_status("STATE_ACQUIRING"),
            AcquisitionState::Moving
        );
        assert_eq!(
            AcquisitionState::from_status("STATE_RUNNING"),
            AcquisitionState::Moving
        );
        assert_eq!(AcquisitionState::from_status("STATE_ON"), AcquisitionState::On);
        assert_eq!(
            AcquisitionState::from_status("STATE_FAULT"),
            AcquisitionState::Fault
        );
        assert_eq!(
            AcquisitionState::from_status("GARBAGE"),
            AcquisitionState::Fault
        );
        assert_eq!(AcquisitionState::from_status(""), AcquisitionState::Fault);
    }

    #[test]
    fn test_sync_mode_sources() {
        assert_eq!(SyncMode::SoftwareTrigger.trigger_source(), "SOFTWARE");
        assert_eq!(SyncMode::SoftwareGate.trigger_source(), "SOFTWARE");
        assert_eq!(SyncMode::HardwareTrigger.trigger_source(), "HARDWARE");
        assert_eq!(SyncMode::HardwareGate.trigger_source(), "GATE");

        assert_eq!(SyncMode::SoftwareGate.armed_repetitions(10), 1);
        assert_eq!(SyncMode::HardwareGate.armed_repetitions(10), 10);
        assert!(SyncMode::HardwareTrigger.needs_trigger_input());
        assert!(!SyncMode::SoftwareTrigger.needs_trigger_input());
    }

    #[test]
    fn test_sync_mode_parse() {
        assert_eq!(
            "hardware-trigger".parse::<SyncMode>().unwrap(),
            SyncMode::HardwareTrigger
        );
        assert_eq!("GATE".parse::<SyncMode>().unwrap(), SyncMode::HardwareGate);
        assert!("sometimes".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_trigger_input_codes() {
        let dio: TriggerInput = "dio_1".parse().unwrap();
        assert_eq!(dio, TriggerInput::Dio(1));
        assert_eq!(dio.code(), 0);
        assert_eq!(dio.to_string(), "DIO_1");

        let diff: TriggerInput = "DIFF_IO_9".parse().unwrap();
        assert_eq!(diff.code(), 12);
        assert_eq!(diff.to_string(), "DIFF_IO_9");

        assert!("DIO_5".parse::<TriggerInput>().is_err());
        assert!("DIFF_IO_0".parse::<TriggerInput>().is_err());
        assert!("TTL".parse::<TriggerInput>().is_err());

        // hand-built values outside the table do not overflow
        assert_eq!(TriggerInput::Dio(0).code(), 0);
        assert_eq!(TriggerInput::DiffIo(u8::MAX).code(), u8::MAX);
    }

    #[test]
    fn test_axis_roles() {
        assert_eq!(AxisRole::of(1).unwrap(), AxisRole::Master);
        assert_eq!(
            AxisRole::of(3).unwrap(),
            AxisRole::Measurement { channel: 2 }
        );
        assert!(AxisRole::of(0).is_err());
        assert!(AxisRole::of(6).is_err());
    }

    #[test]
    fn test_axis_parameter_names() {
        assert_eq!(
            "InstantCurrent".parse::<AxisParameter>().unwrap(),
            AxisParameter::InstantCurrent
        );
        assert_eq!("FORMULA".parse::<AxisParameter>().unwrap(), AxisParameter::Formula);
        assert!("gain".parse::<AxisParameter>().is_err());
    }
}
