//! APT message identifiers and payload layouts.
//!
//! Reference: Thorlabs APT Communications Protocol, Issue 39 (KPZ101 piezo
//! driver and KSG101 strain gauge reader sections).
//!
//! Protocol overview:
//! - Short messages are a fixed 6-byte frame: message id (LE u16), a 16-bit
//!   parameter word (LE), destination byte, source byte.
//! - Data messages replace the parameter word with the payload length and set
//!   the high bit of the destination byte; the payload follows the header.
//! - All multi-byte fields are little-endian.
//!
//! The register addresses and payload layouts here must be preserved exactly
//! for hardware compatibility. Everything in this module is pure; the actual
//! wire I/O lives in [`crate::transport`].

use crate::error::{AptResult, ScanError};
use serde::{Deserialize, Serialize};
use std::fmt;

// Message identifiers.
pub const MOD_IDENTIFY: u16 = 0x0223;
pub const MOD_SET_CHANENABLESTATE: u16 = 0x0210;
pub const PZ_SET_POSCONTROLMODE: u16 = 0x0640;
pub const PZ_SET_OUTPUTVOLTS: u16 = 0x0643;
pub const PZ_SET_OUTPUTPOS: u16 = 0x0646;
pub const PZ_SET_TPZ_IOSETTINGS: u16 = 0x07D4;
pub const PZ_SET_ZERO: u16 = 0x0658;
pub const PZ_REQ_MAXTRAVEL: u16 = 0x0650;
pub const PZ_GET_MAXTRAVEL: u16 = 0x0651;
pub const PZ_REQ_PZSTATUSUPDATE: u16 = 0x0660;
pub const PZ_GET_PZSTATUSUPDATE: u16 = 0x0661;

/// Channel identifier word used by single-channel T-cube units.
pub const CHAN_IDENT: u16 = 0x0001;

/// Parameter word enabling the high-voltage output stage.
pub const CHAN_ENABLE: u16 = 0x01;
/// Parameter word disabling the high-voltage output stage.
pub const CHAN_DISABLE: u16 = 0x02;

/// Destination byte for a generic USB unit.
const DEST: u8 = 0x50;
/// Source byte for the host.
const SOURCE: u8 = 0x01;
/// Set on the destination byte when a payload follows the header.
const DATA_FOLLOWS: u8 = 0x80;

/// Full-scale device value for voltage and position commands.
pub const MAX_COUNTS: i32 = 32767;

/// Position control mode of a piezo controller.
///
/// In open-loop mode the output voltage is commanded directly; in closed-loop
/// mode the instrument firmware servos the voltage and accepts position
/// commands instead. Voltage commands are only valid in open-loop mode and
/// position commands only in closed-loop mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisMode {
    #[default]
    OpenLoop,
    ClosedLoop,
}

impl AxisMode {
    /// Wire code for the mode-select register.
    pub fn wire_code(self) -> u16 {
        match self {
            AxisMode::OpenLoop => 0x03,
            AxisMode::ClosedLoop => 0x04,
        }
    }
}

impl fmt::Display for AxisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisMode::OpenLoop => write!(f, "open_loop"),
            AxisMode::ClosedLoop => write!(f, "closed_loop"),
        }
    }
}

/// Output voltage limit selected by the HV amplifier jumper.
///
/// Only these three settings exist on the hardware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum VoltageLimit {
    #[default]
    V75,
    V100,
    V150,
}

impl VoltageLimit {
    /// Limit in volts.
    pub fn volts(self) -> f64 {
        match self {
            VoltageLimit::V75 => 75.0,
            VoltageLimit::V100 => 100.0,
            VoltageLimit::V150 => 150.0,
        }
    }

    /// Wire code for the I/O settings payload.
    pub fn wire_code(self) -> u16 {
        match self {
            VoltageLimit::V75 => 0x01,
            VoltageLimit::V100 => 0x02,
            VoltageLimit::V150 => 0x03,
        }
    }
}

impl TryFrom<u16> for VoltageLimit {
    type Error = String;

    fn try_from(volts: u16) -> Result<Self, Self::Error> {
        match volts {
            75 => Ok(VoltageLimit::V75),
            100 => Ok(VoltageLimit::V100),
            150 => Ok(VoltageLimit::V150),
            other => Err(format!(
                "invalid voltage limit {other}, expected 75, 100 or 150"
            )),
        }
    }
}

impl From<VoltageLimit> for u16 {
    fn from(limit: VoltageLimit) -> u16 {
        match limit {
            VoltageLimit::V75 => 75,
            VoltageLimit::V100 => 100,
            VoltageLimit::V150 => 150,
        }
    }
}

/// Feedback input routed to the controller in closed-loop mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    Chan1,
    Chan2,
    #[serde(rename = "extin")]
    ExtIn,
}

impl FeedbackSource {
    pub fn wire_code(self) -> u16 {
        match self {
            FeedbackSource::Chan1 => 0x01,
            FeedbackSource::Chan2 => 0x02,
            FeedbackSource::ExtIn => 0x03,
        }
    }
}

/// 6-byte short frame carrying a 16-bit parameter word.
pub fn short_frame(id: u16, value: u16) -> [u8; 6] {
    let id = id.to_le_bytes();
    let value = value.to_le_bytes();
    [id[0], id[1], value[0], value[1], DEST, SOURCE]
}

/// 6-byte header for a frame followed by `data_len` payload bytes.
pub fn data_header(id: u16, data_len: u16) -> [u8; 6] {
    let id = id.to_le_bytes();
    let len = data_len.to_le_bytes();
    [id[0], id[1], len[0], len[1], DEST | DATA_FOLLOWS, SOURCE]
}

/// Message id of a received frame header.
pub fn frame_id(header: &[u8; 6]) -> u16 {
    u16::from_le_bytes([header[0], header[1]])
}

/// Payload length of a received frame header, zero for short frames.
pub fn frame_data_len(header: &[u8; 6]) -> usize {
    if header[4] & DATA_FOLLOWS != 0 {
        u16::from_le_bytes([header[2], header[3]]) as usize
    } else {
        0
    }
}

/// 10-byte TPZ I/O settings payload: five little-endian words of channel
/// identifier, voltage limit code, feedback source code and two reserved
/// zero words. Open-loop units encode the external-input code.
pub fn io_settings_payload(limit: VoltageLimit, feedback: Option<FeedbackSource>) -> [u8; 10] {
    let feedback_code = feedback.map_or(FeedbackSource::ExtIn.wire_code(), FeedbackSource::wire_code);
    let mut payload = [0u8; 10];
    for (i, word) in [CHAN_IDENT, limit.wire_code(), feedback_code, 0x0000, 0x0000]
        .into_iter()
        .enumerate()
    {
        payload[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());
    }
    payload
}

/// 4-byte output voltage payload: channel identifier and device value.
pub fn voltage_payload(device_value: u16) -> [u8; 4] {
    let chan = CHAN_IDENT.to_le_bytes();
    let value = device_value.to_le_bytes();
    [chan[0], chan[1], value[0], value[1]]
}

/// 4-byte output position payload: channel identifier and signed position.
pub fn position_payload(position: i16) -> [u8; 4] {
    let chan = CHAN_IDENT.to_le_bytes();
    let pos = position.to_le_bytes();
    [chan[0], chan[1], pos[0], pos[1]]
}

/// Convert a voltage in volts to device units.
///
/// The full scale of the 16-bit DAC maps onto the configured voltage limit,
/// so the endpoints are exact: 0 V is 0 and the limit is [`MAX_COUNTS`].
/// Callers must range-check `volts` against the limit first.
pub fn volts_to_device_units(volts: f64, limit: VoltageLimit) -> u16 {
    (volts * MAX_COUNTS as f64 / limit.volts()).round() as u16
}

/// Signed position counts from a status-update payload.
///
/// Layout: channel identifier (u16), output voltage (i16), position (i16),
/// status bits (u32).
pub fn status_position(payload: &[u8]) -> AptResult<i16> {
    if payload.len() < 6 {
        return Err(ScanError::Transport(format!(
            "status payload too short: {} bytes",
            payload.len()
        )));
    }
    Ok(i16::from_le_bytes([payload[4], payload[5]]))
}

/// Maximum travel from a max-travel payload: channel identifier (u16)
/// followed by the travel in 100 nm steps (u16).
pub fn max_travel(payload: &[u8]) -> AptResult<u16> {
    if payload.len() < 4 {
        return Err(ScanError::Transport(format!(
            "max-travel payload too short: {} bytes",
            payload.len()
        )));
    }
    Ok(u16::from_le_bytes([payload[2], payload[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_settings_open_loop_75v() {
        // 75 V limit with no feedback source selects the external input code.
        let payload = io_settings_payload(VoltageLimit::V75, None);
        assert_eq!(
            payload,
            [0x01, 0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_io_settings_closed_loop() {
        let payload = io_settings_payload(VoltageLimit::V100, Some(FeedbackSource::Chan2));
        assert_eq!(
            payload,
            [0x01, 0x00, 0x02, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_device_unit_endpoints() {
        assert_eq!(volts_to_device_units(0.0, VoltageLimit::V75), 0);
        assert_eq!(volts_to_device_units(75.0, VoltageLimit::V75), 32767);
        assert_eq!(volts_to_device_units(150.0, VoltageLimit::V150), 32767);
    }

    #[test]
    fn test_device_unit_rounding() {
        // 37.5 V at the 75 V limit is exactly half scale, rounded up.
        assert_eq!(volts_to_device_units(37.5, VoltageLimit::V75), 16384);
    }

    #[test]
    fn test_device_units_stay_in_range() {
        for limit in [VoltageLimit::V75, VoltageLimit::V100, VoltageLimit::V150] {
            let mut v = 0.0;
            while v <= limit.volts() {
                let units = volts_to_device_units(v, limit);
                assert!(units <= MAX_COUNTS as u16, "{v} V at {limit:?} gave {units}");
                v += 0.37;
            }
        }
    }

    #[test]
    fn test_short_frame_layout() {
        assert_eq!(
            short_frame(PZ_SET_POSCONTROLMODE, AxisMode::ClosedLoop.wire_code()),
            [0x40, 0x06, 0x04, 0x00, 0x50, 0x01]
        );
    }

    #[test]
    fn test_data_header_sets_high_bit() {
        let header = data_header(PZ_SET_OUTPUTVOLTS, 4);
        assert_eq!(header, [0x43, 0x06, 0x04, 0x00, 0xD0, 0x01]);
        assert_eq!(frame_id(&header), PZ_SET_OUTPUTVOLTS);
        assert_eq!(frame_data_len(&header), 4);
    }

    #[test]
    fn test_position_payload_negative() {
        assert_eq!(position_payload(-1), [0x01, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_status_position_signed() {
        let mut payload = [0u8; 10];
        payload[4..6].copy_from_slice(&(-1234i16).to_le_bytes());
        assert_eq!(status_position(&payload).unwrap(), -1234);
    }

    #[test]
    fn test_voltage_limit_from_volts() {
        assert_eq!(VoltageLimit::try_from(100u16), Ok(VoltageLimit::V100));
        assert!(VoltageLimit::try_from(80u16).is_err());
    }
}
