use crate::{
    error::{FtmsError, Result},
    units,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Treadmill Data flag bits (GATT Specification Supplement 3.234)
///
/// Bit 0 is inverted relative to the others: when it is *clear* the
/// instantaneous speed field is present, when it is *set* the frame is a
/// continuation of a multi-packet value.
pub mod flags {
    /// More data follows in another notification
    pub const MORE_DATA: u16 = 1 << 0;
    /// Average speed present
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    /// Total distance present
    pub const TOTAL_DISTANCE: u16 = 1 << 2;
    /// Inclination and ramp angle setting present
    pub const INCLINATION: u16 = 1 << 3;
    /// Positive and negative elevation gain present
    pub const ELEVATION_GAIN: u16 = 1 << 4;
    /// Instantaneous pace present
    pub const INSTANTANEOUS_PACE: u16 = 1 << 5;
    /// Average pace present
    pub const AVERAGE_PACE: u16 = 1 << 6;
    /// Total energy, energy per hour and energy per minute present
    pub const EXPENDED_ENERGY: u16 = 1 << 7;
    /// Heart rate present
    pub const HEART_RATE: u16 = 1 << 8;
    /// Metabolic equivalent present
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 9;
    /// Elapsed time present
    pub const ELAPSED_TIME: u16 = 1 << 10;
    /// Remaining time present
    pub const REMAINING_TIME: u16 = 1 << 11;
    /// Force on belt and power output present
    pub const FORCE_AND_POWER: u16 = 1 << 12;
    /// All defined bits
    pub const DEFINED: u16 = 0x1FFF;
}

const UNAVAILABLE_I16: i16 = 0x7FFF;
const UNAVAILABLE_U16: u16 = 0xFFFF;
const UNAVAILABLE_U8: u8 = 0xFF;

/// Raw Treadmill Data notification, scaled to physical units
///
/// Fields whose flag bit is clear, or that carry the "data not available"
/// sentinel, read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TreadmillData {
    /// Flag field as received
    pub flags: u16,
    /// Instantaneous speed in km/h
    pub instantaneous_speed_kmh: f64,
    /// Average speed in km/h
    pub average_speed_kmh: f64,
    /// Total distance in metres (uint24)
    pub total_distance_m: u32,
    /// Inclination in percent
    pub inclination_percent: f64,
    /// Ramp angle setting in degrees
    pub ramp_angle_deg: f64,
    /// Positive elevation gain in metres
    pub positive_elevation_gain_m: f64,
    /// Negative elevation gain in metres
    pub negative_elevation_gain_m: f64,
    /// Instantaneous pace in seconds per 500 m
    pub instantaneous_pace: u16,
    /// Average pace in seconds per 500 m
    pub average_pace: u16,
    /// Total energy in kcal
    pub total_energy_kcal: u16,
    /// Energy per hour in kcal
    pub energy_per_hour_kcal: u16,
    /// Energy per minute in kcal
    pub energy_per_minute_kcal: u8,
    /// Heart rate in bpm
    pub heart_rate_bpm: u8,
    /// Metabolic equivalent
    pub metabolic_equivalent: u8,
    /// Elapsed time in seconds
    pub elapsed_time_s: u16,
    /// Remaining time in seconds
    pub remaining_time_s: u16,
    /// Force on belt in newtons
    pub force_on_belt_n: i16,
    /// Power output in watts
    pub power_output_w: i16,
}

/// Bounds-checked little-endian cursor over a notification buffer
struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<()> {
        let available = self.buf.remaining();
        if available < needed {
            return Err(FtmsError::TruncatedBuffer {
                field,
                needed,
                available,
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_u16_le())
    }

    fn i16(&mut self, field: &'static str) -> Result<i16> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_i16_le())
    }

    fn u24(&mut self, field: &'static str) -> Result<u32> {
        self.ensure(field, 3)?;
        let value = self.buf.get_uint_le(3) as u32;
        Ok(value)
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

fn scaled_i16(raw: i16, divisor: f64) -> f64 {
    if raw == UNAVAILABLE_I16 {
        0.0
    } else {
        f64::from(raw) / divisor
    }
}

const fn available_u16(raw: u16) -> u16 {
    if raw == UNAVAILABLE_U16 {
        0
    } else {
        raw
    }
}

const fn available_i16(raw: i16) -> i16 {
    if raw == UNAVAILABLE_I16 {
        0
    } else {
        raw
    }
}

/// Decode a Treadmill Data (0x2ACD) notification
///
/// Fields are read in protocol order, each only when its flag bit is set.
/// Every read is bounds-checked first.
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedBuffer`] if any present field runs past the
/// end of `data`, and [`FtmsError::UnsupportedFormat`] for continuation
/// frames (flag bit 0 set), since multi-packet reassembly is not supported.
pub fn decode_treadmill_data(data: &[u8]) -> Result<TreadmillData> {
    let mut reader = FieldReader::new(data);
    let raw_flags = reader.u16("flags")?;

    if raw_flags & flags::MORE_DATA != 0 {
        return Err(FtmsError::UnsupportedFormat(
            "multi-packet treadmill data is not supported".to_string(),
        ));
    }
    if raw_flags & !flags::DEFINED != 0 {
        debug!("Ignoring reserved treadmill data flag bits: {raw_flags:#06X}");
    }

    let has = |bit: u16| raw_flags & bit != 0;
    let mut out = TreadmillData {
        flags: raw_flags,
        instantaneous_speed_kmh: f64::from(reader.u16("instantaneous speed")?) / 100.0,
        ..TreadmillData::default()
    };

    if has(flags::AVERAGE_SPEED) {
        out.average_speed_kmh = f64::from(reader.u16("average speed")?) / 100.0;
    }
    if has(flags::TOTAL_DISTANCE) {
        out.total_distance_m = reader.u24("total distance")?;
    }
    if has(flags::INCLINATION) {
        out.inclination_percent = scaled_i16(reader.i16("inclination")?, 10.0);
        out.ramp_angle_deg = scaled_i16(reader.i16("ramp angle")?, 10.0);
    }
    if has(flags::ELEVATION_GAIN) {
        out.positive_elevation_gain_m = f64::from(reader.u16("positive elevation gain")?) / 10.0;
        out.negative_elevation_gain_m = f64::from(reader.u16("negative elevation gain")?) / 10.0;
    }
    if has(flags::INSTANTANEOUS_PACE) {
        out.instantaneous_pace = reader.u16("instantaneous pace")?;
    }
    if has(flags::AVERAGE_PACE) {
        out.average_pace = reader.u16("average pace")?;
    }
    if has(flags::EXPENDED_ENERGY) {
        out.total_energy_kcal = available_u16(reader.u16("total energy")?);
        out.energy_per_hour_kcal = available_u16(reader.u16("energy per hour")?);
        let per_minute = reader.u8("energy per minute")?;
        out.energy_per_minute_kcal = if per_minute == UNAVAILABLE_U8 {
            0
        } else {
            per_minute
        };
    }
    if has(flags::HEART_RATE) {
        out.heart_rate_bpm = reader.u8("heart rate")?;
    }
    if has(flags::METABOLIC_EQUIVALENT) {
        out.metabolic_equivalent = reader.u8("metabolic equivalent")?;
    }
    if has(flags::ELAPSED_TIME) {
        out.elapsed_time_s = reader.u16("elapsed time")?;
    }
    if has(flags::REMAINING_TIME) {
        out.remaining_time_s = reader.u16("remaining time")?;
    }
    if has(flags::FORCE_AND_POWER) {
        out.force_on_belt_n = available_i16(reader.i16("force on belt")?);
        out.power_output_w = available_i16(reader.i16("power output")?);
    }

    Ok(out)
}

/// Training status labels indexed by status code 0x00-0x0F
pub const TRAINING_STATUS_LABELS: [&str; 16] = [
    "Other",
    "Idle",
    "Warming up",
    "Low Intensity Interval",
    "High Intensity Interval",
    "Recovery Interval",
    "Isometric",
    "Heart Rate Control",
    "Fitness Test",
    "Speed Outside of Control Region - Low (increase speed to return to controllable region)",
    "Speed Outside of Control Region - High (decrease speed to return to controllable region)",
    "Cool Down",
    "Watt Control",
    "Manual Mode (Quick Start)",
    "Pre-Workout",
    "Post-Workout",
];

/// Label for status codes outside the table
pub const RESERVED_STATUS_LABEL: &str = "Reserved for Future Use";

/// Training Status flag: status string present
pub const TRAINING_STATUS_STRING_PRESENT: u8 = 1 << 0;
/// Training Status flag: extended string present
pub const TRAINING_STATUS_EXTENDED_STRING: u8 = 1 << 1;

/// Look up the fixed label for a training status code
#[must_use]
pub fn training_status_label(code: u8) -> &'static str {
    TRAINING_STATUS_LABELS
        .get(usize::from(code))
        .copied()
        .unwrap_or(RESERVED_STATUS_LABEL)
}

/// Decoded Training Status (0x2AD3) value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingStatusData {
    /// Flag byte as received
    pub flags: u8,
    /// Status code
    pub code: u8,
    /// Fixed English label for `code`
    pub label: &'static str,
    /// Free-form status string, if the peripheral sent one
    pub text: Option<String>,
}

/// Decode a Training Status notification or read value
///
/// Unknown codes decode to [`RESERVED_STATUS_LABEL`] rather than failing.
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedBuffer`] if the flag or status byte is missing.
pub fn decode_training_status(data: &[u8]) -> Result<TrainingStatusData> {
    let mut reader = FieldReader::new(data);
    let status_flags = reader.u8("training status flags")?;
    let code = reader.u8("training status")?;

    if status_flags & TRAINING_STATUS_EXTENDED_STRING != 0 {
        debug!("Extended training status string not supported, reading plain string only");
    }

    let text = if status_flags & TRAINING_STATUS_STRING_PRESENT != 0 {
        Some(String::from_utf8_lossy(reader.rest()).into_owned())
    } else {
        None
    };

    Ok(TrainingStatusData {
        flags: status_flags,
        code,
        label: training_status_label(code),
        text,
    })
}

/// Fitness Machine Control Point op codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlOpCode {
    /// Request control of the machine
    RequestControl = 0x00,
    /// Reset the machine
    Reset = 0x01,
    /// Set target speed
    SetTargetSpeed = 0x02,
    /// Start or resume
    StartOrResume = 0x07,
    /// Stop or pause
    StopOrPause = 0x08,
    /// Response marker for indicated results
    ResponseCode = 0x80,
}

impl ControlOpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x02 => Some(Self::SetTargetSpeed),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x80 => Some(Self::ResponseCode),
            _ => None,
        }
    }
}

/// Control Point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResult {
    /// Command accepted
    Success,
    /// Op code not supported by the machine
    OpCodeNotSupported,
    /// Parameter out of range
    InvalidParameter,
    /// Machine could not carry out the command
    OperationFailed,
    /// Control has not been granted
    ControlNotPermitted,
    /// Any other code
    Unknown,
}

impl From<u8> for ControlResult {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            _ => Self::Unknown,
        }
    }
}

/// Indicated Control Point response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPointResponse {
    /// Op code of the request being answered
    pub request_op_code: u8,
    /// Result of the request
    pub result: ControlResult,
}

/// Decode a Control Point indication: `[0x80, request op code, result]`
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedBuffer`] for fewer than 3 bytes and
/// [`FtmsError::UnsupportedFormat`] if byte 0 is not the response marker.
pub fn decode_control_point_response(data: &[u8]) -> Result<ControlPointResponse> {
    let mut reader = FieldReader::new(data);
    reader.ensure("control point response", 3)?;
    let marker = reader.u8("response op code")?;
    if marker != ControlOpCode::ResponseCode as u8 {
        return Err(FtmsError::UnsupportedFormat(format!(
            "control point response marker {marker:#04X}"
        )));
    }
    let request_op_code = reader.u8("request op code")?;
    let result = ControlResult::from(reader.u8("result code")?);

    Ok(ControlPointResponse {
        request_op_code,
        result,
    })
}

/// Control Point commands issued by the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Ask the machine for control
    RequestControl,
    /// Reset (also used to wake an idle machine)
    Reset,
    /// Target speed in units of 0.01 km/h
    SetTargetSpeed(u16),
    /// Start or resume the belt
    StartOrResume,
    /// Stop the belt
    Stop,
    /// Pause the belt
    Pause,
}

impl ControlCommand {
    /// Set-target-speed command for a speed given in mph
    #[must_use]
    pub fn set_target_speed_mph(speed_mph: f64) -> Self {
        let hundredths = (units::mph_to_kmh(speed_mph) * 100.0)
            .round()
            .clamp(0.0, f64::from(u16::MAX));
        Self::SetTargetSpeed(hundredths as u16)
    }

    /// Op code this command is written with
    #[must_use]
    pub const fn op_code(&self) -> ControlOpCode {
        match self {
            Self::RequestControl => ControlOpCode::RequestControl,
            Self::Reset => ControlOpCode::Reset,
            Self::SetTargetSpeed(_) => ControlOpCode::SetTargetSpeed,
            Self::StartOrResume => ControlOpCode::StartOrResume,
            Self::Stop | Self::Pause => ControlOpCode::StopOrPause,
        }
    }

    /// Serialize command to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(self.op_code() as u8);

        match self {
            Self::SetTargetSpeed(hundredths) => buf.put_u16_le(*hundredths),
            Self::Stop => buf.put_u8(0x01),
            Self::Pause => buf.put_u8(0x02),
            Self::RequestControl | Self::Reset | Self::StartOrResume => {}
        }

        buf.freeze()
    }
}

/// Fitness Machine Status (0x2ADA) op codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatusOpCode {
    /// Machine was reset
    Reset,
    /// Stopped or paused from the console
    StoppedOrPausedByUser,
    /// Safety key pulled
    StoppedBySafetyKey,
    /// Started or resumed from the console
    StartedOrResumedByUser,
    /// Target speed changed
    TargetSpeedChanged,
    /// Target incline changed
    TargetInclineChanged,
    /// Another client took control
    ControlPermissionLost,
    /// Any other op code
    Other(u8),
}

impl From<u8> for MachineStatusOpCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Reset,
            0x02 => Self::StoppedOrPausedByUser,
            0x03 => Self::StoppedBySafetyKey,
            0x04 => Self::StartedOrResumedByUser,
            0x05 => Self::TargetSpeedChanged,
            0x06 => Self::TargetInclineChanged,
            0xFF => Self::ControlPermissionLost,
            other => Self::Other(other),
        }
    }
}

/// Decoded Fitness Machine Status notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus {
    /// Status op code
    pub op_code: MachineStatusOpCode,
    /// Op-code specific parameter bytes
    pub parameters: Vec<u8>,
}

/// Decode a Fitness Machine Status notification
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedBuffer`] for an empty buffer.
pub fn decode_machine_status(data: &[u8]) -> Result<MachineStatus> {
    let mut reader = FieldReader::new(data);
    let op_code = MachineStatusOpCode::from(reader.u8("machine status op code")?);
    Ok(MachineStatus {
        op_code,
        parameters: reader.rest().to_vec(),
    })
}

/// Fitness Machine Feature (0x2ACC) bit fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineFeatures {
    /// Fitness machine features field
    pub machine: u32,
    /// Target setting features field
    pub target_settings: u32,
}

impl MachineFeatures {
    /// Speed target setting supported
    #[must_use]
    pub const fn supports_speed_target(&self) -> bool {
        self.target_settings & 0x0001 != 0
    }

    /// Inclination target setting supported
    #[must_use]
    pub const fn supports_inclination_target(&self) -> bool {
        self.target_settings & 0x0002 != 0
    }
}

/// Decode the Fitness Machine Feature read value
///
/// # Errors
///
/// Returns [`FtmsError::TruncatedBuffer`] if fewer than 8 bytes are present.
pub fn decode_machine_features(data: &[u8]) -> Result<MachineFeatures> {
    let mut reader = FieldReader::new(data);
    reader.ensure("fitness machine features", 8)?;
    Ok(MachineFeatures {
        machine: reader.buf.get_u32_le(),
        target_settings: reader.buf.get_u32_le(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_frame(speed_hundredths: u16) -> Vec<u8> {
        let mut frame = vec![0x00, 0x00];
        frame.extend_from_slice(&speed_hundredths.to_le_bytes());
        frame
    }

    #[test]
    fn test_decode_minimal_frame() {
        let data = decode_treadmill_data(&minimal_frame(512)).unwrap();

        assert!((data.instantaneous_speed_kmh - 5.12).abs() < 1e-9);
        assert_eq!(data.total_distance_m, 0);
        assert_eq!(data.elapsed_time_s, 0);
        assert_eq!(data.total_energy_kcal, 0);
    }

    #[test]
    fn test_decode_all_fields() {
        let flags: u16 = flags::DEFINED & !flags::MORE_DATA;
        let mut frame = Vec::new();
        frame.extend_from_slice(&flags.to_le_bytes()); // 0..2
        frame.extend_from_slice(&650u16.to_le_bytes()); // 2..4 speed
        frame.extend_from_slice(&600u16.to_le_bytes()); // 4..6 avg speed
        frame.extend_from_slice(&[0x49, 0x06, 0x01]); // 6..9 distance = 0x010649
        frame.extend_from_slice(&25i16.to_le_bytes()); // 9..11 inclination
        frame.extend_from_slice(&(-15i16).to_le_bytes()); // 11..13 ramp
        frame.extend_from_slice(&123u16.to_le_bytes()); // 13..15 +elev
        frame.extend_from_slice(&45u16.to_le_bytes()); // 15..17 -elev
        frame.extend_from_slice(&277u16.to_le_bytes()); // 17..19 pace
        frame.extend_from_slice(&300u16.to_le_bytes()); // 19..21 avg pace
        frame.extend_from_slice(&80u16.to_le_bytes()); // 21..23 energy
        frame.extend_from_slice(&410u16.to_le_bytes()); // 23..25 energy/h
        frame.push(7); // 25 energy/min
        frame.push(132); // 26 heart rate
        frame.push(5); // 27 MET
        frame.extend_from_slice(&600u16.to_le_bytes()); // 28..30 elapsed
        frame.extend_from_slice(&1200u16.to_le_bytes()); // 30..32 remaining
        frame.extend_from_slice(&(-40i16).to_le_bytes()); // 32..34 force
        frame.extend_from_slice(&180i16.to_le_bytes()); // 34..36 power
        assert_eq!(frame.len(), 36);

        let data = decode_treadmill_data(&frame).unwrap();

        assert_eq!(data.flags, flags);
        assert!((data.instantaneous_speed_kmh - 6.5).abs() < 1e-9);
        assert!((data.average_speed_kmh - 6.0).abs() < 1e-9);
        assert_eq!(data.total_distance_m, 0x01_0649);
        assert!((data.inclination_percent - 2.5).abs() < 1e-9);
        assert!((data.ramp_angle_deg + 1.5).abs() < 1e-9);
        assert!((data.positive_elevation_gain_m - 12.3).abs() < 1e-9);
        assert!((data.negative_elevation_gain_m - 4.5).abs() < 1e-9);
        assert_eq!(data.instantaneous_pace, 277);
        assert_eq!(data.average_pace, 300);
        assert_eq!(data.total_energy_kcal, 80);
        assert_eq!(data.energy_per_hour_kcal, 410);
        assert_eq!(data.energy_per_minute_kcal, 7);
        assert_eq!(data.heart_rate_bpm, 132);
        assert_eq!(data.metabolic_equivalent, 5);
        assert_eq!(data.elapsed_time_s, 600);
        assert_eq!(data.remaining_time_s, 1200);
        assert_eq!(data.force_on_belt_n, -40);
        assert_eq!(data.power_output_w, 180);
    }

    #[test]
    fn test_decode_sparse_fields_keep_offsets() {
        // distance + elapsed time only
        let flags = flags::TOTAL_DISTANCE | flags::ELAPSED_TIME;
        let mut frame = Vec::new();
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.extend_from_slice(&300u16.to_le_bytes());
        frame.extend_from_slice(&[0x49, 0x06, 0x00]);
        frame.extend_from_slice(&600u16.to_le_bytes());

        let data = decode_treadmill_data(&frame).unwrap();
        assert_eq!(data.total_distance_m, 1609);
        assert_eq!(data.elapsed_time_s, 600);
        assert!(data.average_speed_kmh.abs() < f64::EPSILON);
    }

    #[test]
    fn test_decode_unavailable_sentinels() {
        let flags = flags::INCLINATION | flags::EXPENDED_ENERGY;
        let mut frame = Vec::new();
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.extend_from_slice(&100u16.to_le_bytes());
        frame.extend_from_slice(&0x7FFFi16.to_le_bytes());
        frame.extend_from_slice(&0x7FFFi16.to_le_bytes());
        frame.extend_from_slice(&0xFFFFu16.to_le_bytes());
        frame.extend_from_slice(&0xFFFFu16.to_le_bytes());
        frame.push(0xFF);

        let data = decode_treadmill_data(&frame).unwrap();
        assert!(data.inclination_percent.abs() < f64::EPSILON);
        assert!(data.ramp_angle_deg.abs() < f64::EPSILON);
        assert_eq!(data.total_energy_kcal, 0);
        assert_eq!(data.energy_per_hour_kcal, 0);
        assert_eq!(data.energy_per_minute_kcal, 0);
    }

    #[test]
    fn test_decode_truncated() {
        for len in 0..4 {
            let frame = &minimal_frame(512)[..len];
            let err = decode_treadmill_data(frame).unwrap_err();
            assert!(
                matches!(err, FtmsError::TruncatedBuffer { .. }),
                "len {len}: {err}"
            );
        }

        let mut frame = flags::TOTAL_DISTANCE.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0x10, 0x00, 0x49, 0x06]);
        match decode_treadmill_data(&frame).unwrap_err() {
            FtmsError::TruncatedBuffer {
                field,
                needed,
                available,
            } => {
                assert_eq!(field, "total distance");
                assert_eq!(needed, 3);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_rejects_continuation_frame() {
        let mut frame = minimal_frame(512);
        frame[0] |= 0x01;
        assert!(matches!(
            decode_treadmill_data(&frame),
            Err(FtmsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_decode_training_status() {
        let status = decode_training_status(&[0x00, 0x0E]).unwrap();
        assert_eq!(status.code, 0x0E);
        assert_eq!(status.label, "Pre-Workout");
        assert!(status.text.is_none());

        let status = decode_training_status(&[0x01, 0x0D, b'Q', b'S']).unwrap();
        assert_eq!(status.label, "Manual Mode (Quick Start)");
        assert_eq!(status.text.as_deref(), Some("QS"));

        // extended string flag set alongside the plain one
        let status = decode_training_status(&[0x03, 0x0D, b'X']).unwrap();
        assert_eq!(status.flags, 0x03);
        assert_eq!(status.label, "Manual Mode (Quick Start)");
        assert_eq!(status.text.as_deref(), Some("X"));

        let status = decode_training_status(&[0x00, 0x42]).unwrap();
        assert_eq!(status.label, RESERVED_STATUS_LABEL);

        assert!(matches!(
            decode_training_status(&[0x00]),
            Err(FtmsError::TruncatedBuffer { .. })
        ));
    }

    #[test]
    fn test_training_status_labels() {
        assert_eq!(training_status_label(0x01), "Idle");
        assert_eq!(training_status_label(0x0F), "Post-Workout");
        assert_eq!(training_status_label(0x10), RESERVED_STATUS_LABEL);
    }

    #[test]
    fn test_decode_control_point_response() {
        let response = decode_control_point_response(&[0x80, 0x00, 0x01]).unwrap();
        assert_eq!(response.request_op_code, 0x00);
        assert_eq!(response.result, ControlResult::Success);

        let response = decode_control_point_response(&[0x80, 0x07, 0x05]).unwrap();
        assert_eq!(response.result, ControlResult::ControlNotPermitted);

        let response = decode_control_point_response(&[0x80, 0x02, 0x09]).unwrap();
        assert_eq!(response.result, ControlResult::Unknown);

        assert!(matches!(
            decode_control_point_response(&[0x80, 0x00]),
            Err(FtmsError::TruncatedBuffer { .. })
        ));
        assert!(matches!(
            decode_control_point_response(&[0x07, 0x00, 0x01]),
            Err(FtmsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(&ControlCommand::RequestControl.to_bytes()[..], &[0x00]);
        assert_eq!(&ControlCommand::Reset.to_bytes()[..], &[0x01]);
        assert_eq!(&ControlCommand::StartOrResume.to_bytes()[..], &[0x07]);
        assert_eq!(&ControlCommand::Stop.to_bytes()[..], &[0x08, 0x01]);
        assert_eq!(&ControlCommand::Pause.to_bytes()[..], &[0x08, 0x02]);
    }

    #[test]
    fn test_encode_set_speed() {
        // 3 mph = 4.828 km/h -> 483
        let command = ControlCommand::set_target_speed_mph(3.0);
        assert_eq!(command, ControlCommand::SetTargetSpeed(483));
        assert_eq!(&command.to_bytes()[..], &[0x02, 0xE3, 0x01]);

        assert_eq!(
            ControlCommand::set_target_speed_mph(-1.0),
            ControlCommand::SetTargetSpeed(0)
        );
    }

    #[test]
    fn test_decode_machine_status_and_features() {
        let status = decode_machine_status(&[0x05, 0xF4, 0x01]).unwrap();
        assert_eq!(status.op_code, MachineStatusOpCode::TargetSpeedChanged);
        assert_eq!(status.parameters, vec![0xF4, 0x01]);
        assert!(decode_machine_status(&[]).is_err());

        let mut raw = 0x0000_1405u32.to_le_bytes().to_vec();
        raw.extend_from_slice(&0x0000_0001u32.to_le_bytes());
        let features = decode_machine_features(&raw).unwrap();
        assert_eq!(features.machine, 0x1405);
        assert!(features.supports_speed_target());
        assert!(!features.supports_inclination_target());
        assert!(decode_machine_features(&raw[..7]).is_err());
    }
}
