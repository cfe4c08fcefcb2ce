//! Scaling of continuous PTZ values to protocol bytes

/// Magnitudes below this are sent as an explicit stop
pub const STOP_THRESHOLD: f32 = 0.05;

/// Slowest pan/tilt speed byte
pub const PAN_TILT_MIN: u8 = 0x31;
/// Fastest pan/tilt speed byte
pub const PAN_TILT_MAX: u8 = 0x3F;

/// Slowest zoom speed byte
pub const ZOOM_MIN: u8 = 0x30;
/// Fastest zoom speed byte
pub const ZOOM_MAX: u8 = 0x32;

/// Lowest preset number
pub const PRESET_MIN: u16 = 1;
/// Highest preset number
pub const PRESET_MAX: u16 = 47;

/// Quantized movement along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    /// Explicit stop
    Stop,
    /// Towards negative values (left, down, out) at a speed byte
    Negative(u8),
    /// Towards positive values (right, up, in) at a speed byte
    Positive(u8),
}

fn scale(value: f32, min: u8, max: u8) -> Motion {
    let mag = value.abs();
    // NaN compares false and lands here too
    if !(mag >= STOP_THRESHOLD) {
        return Motion::Stop;
    }
    let steps = f32::from(max - min);
    let byte = min + (mag.min(1.0) * steps).round() as u8;
    if value < 0.0 {
        Motion::Negative(byte)
    } else {
        Motion::Positive(byte)
    }
}

/// Quantize a pan or tilt value in `[-1, 1]`
pub fn pan_tilt(value: f32) -> Motion {
    scale(value, PAN_TILT_MIN, PAN_TILT_MAX)
}

/// Quantize a zoom value in `[-1, 1]`
pub fn zoom(value: f32) -> Motion {
    scale(value, ZOOM_MIN, ZOOM_MAX)
}

/// Clamp a preset number to the supported range and encode it
pub fn preset_byte(preset: u16) -> u8 {
    let n = preset.clamp(PRESET_MIN, PRESET_MAX);
    0x30 + n as u8
}

/// Preset number after clamping
pub fn clamp_preset(preset: u16) -> u8 {
    preset.clamp(PRESET_MIN, PRESET_MAX) as u8
}
