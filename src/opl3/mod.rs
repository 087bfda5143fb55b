//! OPL3 (YMF262) chip support
//!
//! - `registers`: register map and bit-field packing shared by all backends
//! - `chip`: accurate integer model of the chip
//! - `envelope`, `tables`: building blocks of the accurate model

pub mod chip;
pub mod envelope;
pub mod registers;
pub mod tables;

pub use chip::Opl3;

/// Chip master clock in Hz
pub const MASTER_CLOCK: u32 = 14_318_180;

/// Native output rate of the chip (master clock / 288, rounded)
pub const NATIVE_RATE: u32 = (MASTER_CLOCK + 144) / 288;

/// Pan value that places a channel in the centre
pub const PAN_CENTER: u8 = 64;

/// Largest pan value (hard right)
pub const PAN_MAX: u8 = 127;

/// Constant-power pan gains in 16.16 fixed point for a pan of 0 (left) to 127 (right)
pub fn pan_gains(pan: u8) -> (i32, i32) {
    let theta = f64::from(pan.min(PAN_MAX)) / f64::from(PAN_MAX) * std::f64::consts::FRAC_PI_2;
    let scale = f64::from(1u32 << 16);
    (
        (theta.cos() * scale).round() as i32,
        (theta.sin() * scale).round() as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_rate() {
        assert_eq!(NATIVE_RATE, 49_716);
    }

    #[test]
    fn test_pan_extremes_are_exclusive() {
        assert_eq!(pan_gains(0), (65_536, 0));
        assert_eq!(pan_gains(PAN_MAX), (0, 65_536));
        assert_eq!(pan_gains(200), pan_gains(PAN_MAX));
    }

    #[test]
    fn test_pan_centre_is_constant_power() {
        let (l, r) = pan_gains(PAN_CENTER);
        let power = (l as f64 / 65_536.0).powi(2) + (r as f64 / 65_536.0).powi(2);
        assert!((power - 1.0).abs() < 0.01, "power {power}");
    }
}
