//! Lookup tables for the accurate OPL3 model
//!
//! The chip computes operator output in the log domain: a quarter-wave
//! log-sine ROM gives the attenuation of the waveform, the envelope
//! attenuation is added, and an exponential ROM converts back to linear.
//! Both ROMs are generated once at first use.

use std::f64::consts::PI;
use std::sync::OnceLock;

/// Frequency multiplier table (values doubled, so 1 means x0.5)
pub const MULTIPLIER: [u32; 16] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30];

/// Key-scale level attenuation by F-number high bits
pub const KSL_ROM: [u8; 16] = [0, 32, 40, 45, 48, 51, 53, 55, 56, 58, 59, 60, 61, 62, 63, 64];

/// Right shift applied to the KSL attenuation per KSL register value
pub const KSL_SHIFT: [u8; 4] = [8, 1, 2, 0];

/// Envelope increment pattern for the fast rates
pub const EG_INCSTEP: [[u8; 4]; 4] = [[0, 0, 0, 0], [1, 0, 0, 0], [1, 0, 1, 0], [1, 1, 1, 0]];

/// Length of the tremolo triangle (counts up to 105 and back)
pub const TREMOLO_STEPS: u8 = 210;

/// Attenuation value that silences the exponential stage
const SILENT: u16 = 0x1000;

struct Roms {
    logsin: [u16; 256],
    exp: [u16; 256],
}

static ROMS: OnceLock<Roms> = OnceLock::new();

fn roms() -> &'static Roms {
    ROMS.get_or_init(|| {
        let mut logsin = [0u16; 256];
        let mut exp = [0u16; 256];
        for (i, entry) in logsin.iter_mut().enumerate() {
            let s = ((i as f64 + 0.5) * PI / 512.0).sin();
            *entry = (-s.log2() * 256.0).round() as u16;
        }
        for (i, entry) in exp.iter_mut().enumerate() {
            *entry = (2f64.powf((255 - i) as f64 / 256.0) * 1024.0).round() as u16;
        }
        Roms { logsin, exp }
    })
}

/// Log-sine attenuation for a quarter-wave index
#[inline]
fn logsin(index: u16) -> u16 {
    roms().logsin[(index & 0xFF) as usize]
}

/// Convert a log-domain attenuation (4.8 fixed point) to a linear amplitude
#[inline]
pub fn calc_exp(level: u32) -> i32 {
    let level = level.min(0x1FFF);
    let mantissa = u32::from(roms().exp[(level & 0xFF) as usize]) << 1;
    (mantissa >> (level >> 8)) as i32
}

#[inline]
fn finish(attenuation: u16, envelope: u16, negate: bool) -> i32 {
    let out = calc_exp(u32::from(attenuation) + (u32::from(envelope) << 3));
    if negate {
        !out
    } else {
        out
    }
}

/// Quarter-wave lookup for a full-resolution 10-bit phase
#[inline]
fn quarter(phase: u16) -> u16 {
    if phase & 0x100 != 0 {
        logsin((phase & 0xFF) ^ 0xFF)
    } else {
        logsin(phase & 0xFF)
    }
}

/// Quarter-wave lookup at double speed (for the even-sine waveforms)
#[inline]
fn quarter_doubled(phase: u16) -> u16 {
    if phase & 0x80 != 0 {
        logsin(((phase ^ 0xFF) << 1) & 0xFF)
    } else {
        logsin((phase << 1) & 0xFF)
    }
}

/// Evaluate one of the eight OPL3 waveforms
///
/// `phase` is a 10-bit phase (one cycle = 1024), `envelope` the 9-bit
/// envelope attenuation. Returns a signed 13-bit amplitude.
pub fn waveform(select: u8, phase: u16, envelope: u16) -> i32 {
    let phase = phase & 0x3FF;
    match select & 0x07 {
        // Sine
        0 => finish(quarter(phase), envelope, phase & 0x200 != 0),
        // Half sine
        1 => {
            let att = if phase & 0x200 != 0 { SILENT } else { quarter(phase) };
            finish(att, envelope, false)
        }
        // Absolute sine
        2 => finish(quarter(phase), envelope, false),
        // Pulse sine
        3 => {
            let att = if phase & 0x100 != 0 {
                SILENT
            } else {
                logsin(phase & 0xFF)
            };
            finish(att, envelope, false)
        }
        // Even sine
        4 => {
            let att = if phase & 0x200 != 0 {
                SILENT
            } else {
                quarter_doubled(phase)
            };
            finish(att, envelope, phase & 0x300 == 0x100)
        }
        // Absolute even sine
        5 => {
            let att = if phase & 0x200 != 0 {
                SILENT
            } else {
                quarter_doubled(phase)
            };
            finish(att, envelope, false)
        }
        // Square
        6 => finish(0, envelope, phase & 0x200 != 0),
        // Derived square
        _ => {
            let (p, negate) = if phase & 0x200 != 0 {
                ((phase & 0x1FF) ^ 0x1FF, true)
            } else {
                (phase, false)
            };
            finish(p << 3, envelope, negate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rom_endpoints() {
        let roms = roms();
        assert_eq!(roms.logsin[0], 2137);
        assert_eq!(roms.logsin[255], 0);
        assert_eq!(roms.exp[0], 2042);
        assert_eq!(roms.exp[255], 1024);
    }

    #[test]
    fn test_calc_exp_is_monotonic() {
        let mut prev = calc_exp(0);
        assert_eq!(prev, 4084);
        for level in 1..0x1FFF {
            let v = calc_exp(level);
            assert!(v <= prev, "exp must not rise at level {level}");
            prev = v;
        }
        assert_eq!(calc_exp(0x1FFF), 0);
    }

    #[test]
    fn test_sine_is_antisymmetric() {
        for phase in 0..0x200u16 {
            let a = waveform(0, phase, 0);
            let b = waveform(0, phase + 0x200, 0);
            assert_eq!(b, !a, "phase {phase}");
        }
    }

    #[test]
    fn test_half_sine_silent_in_second_half() {
        for phase in 0x200..0x400u16 {
            assert_eq!(waveform(1, phase, 0), 0);
        }
        assert!(waveform(1, 0x100, 0) > 4000);
    }

    #[test]
    fn test_square_levels() {
        assert_eq!(waveform(6, 0x010, 0), 4084);
        assert_eq!(waveform(6, 0x210, 0), !4084);
    }

    #[test]
    fn test_full_envelope_attenuation_silences() {
        for wf in 0..8 {
            for phase in [0u16, 0x80, 0x100, 0x180] {
                let v = waveform(wf, phase, 0x1FF);
                assert!(v == 0 || v == -1, "waveform {wf} phase {phase} gave {v}");
            }
        }
    }
}
