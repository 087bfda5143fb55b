//! Envelope generator for the accurate OPL3 model
//!
//! Each operator carries an attack/decay/sustain/release generator working on
//! a 9-bit attenuation (0 = full volume, 0x1FF = silent). Rates are advanced
//! by a chip-wide timer shared by all 36 operators.

use super::tables::{EG_INCSTEP, KSL_ROM, KSL_SHIFT};

/// Envelope generator stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Rising towards full volume
    Attack,
    /// Falling towards the sustain level
    Decay,
    /// Holding (or releasing, for non-sustaining envelopes)
    Sustain,
    /// Falling towards silence after key-off
    Release,
}

/// Chip-wide envelope timer
#[derive(Debug, Clone, Default)]
pub struct EnvelopeTimer {
    timer: u64,
    carry: bool,
    /// Toggles every sample; envelopes step on odd samples
    pub state: bool,
    /// Rate offset derived from the lowest set timer bit
    pub add: u8,
    /// Low bits of the timer used by the fast-rate increment pattern
    pub timer_lo: u8,
}

impl EnvelopeTimer {
    /// Advance the timer by one sample
    pub fn advance(&mut self) {
        if self.state {
            let shift = (0..13).find(|s| (self.timer >> s) & 1 != 0);
            self.add = shift.map_or(0, |s| s as u8 + 1);
            self.timer_lo = (self.timer & 0x03) as u8;
        }
        if self.carry || self.state {
            if self.timer == 0xF_FFFF_FFFF {
                self.timer = 0;
                self.carry = true;
            } else {
                self.timer += 1;
                self.carry = false;
            }
        }
        self.state = !self.state;
    }
}

/// Envelope generator of one operator
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Current stage
    pub state: EnvelopeState,
    /// Raw generator output (9 bits)
    pub rout: u16,
    /// Output including total level, key scaling and tremolo (9 bits)
    pub out: u16,
    /// Key-scale attenuation for the current channel frequency
    pub ksl_attenuation: u8,
    /// Key held
    pub key: bool,
    /// Attack rate register
    pub attack: u8,
    /// Decay rate register
    pub decay: u8,
    /// Sustain level, 0x1F for the register value 15
    pub sustain: u8,
    /// Release rate register
    pub release: u8,
    /// Total level register
    pub total_level: u8,
    /// KSL register
    pub ksl: u8,
    /// Hold at sustain until key-off
    pub sustaining: bool,
    /// Key-scale rate enable
    pub ksr: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope {
            state: EnvelopeState::Release,
            rout: 0x1FF,
            out: 0x1FF,
            ksl_attenuation: 0,
            key: false,
            attack: 0,
            decay: 0,
            sustain: 0,
            release: 0,
            total_level: 0,
            ksl: 0,
            sustaining: false,
            ksr: false,
        }
    }
}

impl Envelope {
    /// Set the sustain level from its 4-bit register value
    pub fn set_sustain(&mut self, value: u8) {
        self.sustain = if value == 0x0F { 0x1F } else { value & 0x0F };
    }

    /// Latch the key state
    ///
    /// Key-off enters release at once, so a key-on written right after it
    /// (before the next sample) restarts the attack.
    pub fn set_key(&mut self, on: bool) {
        self.key = on;
        if !on {
            self.state = EnvelopeState::Release;
        }
    }

    /// Recompute the key-scale attenuation for a channel frequency
    pub fn update_ksl(&mut self, fnum: u16, block: u8) {
        let ksl = (i16::from(KSL_ROM[usize::from(fnum >> 6) & 0x0F]) << 2)
            - ((0x08 - i16::from(block)) << 5);
        self.ksl_attenuation = ksl.max(0) as u8;
    }

    /// Advance one sample
    ///
    /// `ksv` is the channel's key-scale value and `tremolo` the current
    /// tremolo attenuation (0 when tremolo is disabled for this operator).
    /// Returns true when the phase generator must restart.
    pub fn tick(&mut self, ksv: u8, tremolo: u8, timer: &EnvelopeTimer) -> bool {
        let out = self.rout
            + (u16::from(self.total_level) << 2)
            + (u16::from(self.ksl_attenuation) >> KSL_SHIFT[usize::from(self.ksl & 0x03)])
            + u16::from(tremolo);
        self.out = out.min(0x1FF);

        let reset = self.key && self.state == EnvelopeState::Release;
        let reg_rate = if reset {
            self.attack
        } else {
            match self.state {
                EnvelopeState::Attack => self.attack,
                EnvelopeState::Decay => self.decay,
                EnvelopeState::Sustain if !self.sustaining => self.release,
                EnvelopeState::Sustain => 0,
                EnvelopeState::Release => self.release,
            }
        };

        let ks = ksv >> ((u8::from(self.ksr) ^ 1) << 1);
        let rate = ks + (reg_rate << 2);
        let mut rate_hi = rate >> 2;
        let rate_lo = rate & 0x03;
        if rate_hi & 0x10 != 0 {
            rate_hi = 0x0F;
        }

        let mut shift = 0u8;
        if reg_rate != 0 {
            if rate_hi < 12 {
                if timer.state {
                    shift = match rate_hi + timer.add {
                        12 => 1,
                        13 => (rate_lo >> 1) & 0x01,
                        14 => rate_lo & 0x01,
                        _ => 0,
                    };
                }
            } else {
                shift = (rate_hi & 0x03)
                    + EG_INCSTEP[usize::from(rate_lo)][usize::from(timer.timer_lo)];
                if shift & 0x04 != 0 {
                    shift = 0x03;
                }
                if shift == 0 {
                    shift = u8::from(timer.state);
                }
            }
        }

        let mut rout = i32::from(self.rout);
        // Instant attack
        if reset && rate_hi == 0x0F {
            rout = 0;
        }
        let off = self.rout & 0x1F8 == 0x1F8;
        if self.state != EnvelopeState::Attack && !reset && off {
            rout = 0x1FF;
        }

        let mut inc = 0i32;
        match self.state {
            EnvelopeState::Attack => {
                if self.rout == 0 {
                    self.state = EnvelopeState::Decay;
                } else if self.key && shift > 0 && rate_hi != 0x0F {
                    inc = !i32::from(self.rout) >> (4 - shift);
                }
            }
            EnvelopeState::Decay => {
                if (self.rout >> 4) as u8 == self.sustain {
                    self.state = EnvelopeState::Sustain;
                } else if !off && !reset && shift > 0 {
                    inc = 1 << (shift - 1);
                }
            }
            EnvelopeState::Sustain | EnvelopeState::Release => {
                if !off && !reset && shift > 0 {
                    inc = 1 << (shift - 1);
                }
            }
        }
        self.rout = ((rout + inc) & 0x1FF) as u16;

        if reset {
            self.state = EnvelopeState::Attack;
        }
        if !self.key {
            self.state = EnvelopeState::Release;
        }
        reset
    }
}
