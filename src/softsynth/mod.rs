//! Fast approximating OPL3 backend
//!
//! Floating-point FM synthesis driven by the same register file as the
//! accurate model. Envelopes are linear in dB, waveforms are computed
//! directly and the LFOs are free-running sines/triangles. Output is not
//! bit-exact, but it runs at any PCM rate so no rate conversion is needed.

use crate::backend::{ChipType, OplBackend};
use crate::opl3::registers::{
    decode_channel_address, slot_channel, unpack_frequency, Channel, ChannelRegister,
    Characteristic, FourOpPair, OperatorRegister, DEEP_TREMOLO, DEEP_VIBRATO, KEY_ON,
    NUM_CHANNELS, NUM_SLOTS, REG_DEPTH_RHYTHM, REG_FOUR_OP, REG_NEW, REG_NOTE_SELECT,
};
use crate::opl3::tables::{KSL_ROM, KSL_SHIFT, MULTIPLIER};
use crate::opl3::{pan_gains, NATIVE_RATE};
use crate::streaming::MAX_SAMPLE_RATE;
use std::f32::consts::PI;

/// Peak operator amplitude, matching the accurate model's exp table
const FULL_SCALE: f32 = 4084.0;
const SILENCE_DB: f32 = 96.0;
/// Attack time of rate 4 in milliseconds (halves every 4 rate steps)
const ATTACK_BASE_MS: f32 = 2826.0;
/// Decay time from 0 to 96 dB of rate 4 in milliseconds
const DECAY_BASE_MS: f32 = 39280.0;
/// Attenuation step of the envelope output in dB
const ENVELOPE_UNIT_DB: f32 = 0.1875;
const TREMOLO_HZ: f32 = 3.7;
const VIBRATO_HZ: f32 = 6.1;
/// Phase modulation in cycles per unit of operator output
const MOD_DEPTH: f32 = FULL_SCALE / 1024.0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    Attack,
    Decay,
    Sustain,
    Release,
}

#[derive(Clone, Copy, Debug)]
struct SoftOperator {
    phase: f32,
    env_db: f32,
    stage: Stage,
    key: bool,
    out: f32,
    prev_out: f32,
}

impl SoftOperator {
    fn new() -> Self {
        SoftOperator {
            phase: 0.0,
            env_db: SILENCE_DB,
            stage: Stage::Release,
            key: false,
            out: 0.0,
            prev_out: 0.0,
        }
    }
}

#[derive(Clone, Copy)]
struct Lfo {
    tremolo_db: f32,
    vibrato: f32,
}

/// Pitch and key-scaling inputs shared by the operators of a voice
#[derive(Clone, Copy)]
struct Pitch {
    hz: f32,
    fnum: u16,
    block: u8,
    ksv: u8,
}

fn wave(select: u8, phase: f32) -> f32 {
    let p = phase - phase.floor();
    let s = (2.0 * PI * p).sin();
    match select & 0x07 {
        0 => s,
        1 => s.max(0.0),
        2 => s.abs(),
        3 => {
            if p % 0.5 < 0.25 {
                s.abs()
            } else {
                0.0
            }
        }
        4 => {
            if p < 0.5 {
                (4.0 * PI * p).sin()
            } else {
                0.0
            }
        }
        5 => {
            if p < 0.5 {
                (4.0 * PI * p).sin().abs()
            } else {
                0.0
            }
        }
        6 => {
            if p < 0.5 {
                1.0
            } else {
                -1.0
            }
        }
        _ => {
            if p < 0.5 {
                (-32.0 * p).exp2()
            } else {
                -(-32.0 * (1.0 - p)).exp2()
            }
        }
    }
}

/// Floating-point FM approximation of the YMF262
pub struct SoftOpl {
    rate: u32,
    regs: Box<[u8; 0x200]>,
    ops: [SoftOperator; NUM_SLOTS],
    pan: [(f32, f32); NUM_CHANNELS],
    /// LFO phases in cycles, kept within [0, 1)
    tremolo_phase: f32,
    vibrato_phase: f32,
}

impl SoftOpl {
    /// Create a synth rendering at `sample_rate`
    ///
    /// Fails for a zero rate or one above 192 kHz.
    pub fn new(sample_rate: u32) -> std::result::Result<Self, String> {
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(format!(
                "Unsupported sample rate {sample_rate} Hz (1..={MAX_SAMPLE_RATE})"
            ));
        }
        let mut synth = SoftOpl {
            rate: sample_rate,
            regs: Box::new([0; 0x200]),
            ops: [SoftOperator::new(); NUM_SLOTS],
            pan: [(1.0, 1.0); NUM_CHANNELS],
            tremolo_phase: 0.0,
            vibrato_phase: 0.0,
        };
        synth.reset();
        Ok(synth)
    }

    fn reg(&self, address: u16) -> u8 {
        self.regs[usize::from(address & 0x1FF)]
    }

    fn opl3_mode(&self) -> bool {
        self.reg(REG_NEW) & 0x01 != 0
    }

    /// 4-op pair a channel belongs to, if the pair is enabled
    fn active_pair(&self, channel: Channel) -> Option<FourOpPair> {
        if !self.opl3_mode() {
            return None;
        }
        FourOpPair::containing(channel)
            .filter(|pair| self.reg(REG_FOUR_OP) & pair.connection_bit() != 0)
    }

    fn pitch(&self, channel: Channel) -> Pitch {
        let (fnum, block, _) = unpack_frequency(
            self.reg(channel.register(ChannelRegister::FnumLow)),
            self.reg(channel.register(ChannelRegister::KeyBlockFnum)),
        );
        let nts = (self.reg(REG_NOTE_SELECT) >> 6) & 0x01;
        Pitch {
            hz: f32::from(fnum) * NATIVE_RATE as f32 / (1u32 << (20 - u32::from(block))) as f32,
            fnum,
            block,
            ksv: (block << 1) | ((fnum >> (9 - nts)) & 0x01) as u8,
        }
    }

    fn lfo(&self) -> Lfo {
        let depth = self.reg(REG_DEPTH_RHYTHM);
        let tremolo_depth = if depth & DEEP_TREMOLO != 0 { 4.8 } else { 1.0 };
        let vibrato_cents = if depth & DEEP_VIBRATO != 0 { 14.0 } else { 7.0 };
        let tri = 1.0 - (2.0 * self.tremolo_phase - 1.0).abs();
        let vib = (2.0 * PI * self.vibrato_phase).sin();
        Lfo {
            tremolo_db: tremolo_depth * tri,
            vibrato: (vibrato_cents * vib / 1200.0).exp2(),
        }
    }

    fn advance_lfo(&mut self) {
        let rate = self.rate as f32;
        self.tremolo_phase = (self.tremolo_phase + TREMOLO_HZ / rate).fract();
        self.vibrato_phase = (self.vibrato_phase + VIBRATO_HZ / rate).fract();
    }

    fn set_key(&mut self, channel: Channel, on: bool) {
        let mut targets = vec![channel];
        if let Some(pair) = self.active_pair(channel) {
            if pair.second() == channel {
                return;
            }
            targets.push(pair.second());
        }
        for ch in targets {
            for second in [false, true] {
                let op = &mut self.ops[ch.slot(second)];
                if on && (!op.key || op.stage == Stage::Release) {
                    op.stage = Stage::Attack;
                    op.phase = 0.0;
                }
                op.key = on;
                if !on {
                    op.stage = Stage::Release;
                }
            }
        }
    }

    fn envelope_step_db(&self, reg_rate: u8, ks: u8, attack: bool) -> f32 {
        if reg_rate == 0 {
            return 0.0;
        }
        let rate = (reg_rate * 4 + ks).min(63);
        let base = if attack { ATTACK_BASE_MS } else { DECAY_BASE_MS };
        if attack && rate >= 60 {
            return SILENCE_DB;
        }
        let ms = base / ((f32::from(rate) - 4.0) / 4.0).exp2();
        SILENCE_DB / (ms / 1000.0 * self.rate as f32).max(1.0)
    }

    /// Advance one operator and return its normalized output
    fn step(&mut self, slot: usize, pitch: Pitch, modulation: f32, lfo: Lfo) -> f32 {
        let (channel, second) = slot_channel(slot);
        let ch_reg = self.reg(channel.operator_register(second, OperatorRegister::Characteristic));
        let flags = Characteristic::from_bits_truncate(ch_reg);
        let kl_reg = self.reg(channel.operator_register(second, OperatorRegister::ScaleLevel));
        let ad_reg = self.reg(channel.operator_register(second, OperatorRegister::AttackDecay));
        let sr_reg = self.reg(channel.operator_register(second, OperatorRegister::SustainRelease));
        let wf_mask = if self.opl3_mode() { 0x07 } else { 0x03 };
        let wf = self.reg(channel.operator_register(second, OperatorRegister::Waveform)) & wf_mask;

        let ksr = flags.contains(Characteristic::KSR);
        let ks = pitch.ksv >> if ksr { 0 } else { 2 };
        let sustaining = flags.contains(Characteristic::SUSTAINING);
        let sustain_db = match sr_reg >> 4 {
            15 => SILENCE_DB,
            sl => f32::from(sl) * 3.0,
        };
        let attack = self.envelope_step_db(ad_reg >> 4, ks, true);
        let decay = self.envelope_step_db(ad_reg & 0x0F, ks, false);
        let release = self.envelope_step_db(sr_reg & 0x0F, ks, false);

        let op = &mut self.ops[slot];
        match op.stage {
            Stage::Attack => {
                op.env_db -= attack;
                if op.env_db <= 0.0 {
                    op.env_db = 0.0;
                    op.stage = Stage::Decay;
                }
            }
            Stage::Decay => {
                op.env_db += decay;
                if op.env_db >= sustain_db {
                    op.env_db = sustain_db;
                    op.stage = Stage::Sustain;
                }
            }
            Stage::Sustain => {
                if !sustaining {
                    op.env_db += release;
                }
            }
            Stage::Release => op.env_db += release,
        }
        op.env_db = op.env_db.min(SILENCE_DB);

        let ksl_units = {
            let raw = (i16::from(KSL_ROM[usize::from(pitch.fnum >> 6) & 0x0F]) << 2)
                - ((8 - i16::from(pitch.block)) << 5);
            (raw.max(0) as u16) >> KSL_SHIFT[usize::from(kl_reg >> 6)]
        };
        let tremolo = if flags.contains(Characteristic::TREMOLO) {
            lfo.tremolo_db
        } else {
            0.0
        };
        let attenuation = op.env_db
            + f32::from(kl_reg & 0x3F) * 0.75
            + f32::from(ksl_units) * ENVELOPE_UNIT_DB
            + tremolo;

        let vibrato = if flags.contains(Characteristic::VIBRATO) {
            lfo.vibrato
        } else {
            1.0
        };
        let multiplier = MULTIPLIER[usize::from(ch_reg & 0x0F)] as f32 * 0.5;
        let out = if attenuation >= SILENCE_DB {
            0.0
        } else {
            (-attenuation / 20.0 * std::f32::consts::LOG2_10).exp2() * wave(wf, op.phase + modulation)
        };
        op.phase = (op.phase + pitch.hz * multiplier * vibrato / self.rate as f32).fract();
        op.prev_out = op.out;
        op.out = out;
        out
    }

    fn feedback(&self, slot: usize, fb: u8) -> f32 {
        if fb == 0 {
            return 0.0;
        }
        let op = &self.ops[slot];
        (op.out + op.prev_out) * MOD_DEPTH / (1u32 << (9 - u32::from(fb))) as f32
    }

    fn render_two_op(&mut self, channel: Channel, lfo: Lfo) -> f32 {
        let pitch = self.pitch(channel);
        let c0 = self.reg(channel.register(ChannelRegister::FeedbackConnection));
        let (s0, s1) = (channel.slot(false), channel.slot(true));
        let fb = self.feedback(s0, (c0 >> 1) & 0x07);
        let m = self.step(s0, pitch, fb, lfo);
        if c0 & 0x01 == 0 {
            self.step(s1, pitch, m * MOD_DEPTH, lfo)
        } else {
            m + self.step(s1, pitch, 0.0, lfo)
        }
    }

    fn render_four_op(&mut self, pair: FourOpPair, lfo: Lfo) -> f32 {
        let (first, second) = (pair.first(), pair.second());
        let pitch = self.pitch(first);
        let c0a = self.reg(first.register(ChannelRegister::FeedbackConnection));
        let c0b = self.reg(second.register(ChannelRegister::FeedbackConnection));
        let [a0, a1, b0, b1] = [
            first.slot(false),
            first.slot(true),
            second.slot(false),
            second.slot(true),
        ];
        let fb = self.feedback(a0, (c0a >> 1) & 0x07);
        let o1 = self.step(a0, pitch, fb, lfo);
        match ((c0a & 0x01) << 1) | (c0b & 0x01) {
            0 => {
                let o2 = self.step(a1, pitch, o1 * MOD_DEPTH, lfo);
                let o3 = self.step(b0, pitch, o2 * MOD_DEPTH, lfo);
                self.step(b1, pitch, o3 * MOD_DEPTH, lfo)
            }
            1 => {
                let o2 = self.step(a1, pitch, o1 * MOD_DEPTH, lfo);
                let o3 = self.step(b0, pitch, 0.0, lfo);
                o2 + self.step(b1, pitch, o3 * MOD_DEPTH, lfo)
            }
            2 => {
                let o2 = self.step(a1, pitch, 0.0, lfo);
                let o3 = self.step(b0, pitch, o2 * MOD_DEPTH, lfo);
                o1 + self.step(b1, pitch, o3 * MOD_DEPTH, lfo)
            }
            _ => {
                let o2 = self.step(a1, pitch, 0.0, lfo);
                let o3 = self.step(b0, pitch, o2 * MOD_DEPTH, lfo);
                o1 + o3 + self.step(b1, pitch, 0.0, lfo)
            }
        }
    }
}

impl OplBackend for SoftOpl {
    fn set_rate(&mut self, sample_rate: u32) {
        if sample_rate > 0 && sample_rate <= MAX_SAMPLE_RATE {
            self.rate = sample_rate;
        }
    }

    fn can_run_at_pcm_rate(&self) -> bool {
        true
    }

    fn native_rate(&self) -> u32 {
        self.rate
    }

    fn reset(&mut self) {
        self.regs.fill(0);
        self.ops = [SoftOperator::new(); NUM_SLOTS];
        self.pan = [(1.0, 1.0); NUM_CHANNELS];
        self.tremolo_phase = 0.0;
        self.vibrato_phase = 0.0;
    }

    fn write_reg(&mut self, address: u16, data: u8) {
        let address = address & 0x1FF;
        let was_on = self.regs[usize::from(address)] & KEY_ON != 0;
        self.regs[usize::from(address)] = data;

        if let Some((ChannelRegister::KeyBlockFnum, channel)) = decode_channel_address(address) {
            let on = data & KEY_ON != 0;
            if on != was_on {
                self.set_key(channel, on);
            }
        }
    }

    fn write_pan(&mut self, channel: u16, pan: u8) {
        if let Some(gains) = self.pan.get_mut(usize::from(channel)) {
            let (l, r) = pan_gains(pan);
            *gains = (l as f32 / 65_536.0, r as f32 / 65_536.0);
        }
    }

    fn native_generate(&mut self, frame: &mut [i16; 2]) {
        let lfo = self.lfo();
        let opl3 = self.opl3_mode();
        let mut left = 0.0f32;
        let mut right = 0.0f32;

        for ch in 0..NUM_CHANNELS {
            let Some(channel) = Channel::new(ch) else {
                continue;
            };
            let out = match self.active_pair(channel) {
                Some(pair) if pair.first() == channel => continue,
                Some(pair) => self.render_four_op(pair, lfo),
                None => self.render_two_op(channel, lfo),
            };
            let c0 = self.reg(channel.register(ChannelRegister::FeedbackConnection));
            let (pan_l, pan_r) = self.pan[ch];
            if !opl3 || c0 & 0x10 != 0 {
                left += out * pan_l;
            }
            if !opl3 || c0 & 0x20 != 0 {
                right += out * pan_r;
            }
        }

        self.advance_lfo();
        let to_i16 = |v: f32| (v * FULL_SCALE).round().clamp(-32768.0, 32767.0) as i16;
        *frame = [to_i16(left), to_i16(right)];
    }

    fn emulator_name(&self) -> &'static str {
        "Fast FM approximation"
    }

    fn chip_type(&self) -> ChipType {
        ChipType::Opl3
    }

    fn read_register(&self, address: u16) -> Option<u8> {
        self.regs.get(usize::from(address)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_tone(synth: &mut SoftOpl, ch: usize) {
        let channel = Channel::new(ch).unwrap();
        // Modulator fully attenuated, carrier at full level
        synth.write_reg(channel.operator_register(false, OperatorRegister::ScaleLevel), 0x3F);
        synth.write_reg(channel.operator_register(true, OperatorRegister::ScaleLevel), 0x00);
        for second in [false, true] {
            synth.write_reg(channel.operator_register(second, OperatorRegister::Characteristic), 0x21);
            synth.write_reg(channel.operator_register(second, OperatorRegister::AttackDecay), 0xF0);
            synth.write_reg(channel.operator_register(second, OperatorRegister::SustainRelease), 0x0F);
        }
        synth.write_reg(channel.register(ChannelRegister::FeedbackConnection), 0x30);
        synth.write_reg(channel.register(ChannelRegister::FnumLow), 0x44);
        synth.write_reg(channel.register(ChannelRegister::KeyBlockFnum), 0x32);
    }

    fn render(synth: &mut SoftOpl, frames: usize) -> Vec<[i16; 2]> {
        let mut out = vec![[0i16; 2]; frames];
        synth.generate_into(&mut out);
        out
    }

    #[test]
    fn test_invalid_rates_rejected() {
        assert!(SoftOpl::new(0).is_err());
        assert!(SoftOpl::new(400_000).is_err());
        assert!(SoftOpl::new(22_050).is_ok());
    }

    #[test]
    fn test_reset_is_silent() {
        let mut synth = SoftOpl::new(44_100).unwrap();
        let frames = render(&mut synth, 500);
        assert!(frames.iter().all(|f| *f == [0, 0]));
    }

    #[test]
    fn test_tone_frequency() {
        let mut synth = SoftOpl::new(44_100).unwrap();
        synth.write_reg(REG_NEW, 0x01);
        sine_tone(&mut synth, 0);
        let frames = render(&mut synth, 44_100);
        let crossings = frames
            .windows(2)
            .filter(|w| w[0][0] < 0 && w[1][0] >= 0)
            .count();
        // fnum 0x244 in block 4 is A4 (about 440 Hz)
        assert!((430..=450).contains(&crossings), "got {crossings} cycles");
    }

    #[test]
    fn test_key_off_fades_out() {
        let mut synth = SoftOpl::new(44_100).unwrap();
        synth.write_reg(REG_NEW, 0x01);
        sine_tone(&mut synth, 2);
        render(&mut synth, 1000);
        let channel = Channel::new(2).unwrap();
        synth.write_reg(channel.register(ChannelRegister::KeyBlockFnum), 0x12);
        let tail = render(&mut synth, 4410);
        assert!(tail[tail.len() - 10..].iter().all(|f| *f == [0, 0]));
    }

    #[test]
    fn test_pan_side_channel() {
        let mut synth = SoftOpl::new(44_100).unwrap();
        synth.write_reg(REG_NEW, 0x01);
        sine_tone(&mut synth, 0);
        synth.write_pan(0, 0);
        let frames = render(&mut synth, 2000);
        assert!(frames.iter().any(|f| f[0] != 0));
        assert!(frames.iter().all(|f| f[1] == 0), "hard-left pan must silence the right side");
    }

    #[test]
    fn test_waveform_shapes() {
        assert!((wave(0, 0.25) - 1.0).abs() < 1e-6);
        assert_eq!(wave(1, 0.75), 0.0);
        assert!(wave(2, 0.75) > 0.99);
        assert_eq!(wave(3, 0.3), 0.0);
        assert_eq!(wave(6, 0.7), -1.0);
        assert!((wave(7, 0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_lfo_keeps_running_in_long_previews() {
        let mut synth = SoftOpl::new(44_100).unwrap();
        // Phases stay bounded however long the preview has been running
        synth.tremolo_phase = 0.25;
        synth.vibrato_phase = 0.5;
        render(&mut synth, 44_100);

        // One second advances each LFO by its frequency, modulo one cycle
        assert!((synth.tremolo_phase - 0.95).abs() < 0.01, "tremolo {}", synth.tremolo_phase);
        assert!((synth.vibrato_phase - 0.6).abs() < 0.01, "vibrato {}", synth.vibrato_phase);
        assert!((0.0..1.0).contains(&synth.tremolo_phase));
    }
}
