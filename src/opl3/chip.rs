//! Accurate OPL3 model
//!
//! Integer model of the YMF262 signal path: per-operator phase generator,
//! envelope generator and log-sin/exp waveform stage, chip-wide LFOs and
//! envelope timer, 2-op and 4-op channel algorithms and the stereo mixer.
//! Runs only at the chip's native rate of 49716 Hz.

use super::envelope::{Envelope, EnvelopeTimer};
use super::registers::{
    decode_channel_address, decode_operator_address, slot_channel, Channel, ChannelRegister,
    Characteristic, FourOpPair, OperatorRegister, DEEP_TREMOLO, DEEP_VIBRATO, KEY_ON, NUM_CHANNELS,
    NUM_FOUR_OP_PAIRS, NUM_SLOTS, REG_DEPTH_RHYTHM, REG_FOUR_OP, REG_NEW, REG_NOTE_SELECT,
};
use super::tables::{waveform, MULTIPLIER, TREMOLO_STEPS};
use super::{pan_gains, NATIVE_RATE};
use crate::backend::{ChipType, OplBackend};
use tracing::debug;

/// Where an operator takes its phase modulation from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modulation {
    /// No modulation
    None,
    /// The operator's own feedback
    Feedback,
    /// Output of another operator
    Slot(usize),
}

/// Role of a channel in the 4-op connection scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    TwoOp,
    /// Holds operators 1-2 and the frequency registers of a 4-op voice
    FourOpFirst,
    /// Holds operators 3-4 and the output of a 4-op voice
    FourOpSecond,
}

#[derive(Debug, Clone)]
struct Slot {
    envelope: Envelope,
    out: i32,
    prev_out: i32,
    feedback_mod: i32,
    modulation: Modulation,
    tremolo: bool,
    vibrato: bool,
    multiplier: u8,
    waveform: u8,
    phase: u32,
    phase_out: u16,
    channel: usize,
}

impl Slot {
    fn new(channel: usize) -> Self {
        Slot {
            envelope: Envelope::default(),
            out: 0,
            prev_out: 0,
            feedback_mod: 0,
            modulation: Modulation::None,
            tremolo: false,
            vibrato: false,
            multiplier: 0,
            waveform: 0,
            phase: 0,
            phase_out: 0,
            channel,
        }
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    fnum: u16,
    block: u8,
    ksv: u8,
    feedback: u8,
    connection: u8,
    kind: ChannelKind,
    outputs: [Option<usize>; 4],
    left: bool,
    right: bool,
    pan: (i32, i32),
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState {
            fnum: 0,
            block: 0,
            ksv: 0,
            feedback: 0,
            connection: 0,
            kind: ChannelKind::TwoOp,
            outputs: [None; 4],
            left: true,
            right: true,
            pan: (1 << 16, 1 << 16),
        }
    }
}

/// Bit-exact style integer YMF262 model
#[derive(Debug, Clone)]
pub struct Opl3 {
    slots: Vec<Slot>,
    channels: Vec<ChannelState>,
    regs: Box<[u8; 0x200]>,
    opl3_mode: bool,
    note_select: u8,
    timer: u32,
    envelope_timer: EnvelopeTimer,
    tremolo_pos: u8,
    tremolo: u8,
    tremolo_shift: u8,
    vibrato_pos: u8,
    vibrato_shift: u8,
    requested_rate: u32,
}

impl Default for Opl3 {
    fn default() -> Self {
        Self::new()
    }
}

impl Opl3 {
    /// Create a chip in its power-on state
    pub fn new() -> Self {
        let mut chip = Opl3 {
            slots: (0..NUM_SLOTS)
                .map(|s| Slot::new(slot_channel(s).0.index()))
                .collect(),
            channels: vec![ChannelState::default(); NUM_CHANNELS],
            regs: Box::new([0; 0x200]),
            opl3_mode: false,
            note_select: 0,
            timer: 0,
            envelope_timer: EnvelopeTimer::default(),
            tremolo_pos: 0,
            tremolo: 0,
            tremolo_shift: 4,
            vibrato_pos: 0,
            vibrato_shift: 1,
            requested_rate: NATIVE_RATE,
        };
        chip.reset();
        chip
    }

    /// Rate most recently requested through [`OplBackend::set_rate`]
    pub fn requested_rate(&self) -> u32 {
        self.requested_rate
    }

    fn channel_slots(ch: usize) -> [usize; 2] {
        Channel::new(ch).map_or([0, 0], |c| [c.slot(false), c.slot(true)])
    }

    fn pair_partner(&self, ch: usize) -> Option<usize> {
        let channel = Channel::new(ch)?;
        let pair = FourOpPair::containing(channel)?;
        match self.channels[ch].kind {
            ChannelKind::FourOpFirst => Some(pair.second().index()),
            ChannelKind::FourOpSecond => Some(pair.first().index()),
            ChannelKind::TwoOp => None,
        }
    }

    /// Recompute channel kinds from 0x104/0x105
    fn update_connections(&mut self) {
        let mask = self.regs[REG_FOUR_OP as usize];
        for ch in self.channels.iter_mut() {
            ch.kind = ChannelKind::TwoOp;
        }
        if self.opl3_mode {
            for i in 0..NUM_FOUR_OP_PAIRS {
                let Some(pair) = FourOpPair::new(i) else {
                    continue;
                };
                if mask & pair.connection_bit() != 0 {
                    self.channels[pair.first().index()].kind = ChannelKind::FourOpFirst;
                    self.channels[pair.second().index()].kind = ChannelKind::FourOpSecond;
                }
            }
        }
        for ch in 0..NUM_CHANNELS {
            self.update_routing(ch);
        }
    }

    /// Apply the 0xC0 register and the algorithm of a channel
    fn update_routing(&mut self, ch: usize) {
        let reg = self.regs[Channel::new(ch).map_or(0, |c| {
            c.register(ChannelRegister::FeedbackConnection) as usize
        })];
        {
            let state = &mut self.channels[ch];
            state.feedback = (reg & 0x0E) >> 1;
            state.connection = reg & 0x01;
            if self.opl3_mode {
                state.left = reg & 0x10 != 0;
                state.right = reg & 0x20 != 0;
            } else {
                state.left = true;
                state.right = true;
            }
        }

        match self.channels[ch].kind {
            ChannelKind::TwoOp => {
                let [s0, s1] = Self::channel_slots(ch);
                self.slots[s0].modulation = Modulation::Feedback;
                if self.channels[ch].connection == 0 {
                    self.slots[s1].modulation = Modulation::Slot(s0);
                    self.channels[ch].outputs = [Some(s1), None, None, None];
                } else {
                    self.slots[s1].modulation = Modulation::None;
                    self.channels[ch].outputs = [Some(s0), Some(s1), None, None];
                }
            }
            ChannelKind::FourOpFirst | ChannelKind::FourOpSecond => {
                let Some(partner) = self.pair_partner(ch) else {
                    return;
                };
                let (first, second) = if self.channels[ch].kind == ChannelKind::FourOpFirst {
                    (ch, partner)
                } else {
                    (partner, ch)
                };
                self.setup_four_op(first, second);
            }
        }
    }

    fn setup_four_op(&mut self, first: usize, second: usize) {
        let [a0, a1] = Self::channel_slots(first);
        let [b0, b1] = Self::channel_slots(second);
        let algorithm = (self.channels[first].connection << 1) | self.channels[second].connection;

        self.slots[a0].modulation = Modulation::Feedback;
        self.channels[first].outputs = [None; 4];
        let (outputs, mods) = match algorithm {
            // FM-FM: 1 -> 2 -> 3 -> 4
            0 => (
                [Some(b1), None, None, None],
                [Modulation::Slot(a0), Modulation::Slot(a1), Modulation::Slot(b0)],
            ),
            // FM-AM: (1 -> 2) + (3 -> 4)
            1 => (
                [Some(a1), Some(b1), None, None],
                [Modulation::Slot(a0), Modulation::None, Modulation::Slot(b0)],
            ),
            // AM-FM: 1 + (2 -> 3 -> 4)
            2 => (
                [Some(a0), Some(b1), None, None],
                [Modulation::None, Modulation::Slot(a1), Modulation::Slot(b0)],
            ),
            // AM-AM: 1 + (2 -> 3) + 4
            _ => (
                [Some(a0), Some(b0), Some(b1), None],
                [Modulation::None, Modulation::Slot(a1), Modulation::None],
            ),
        };
        self.slots[a1].modulation = mods[0];
        self.slots[b0].modulation = mods[1];
        self.slots[b1].modulation = mods[2];
        self.channels[second].outputs = outputs;
    }

    /// Store a new channel frequency and propagate it to a joined pair
    fn update_frequency(&mut self, ch: usize, fnum: u16, block: u8) {
        let mut targets = vec![ch];
        if self.channels[ch].kind == ChannelKind::FourOpFirst {
            if let Some(partner) = self.pair_partner(ch) {
                targets.push(partner);
            }
        }
        let nts = (self.note_select >> 6) & 0x01;
        for target in targets {
            let state = &mut self.channels[target];
            state.fnum = fnum;
            state.block = block;
            state.ksv = (block << 1) | ((fnum >> (9 - nts)) & 0x01) as u8;
            for slot in Self::channel_slots(target) {
                self.slots[slot].envelope.update_ksl(fnum, block);
            }
        }
    }

    fn set_key(&mut self, ch: usize, on: bool) {
        let mut targets = vec![ch];
        if self.channels[ch].kind == ChannelKind::FourOpFirst {
            if let Some(partner) = self.pair_partner(ch) {
                targets.push(partner);
            }
        }
        for target in targets {
            for slot in Self::channel_slots(target) {
                self.slots[slot].envelope.set_key(on);
            }
        }
    }

    fn write_operator(&mut self, reg: OperatorRegister, slot: usize, data: u8) {
        let opl3_mode = self.opl3_mode;
        let (fnum, block) = {
            let ch = &self.channels[self.slots[slot].channel];
            (ch.fnum, ch.block)
        };
        let s = &mut self.slots[slot];
        match reg {
            OperatorRegister::Characteristic => {
                let flags = Characteristic::from_bits_truncate(data);
                s.tremolo = flags.contains(Characteristic::TREMOLO);
                s.vibrato = flags.contains(Characteristic::VIBRATO);
                s.envelope.sustaining = flags.contains(Characteristic::SUSTAINING);
                s.envelope.ksr = flags.contains(Characteristic::KSR);
                s.multiplier = data & 0x0F;
            }
            OperatorRegister::ScaleLevel => {
                s.envelope.ksl = (data >> 6) & 0x03;
                s.envelope.total_level = data & 0x3F;
                s.envelope.update_ksl(fnum, block);
            }
            OperatorRegister::AttackDecay => {
                s.envelope.attack = data >> 4;
                s.envelope.decay = data & 0x0F;
            }
            OperatorRegister::SustainRelease => {
                s.envelope.set_sustain(data >> 4);
                s.envelope.release = data & 0x0F;
            }
            OperatorRegister::Waveform => {
                s.waveform = if opl3_mode { data & 0x07 } else { data & 0x03 };
            }
        }
    }

    fn write_channel(&mut self, reg: ChannelRegister, channel: Channel, data: u8) {
        let ch = channel.index();
        match reg {
            ChannelRegister::FnumLow | ChannelRegister::KeyBlockFnum => {
                if self.channels[ch].kind == ChannelKind::FourOpSecond {
                    return;
                }
                let lo = self.regs[channel.register(ChannelRegister::FnumLow) as usize];
                let hi = self.regs[channel.register(ChannelRegister::KeyBlockFnum) as usize];
                let fnum = (u16::from(hi & 0x03) << 8) | u16::from(lo);
                self.update_frequency(ch, fnum, (hi >> 2) & 0x07);
                if reg == ChannelRegister::KeyBlockFnum {
                    self.set_key(ch, data & KEY_ON != 0);
                }
            }
            ChannelRegister::FeedbackConnection => {
                self.update_routing(ch);
                if let Some(partner) = self.pair_partner(ch) {
                    self.update_routing(partner);
                }
            }
        }
    }

    fn process_slot(&mut self, index: usize) {
        let ch = self.slots[index].channel;
        let (fnum, block, ksv, feedback) = {
            let c = &self.channels[ch];
            (c.fnum, c.block, c.ksv, c.feedback)
        };

        // Feedback from the previous two outputs
        let slot = &mut self.slots[index];
        slot.feedback_mod = if feedback != 0 {
            (slot.prev_out + slot.out) >> (9 - feedback)
        } else {
            0
        };
        slot.prev_out = slot.out;

        let tremolo = if slot.tremolo { self.tremolo } else { 0 };
        let phase_reset = slot.envelope.tick(ksv, tremolo, &self.envelope_timer);

        // Phase generator
        let mut f = i32::from(fnum);
        if slot.vibrato {
            let mut range = (i32::from(fnum) >> 7) & 7;
            let pos = self.vibrato_pos;
            if pos & 3 == 0 {
                range = 0;
            } else if pos & 1 != 0 {
                range >>= 1;
            }
            range >>= self.vibrato_shift;
            if pos & 4 != 0 {
                range = -range;
            }
            f += range;
        }
        let base = ((f.max(0) as u32) << block) >> 1;
        let phase_out = (slot.phase >> 9) as u16;
        if phase_reset {
            slot.phase = 0;
        }
        slot.phase = slot
            .phase
            .wrapping_add((base * MULTIPLIER[usize::from(slot.multiplier)]) >> 1);
        slot.phase_out = phase_out;

        let (source, feedback_mod) = (slot.modulation, slot.feedback_mod);
        let modulation = match source {
            Modulation::None => 0,
            Modulation::Feedback => feedback_mod,
            Modulation::Slot(other) => self.slots[other].out,
        };
        let slot = &mut self.slots[index];
        let phase = (i32::from(slot.phase_out) + modulation) as u16;
        slot.out = waveform(slot.waveform, phase, slot.envelope.out);
    }

    fn advance_lfo(&mut self) {
        if self.timer & 0x3F == 0x3F {
            self.tremolo_pos = (self.tremolo_pos + 1) % TREMOLO_STEPS;
        }
        let half = TREMOLO_STEPS / 2;
        self.tremolo = if self.tremolo_pos < half {
            self.tremolo_pos >> self.tremolo_shift
        } else {
            (TREMOLO_STEPS - self.tremolo_pos) >> self.tremolo_shift
        };
        if self.timer & 0x3FF == 0x3FF {
            self.vibrato_pos = (self.vibrato_pos + 1) & 7;
        }
        self.timer = self.timer.wrapping_add(1);
        self.envelope_timer.advance();
    }

    fn mix(&self) -> [i16; 2] {
        let mut left = 0i64;
        let mut right = 0i64;
        for ch in &self.channels {
            let accm: i64 = ch
                .outputs
                .iter()
                .flatten()
                .map(|&s| i64::from(self.slots[s].out))
                .sum();
            if ch.left {
                left += (accm * i64::from(ch.pan.0)) >> 16;
            }
            if ch.right {
                right += (accm * i64::from(ch.pan.1)) >> 16;
            }
        }
        [clip(left), clip(right)]
    }
}

fn clip(sample: i64) -> i16 {
    sample.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
}

impl OplBackend for Opl3 {
    fn set_rate(&mut self, sample_rate: u32) {
        // The model always runs at the native rate; the pipeline converts
        self.requested_rate = sample_rate;
    }

    fn can_run_at_pcm_rate(&self) -> bool {
        false
    }

    fn native_rate(&self) -> u32 {
        NATIVE_RATE
    }

    fn reset(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            *slot = Slot::new(slot_channel(i).0.index());
        }
        for ch in self.channels.iter_mut() {
            *ch = ChannelState::default();
        }
        self.regs.fill(0);
        self.opl3_mode = false;
        self.note_select = 0;
        self.timer = 0;
        self.envelope_timer = EnvelopeTimer::default();
        self.tremolo_pos = 0;
        self.tremolo = 0;
        self.tremolo_shift = 4;
        self.vibrato_pos = 0;
        self.vibrato_shift = 1;
        for ch in 0..NUM_CHANNELS {
            self.update_routing(ch);
        }
    }

    fn write_reg(&mut self, address: u16, data: u8) {
        let address = address & 0x1FF;
        self.regs[address as usize] = data;

        if let Some((reg, slot)) = decode_operator_address(address) {
            self.write_operator(reg, slot, data);
            return;
        }
        if let Some((reg, channel)) = decode_channel_address(address) {
            self.write_channel(reg, channel, data);
            return;
        }
        match address {
            REG_NEW => {
                let mode = data & 0x01 != 0;
                if mode != self.opl3_mode {
                    debug!(opl3 = mode, "Accurate core mode change");
                }
                self.opl3_mode = mode;
                self.update_connections();
            }
            REG_FOUR_OP => self.update_connections(),
            REG_NOTE_SELECT => self.note_select = data,
            REG_DEPTH_RHYTHM => {
                self.tremolo_shift = (u8::from(data & DEEP_TREMOLO == 0) << 1) + 2;
                self.vibrato_shift = u8::from(data & DEEP_VIBRATO == 0);
            }
            _ => {}
        }
    }

    fn write_pan(&mut self, channel: u16, pan: u8) {
        if let Some(ch) = self.channels.get_mut(usize::from(channel)) {
            ch.pan = pan_gains(pan);
        }
    }

    fn native_generate(&mut self, frame: &mut [i16; 2]) {
        for slot in 0..NUM_SLOTS {
            self.process_slot(slot);
        }
        *frame = self.mix();
        self.advance_lfo();
    }

    fn emulator_name(&self) -> &'static str {
        "Accurate YMF262 model"
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

    /// Simple 2-op FM tone on channel `ch`
    fn key_tone(chip: &mut Opl3, ch: usize) {
        let channel = Channel::new(ch).unwrap();
        for second in [false, true] {
            chip.write_reg(
                channel.operator_register(second, OperatorRegister::Characteristic),
                0x21,
            );
            chip.write_reg(
                channel.operator_register(second, OperatorRegister::ScaleLevel),
                if second { 0x00 } else { 0x10 },
            );
            chip.write_reg(
                channel.operator_register(second, OperatorRegister::AttackDecay),
                0xF0,
            );
            chip.write_reg(
                channel.operator_register(second, OperatorRegister::SustainRelease),
                0x07,
            );
        }
        chip.write_reg(channel.register(ChannelRegister::FeedbackConnection), 0x30);
        chip.write_reg(channel.register(ChannelRegister::FnumLow), 0x44);
        chip.write_reg(channel.register(ChannelRegister::KeyBlockFnum), 0x32);
    }

    fn render(chip: &mut Opl3, frames: usize) -> Vec<[i16; 2]> {
        let mut out = Vec::with_capacity(frames);
        let mut frame = [0i16; 2];
        for _ in 0..frames {
            chip.native_generate(&mut frame);
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_reset_chip_is_silent() {
        let mut chip = Opl3::new();
        let frames = render(&mut chip, 1000);
        assert!(frames.iter().all(|f| f[0].abs() <= 1 && f[1].abs() <= 1));
    }

    #[test]
    fn test_keyed_channel_produces_sound() {
        let mut chip = Opl3::new();
        chip.write_reg(REG_NEW, 0x01);
        key_tone(&mut chip, 0);
        let frames = render(&mut chip, 2000);
        let peak = frames.iter().map(|f| f[0].unsigned_abs()).max().unwrap_or(0);
        assert!(peak > 1000, "Expected audible output, peak was {peak}");
    }

    #[test]
    fn test_generation_is_deterministic() {
        let run = || {
            let mut chip = Opl3::new();
            chip.write_reg(REG_NEW, 0x01);
            key_tone(&mut chip, 3);
            render(&mut chip, 4000)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_output_bits_route_channels() {
        let mut chip = Opl3::new();
        chip.write_reg(REG_NEW, 0x01);
        key_tone(&mut chip, 1);
        let channel = Channel::new(1).unwrap();
        chip.write_reg(channel.register(ChannelRegister::FeedbackConnection), 0x10);
        let frames = render(&mut chip, 2000);
        assert!(frames.iter().any(|f| f[0] != 0));
        assert!(frames.iter().all(|f| f[1] == 0), "right output is disabled");
    }

    #[test]
    fn test_key_off_releases() {
        let mut chip = Opl3::new();
        chip.write_reg(REG_NEW, 0x01);
        key_tone(&mut chip, 0);
        render(&mut chip, 2000);
        let channel = Channel::new(0).unwrap();
        chip.write_reg(channel.register(ChannelRegister::KeyBlockFnum), 0x12);
        let tail = render(&mut chip, 49_716);
        let last = &tail[tail.len() - 100..];
        assert!(last.iter().all(|f| f[0].abs() <= 1), "release must decay to silence");
    }

    #[test]
    fn test_four_op_second_channel_ignores_frequency() {
        let mut chip = Opl3::new();
        chip.write_reg(REG_NEW, 0x01);
        chip.write_reg(REG_FOUR_OP, 0x01);
        let second = Channel::new(3).unwrap();
        chip.write_reg(second.register(ChannelRegister::FnumLow), 0xFF);
        assert_eq!(chip.channels[3].fnum, 0);

        let first = Channel::new(0).unwrap();
        chip.write_reg(first.register(ChannelRegister::FnumLow), 0x80);
        chip.write_reg(first.register(ChannelRegister::KeyBlockFnum), 0x31);
        assert_eq!(chip.channels[3].fnum, 0x180, "pair inherits the frequency");
        assert!(chip.slots[Channel::new(3).unwrap().slot(true)].envelope.key);
    }

    #[test]
    fn test_characteristic_flags_decode() {
        let mut chip = Opl3::new();
        let slot = Channel::new(4).unwrap().slot(true);
        chip.write_reg(
            Channel::new(4).unwrap().operator_register(true, OperatorRegister::Characteristic),
            0xB3,
        );
        let s = &chip.slots[slot];
        assert!(s.tremolo);
        assert!(!s.vibrato);
        assert!(s.envelope.sustaining);
        assert!(s.envelope.ksr);
        assert_eq!(s.multiplier, 3);
    }

    #[test]
    fn test_register_readback() {
        let mut chip = Opl3::new();
        chip.write_reg(0x1A3, 0x5A);
        assert_eq!(chip.read_register(0x1A3), Some(0x5A));
        chip.reset();
        assert_eq!(chip.read_register(0x1A3), Some(0));
    }

    #[test]
    fn test_rate_capabilities() {
        let mut chip = Opl3::new();
        chip.set_rate(44_100);
        assert!(!chip.can_run_at_pcm_rate());
        assert_eq!(chip.native_rate(), NATIVE_RATE);
        assert_eq!(chip.requested_rate(), 44_100);
    }
}
