//! Patch compiler
//!
//! Turns an [`Instrument`] into the ordered register writes that configure
//! one voice slot. Compilation is a pure function of the instrument, the
//! target slot and the chip mode: compiling twice yields byte-identical
//! sequences, so the editor can re-push the whole patch on every edit.

use crate::instrument::{Instrument, OperatorSlot};
use crate::opl3::registers::{
    operator_write, pack_feedback_connection, pack_frequency, Channel, ChannelOutput,
    ChannelRegister, ChipMode, FourOpPair, OperatorRegister, RegisterWrite, DEEP_TREMOLO,
    DEEP_VIBRATO, REG_DEPTH_RHYTHM, REG_FOUR_OP, REG_NEW, REG_NOTE_SELECT, REG_WAVE_SELECT,
    WAVE_SELECT_ENABLE,
};
use crate::opl3::NATIVE_RATE;

/// Reference pitch of MIDI note 69
const A4_HZ: f64 = 440.0;
const A4_NOTE: f64 = 69.0;

/// How an instrument occupies the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceLayout {
    /// One 2-op channel
    TwoOp,
    /// One joined 4-op channel pair
    FourOp,
    /// Two independent 2-op channels
    Pseudo,
}

/// Chip channels assigned to one sounding voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceSlot {
    /// A single 2-op channel
    TwoOp {
        /// The channel
        channel: Channel,
    },
    /// A 4-op channel pair
    FourOp {
        /// The pair
        pair: FourOpPair,
    },
    /// Two channels playing the two halves of a pseudo-4-op instrument
    Pseudo {
        /// Channel of the first voice (Modulator1/Carrier1)
        first: Channel,
        /// Channel of the second voice (Modulator2/Carrier2)
        second: Channel,
    },
}

impl VoiceSlot {
    /// Every channel this slot occupies
    pub fn channels(&self) -> Vec<Channel> {
        match *self {
            VoiceSlot::TwoOp { channel } => vec![channel],
            VoiceSlot::FourOp { pair } => vec![pair.first(), pair.second()],
            VoiceSlot::Pseudo { first, second } => vec![first, second],
        }
    }

    /// Channels whose frequency/key register drives the slot
    pub fn key_channels(&self) -> Vec<Channel> {
        match *self {
            VoiceSlot::TwoOp { channel } => vec![channel],
            VoiceSlot::FourOp { pair } => vec![pair.first()],
            VoiceSlot::Pseudo { first, second } => vec![first, second],
        }
    }

    /// Reduce the slot to what the layout actually uses
    fn narrowed(self, layout: VoiceLayout) -> Self {
        match (self, layout) {
            (VoiceSlot::FourOp { pair }, VoiceLayout::TwoOp | VoiceLayout::Pseudo) => {
                VoiceSlot::TwoOp {
                    channel: pair.first(),
                }
            }
            (VoiceSlot::Pseudo { first, .. }, VoiceLayout::TwoOp | VoiceLayout::FourOp) => {
                VoiceSlot::TwoOp { channel: first }
            }
            (slot, _) => slot,
        }
    }
}

/// Convert a (possibly fractional) MIDI note to an F-number and block
///
/// The smallest block whose F-number fits in 10 bits is chosen, which gives
/// the finest frequency resolution.
pub fn note_to_fnum(note: f64) -> (u16, u8) {
    let hz = A4_HZ * ((note - A4_NOTE) / 12.0).exp2();
    for block in 0u8..8 {
        let fnum = (hz * f64::from(1u32 << (20 - u32::from(block))) / f64::from(NATIVE_RATE))
            .round();
        if fnum < 1024.0 {
            return (fnum.max(0.0) as u16, block);
        }
    }
    (1023, 7)
}

/// Compiles instruments into register writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchCompiler {
    mode: ChipMode,
    deep_tremolo: bool,
    deep_vibrato: bool,
}

impl Default for PatchCompiler {
    fn default() -> Self {
        Self::new(ChipMode::Opl3)
    }
}

impl PatchCompiler {
    /// Create a compiler for the given chip mode
    pub fn new(mode: ChipMode) -> Self {
        PatchCompiler {
            mode,
            deep_tremolo: false,
            deep_vibrato: false,
        }
    }

    /// Use the deep tremolo/vibrato LFO settings
    pub fn with_depth(mut self, deep_tremolo: bool, deep_vibrato: bool) -> Self {
        self.deep_tremolo = deep_tremolo;
        self.deep_vibrato = deep_vibrato;
        self
    }

    /// Chip mode compiled for
    pub fn mode(&self) -> ChipMode {
        self.mode
    }

    /// Layout an instrument takes in this chip mode
    ///
    /// In OPL2 mode true 4-op instruments fall back to their first pair.
    pub fn layout(&self, inst: &Instrument) -> VoiceLayout {
        if inst.is_pseudo_four_op() {
            VoiceLayout::Pseudo
        } else if inst.is_true_four_op() && self.mode.supports_four_op() {
            VoiceLayout::FourOp
        } else {
            VoiceLayout::TwoOp
        }
    }

    /// Value of the 4-op connection register for an instrument
    pub fn four_op_mask(&self, inst: &Instrument) -> u8 {
        if self.layout(inst) == VoiceLayout::FourOp {
            0x3F
        } else {
            0
        }
    }

    /// Chip-wide setup written ahead of any voice
    pub fn global_writes(&self, four_op_mask: u8) -> Vec<RegisterWrite> {
        let opl3 = self.mode == ChipMode::Opl3;
        let mut depth = 0u8;
        if self.deep_tremolo {
            depth |= DEEP_TREMOLO;
        }
        if self.deep_vibrato {
            depth |= DEEP_VIBRATO;
        }
        vec![
            RegisterWrite::new(REG_NEW, u8::from(opl3)),
            RegisterWrite::new(REG_FOUR_OP, if opl3 { four_op_mask & 0x3F } else { 0 }),
            RegisterWrite::new(REG_WAVE_SELECT, WAVE_SELECT_ENABLE),
            RegisterWrite::new(REG_DEPTH_RHYTHM, depth),
            RegisterWrite::new(REG_NOTE_SELECT, 0),
        ]
    }

    /// Register writes configuring `slot` for `inst`
    ///
    /// Frequency and key-on registers are not touched; see
    /// [`frequency_writes`](Self::frequency_writes).
    pub fn compile(&self, inst: &Instrument, slot: VoiceSlot) -> Vec<RegisterWrite> {
        let mut writes = Vec::with_capacity(24);
        match slot.narrowed(self.layout(inst)) {
            VoiceSlot::TwoOp { channel } => {
                self.emit_pair(&mut writes, inst, channel, false);
            }
            VoiceSlot::FourOp { pair } => {
                self.emit_pair(&mut writes, inst, pair.first(), false);
                self.emit_pair(&mut writes, inst, pair.second(), true);
            }
            VoiceSlot::Pseudo { first, second } => {
                self.emit_pair(&mut writes, inst, first, false);
                self.emit_pair(&mut writes, inst, second, true);
            }
        }
        writes
    }

    /// Operator and connection writes for one operator pair on one channel
    fn emit_pair(
        &self,
        writes: &mut Vec<RegisterWrite>,
        inst: &Instrument,
        channel: Channel,
        second_pair: bool,
    ) {
        let base = usize::from(second_pair) * 2;
        for second_op in [false, true] {
            let Some(slot) = OperatorSlot::from_index(base + usize::from(second_op)) else {
                continue;
            };
            let op = inst.op(slot);
            for reg in OperatorRegister::ALL {
                writes.push(operator_write(channel, second_op, reg, op, self.mode));
            }
        }
        let (feedback, connection) = if second_pair {
            (inst.feedback2, inst.connection2)
        } else {
            (inst.feedback1, inst.connection1)
        };
        writes.push(RegisterWrite::new(
            channel.register(ChannelRegister::FeedbackConnection),
            pack_feedback_connection(
                feedback,
                connection.bit(),
                ChannelOutput::LEFT | ChannelOutput::RIGHT,
            ),
        ));
    }

    /// Pitch of each key channel for `note`, in (fractional) MIDI notes
    ///
    /// The second pseudo-4-op voice is placed relative to the sounding note,
    /// shifted by its own note offset and the fine-tune detune.
    pub fn voice_pitches(&self, inst: &Instrument, slot: VoiceSlot, note: u8) -> Vec<(Channel, f64)> {
        let base = f64::from(note);
        let first = base + f64::from(inst.note_offset1);
        match slot.narrowed(self.layout(inst)) {
            VoiceSlot::TwoOp { channel } => vec![(channel, first)],
            VoiceSlot::FourOp { pair } => vec![(pair.first(), first)],
            VoiceSlot::Pseudo {
                first: a,
                second: b,
            } => {
                let second = base + f64::from(inst.note_offset2) + inst.second_voice_detune();
                vec![(a, first), (b, second)]
            }
        }
    }

    /// Frequency and key register writes playing `note` on `slot`
    ///
    /// With `key_on == false` the same frequency is written with the key bit
    /// cleared, so the release keeps its pitch.
    pub fn frequency_writes(
        &self,
        inst: &Instrument,
        slot: VoiceSlot,
        note: u8,
        key_on: bool,
    ) -> Vec<RegisterWrite> {
        let mut writes = Vec::with_capacity(4);
        for (channel, pitch) in self.voice_pitches(inst, slot, note) {
            let (fnum, block) = note_to_fnum(pitch);
            let (lo, hi) = pack_frequency(fnum, block, key_on);
            writes.push(RegisterWrite::new(channel.register(ChannelRegister::FnumLow), lo));
            writes.push(RegisterWrite::new(
                channel.register(ChannelRegister::KeyBlockFnum),
                hi,
            ));
        }
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Connection;
    use crate::opl3::registers::{decode_channel_address, decode_operator_address, slot_channel};

    fn ch(i: usize) -> Channel {
        Channel::new(i).unwrap()
    }

    /// Channels touched by a write sequence
    fn touched(writes: &[RegisterWrite]) -> Vec<usize> {
        let mut out: Vec<usize> = writes
            .iter()
            .filter_map(|w| {
                decode_operator_address(w.address)
                    .map(|(_, slot)| slot_channel(slot).0.index())
                    .or_else(|| decode_channel_address(w.address).map(|(_, c)| c.index()))
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    #[test]
    fn test_compile_is_idempotent() {
        let mut inst = Instrument::new("Lead");
        inst.four_op = true;
        inst.feedback2 = 3;
        let compiler = PatchCompiler::default();
        let slot = VoiceSlot::FourOp {
            pair: FourOpPair::new(1).unwrap(),
        };
        assert_eq!(compiler.compile(&inst, slot), compiler.compile(&inst, slot));
    }

    #[test]
    fn test_two_op_writes_stay_on_one_channel() {
        let mut inst = Instrument::default();
        inst.op_mut(OperatorSlot::Modulator2).attack = 3;
        let compiler = PatchCompiler::default();
        let writes = compiler.compile(&inst, VoiceSlot::TwoOp { channel: ch(0) });
        assert_eq!(touched(&writes), vec![0]);
        assert_eq!(writes.len(), 11, "2 operators x 5 registers + C0");

        // Even a 4-op slot request stays on pair 1 when the flag is clear
        let writes = compiler.compile(
            &inst,
            VoiceSlot::FourOp {
                pair: FourOpPair::new(0).unwrap(),
            },
        );
        assert_eq!(touched(&writes), vec![0]);
    }

    #[test]
    fn test_four_op_writes_both_channels() {
        let mut inst = Instrument::default();
        inst.four_op = true;
        inst.connection2 = Connection::AM;
        inst.feedback2 = 9;
        let compiler = PatchCompiler::default();
        let pair = FourOpPair::new(3).unwrap();
        let writes = compiler.compile(&inst, VoiceSlot::FourOp { pair });
        assert_eq!(touched(&writes), vec![9, 12]);

        let c0 = writes
            .iter()
            .find(|w| w.address == ch(12).register(ChannelRegister::FeedbackConnection))
            .expect("C0 of the second channel");
        assert_eq!(c0.value, 0x30 | (7 << 1) | 1, "feedback is clamped to 7");
    }

    #[test]
    fn test_opl2_mode_drops_four_op() {
        let mut inst = Instrument::default();
        inst.four_op = true;
        let compiler = PatchCompiler::new(ChipMode::Opl2);
        assert_eq!(compiler.layout(&inst), VoiceLayout::TwoOp);
        assert_eq!(compiler.four_op_mask(&inst), 0);
        let globals = compiler.global_writes(0x3F);
        assert!(globals.contains(&RegisterWrite::new(REG_NEW, 0)));
        assert!(globals.contains(&RegisterWrite::new(REG_FOUR_OP, 0)));
    }

    #[test]
    fn test_pseudo_voices_use_both_pairs() {
        let mut inst = Instrument::default();
        inst.four_op = true;
        inst.pseudo_four_op = true;
        inst.op_mut(OperatorSlot::Carrier2).level = 20;
        let compiler = PatchCompiler::default();
        let slot = VoiceSlot::Pseudo {
            first: ch(0),
            second: ch(1),
        };
        let writes = compiler.compile(&inst, slot);
        let level_of = |channel: Channel| {
            writes
                .iter()
                .find(|w| w.address == channel.operator_register(true, OperatorRegister::ScaleLevel))
                .map(|w| w.value & 0x3F)
        };
        assert_eq!(level_of(ch(0)), Some(0));
        assert_eq!(level_of(ch(1)), Some(20));
    }

    #[test]
    fn test_note_to_fnum() {
        let (fnum, block) = note_to_fnum(69.0);
        assert_eq!(block, 4);
        assert_eq!(fnum, 580);

        let (_, low_block) = note_to_fnum(24.0);
        assert!(low_block < block);

        assert_eq!(note_to_fnum(200.0), (1023, 7));
    }

    #[test]
    fn test_second_voice_follows_sounding_note() {
        let mut inst = Instrument::default();
        inst.four_op = true;
        inst.pseudo_four_op = true;
        inst.note_offset2 = 12;
        let compiler = PatchCompiler::default();
        let slot = VoiceSlot::Pseudo {
            first: ch(2),
            second: ch(3),
        };
        for note in [48u8, 60, 72] {
            let pitches = compiler.voice_pitches(&inst, slot, note);
            assert_eq!(pitches[0], (ch(2), f64::from(note)));
            assert_eq!(pitches[1], (ch(3), f64::from(note) + 12.0));
        }
    }

    #[test]
    fn test_key_off_keeps_frequency() {
        let inst = Instrument::default();
        let compiler = PatchCompiler::default();
        let slot = VoiceSlot::TwoOp { channel: ch(5) };
        let on = compiler.frequency_writes(&inst, slot, 60, true);
        let off = compiler.frequency_writes(&inst, slot, 60, false);
        assert_eq!(on[0], off[0]);
        assert_eq!(on[1].value & !0x20, off[1].value);
        assert_ne!(on[1].value & 0x20, 0);
    }
}
