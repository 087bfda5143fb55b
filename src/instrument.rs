//! FM instrument data model
//!
//! An [`Instrument`] is a plain value owned by the editor. It is copied into
//! the preview core on every push; nothing in this crate keeps a mutable alias
//! into the editor's storage. Field values use the chip's native bit widths and
//! are clamped when they are packed into registers, never rejected.

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Maximum length of an instrument display name in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Number of operator descriptors carried by every instrument
pub const NUM_OPERATORS: usize = 4;

/// Positional role of an operator descriptor inside an [`Instrument`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum OperatorSlot {
    /// First modulator (pair 1)
    Modulator1 = 0,
    /// First carrier (pair 1)
    Carrier1 = 1,
    /// Second modulator (pair 2, 4-op only)
    Modulator2 = 2,
    /// Second carrier (pair 2, 4-op only)
    Carrier2 = 3,
}

impl OperatorSlot {
    /// All slots in positional order
    pub const ALL: [OperatorSlot; NUM_OPERATORS] = [
        OperatorSlot::Modulator1,
        OperatorSlot::Carrier1,
        OperatorSlot::Modulator2,
        OperatorSlot::Carrier2,
    ];

    /// Index into [`Instrument::operators`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Slot at a positional index
    pub fn from_index(index: usize) -> Option<Self> {
        <Self as num_traits::FromPrimitive>::from_usize(index)
    }

    /// Whether this slot belongs to operator pair 2
    pub fn is_second_pair(self) -> bool {
        matches!(self, OperatorSlot::Modulator2 | OperatorSlot::Carrier2)
    }

    /// Whether this slot is the carrier of its pair
    pub fn is_carrier(self) -> bool {
        matches!(self, OperatorSlot::Carrier1 | OperatorSlot::Carrier2)
    }
}

/// How a pair's carrier combines with its modulator
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
pub enum Connection {
    /// Modulator frequency-modulates the carrier (register bit CNT = 0)
    #[default]
    FM = 0,
    /// Modulator and carrier are summed (register bit CNT = 1)
    AM = 1,
}

impl Connection {
    /// Register bit value for the connection
    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// One envelope-and-oscillator unit
///
/// All numeric fields are in the chip's native encoding:
/// `attack`/`decay`/`release` are rates (0 = slowest), `sustain` is the
/// sustain attenuation (0 = loudest) and `level` is the total attenuation
/// in 0.75 dB steps (0 = loudest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Operator {
    /// Attack rate (4 bits)
    pub attack: u8,
    /// Decay rate (4 bits)
    pub decay: u8,
    /// Sustain level (4 bits)
    pub sustain: u8,
    /// Release rate (4 bits)
    pub release: u8,
    /// Waveform select (3 bits in OPL3 mode, 2 bits in OPL2 mode)
    pub waveform: u8,
    /// Frequency multiplier (4 bits)
    pub multiplier: u8,
    /// Output level attenuation (6 bits)
    pub level: u8,
    /// Key-scale level (2 bits)
    pub ksl: u8,
    /// Vibrato enable
    pub vibrato: bool,
    /// Amplitude modulation (tremolo) enable
    pub tremolo: bool,
    /// Sustaining envelope (hold at sustain level until key-off)
    pub sustaining: bool,
    /// Key-scale rate enable
    pub ksr: bool,
}

/// A playable FM sound
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Instrument {
    name: String,
    /// Operators addressed positionally by [`OperatorSlot`]
    pub operators: [Operator; NUM_OPERATORS],
    /// Connection of pair 1
    pub connection1: Connection,
    /// Connection of pair 2 (4-op only)
    pub connection2: Connection,
    /// Feedback of pair 1 (3 bits)
    pub feedback1: u8,
    /// Feedback of pair 2 (3 bits, 4-op only)
    pub feedback2: u8,
    /// Use all four operators
    pub four_op: bool,
    /// Realize the 4-op voice as two detuned 2-op voices
    pub pseudo_four_op: bool,
    /// Detune of the second pseudo-4-op voice
    pub fine_tune: i8,
    /// Note offset of the first voice in semitones
    pub note_offset1: i16,
    /// Note offset of the second pseudo-4-op voice in semitones
    pub note_offset2: i16,
    /// Fixed key used when the instrument plays as percussion
    pub perc_note_num: u8,
}

impl Default for Instrument {
    fn default() -> Self {
        let modulator = Operator {
            attack: 15,
            decay: 1,
            sustain: 5,
            release: 7,
            multiplier: 1,
            level: 30,
            sustaining: true,
            ..Operator::default()
        };
        let carrier = Operator {
            attack: 15,
            decay: 2,
            sustain: 3,
            release: 5,
            multiplier: 1,
            level: 0,
            sustaining: true,
            ..Operator::default()
        };
        Instrument {
            name: String::new(),
            operators: [modulator, carrier, modulator, carrier],
            connection1: Connection::FM,
            connection2: Connection::FM,
            feedback1: 4,
            feedback2: 0,
            four_op: false,
            pseudo_four_op: false,
            fine_tune: 0,
            note_offset1: 0,
            note_offset2: 0,
            perc_note_num: 60,
        }
    }
}

impl Instrument {
    /// Create a default two-operator instrument with the given name
    pub fn new(name: &str) -> Self {
        let mut inst = Self::default();
        inst.set_name(name);
        inst
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the display name, truncated to [`MAX_NAME_LEN`] bytes on a char boundary
    pub fn set_name(&mut self, name: &str) {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name = name[..end].to_string();
    }

    /// Operator in the given position
    pub fn op(&self, slot: OperatorSlot) -> &Operator {
        &self.operators[slot.index()]
    }

    /// Mutable operator in the given position
    pub fn op_mut(&mut self, slot: OperatorSlot) -> &mut Operator {
        &mut self.operators[slot.index()]
    }

    /// Whether the instrument is realized as two 2-op voices
    ///
    /// The double-voice flag only takes effect together with the 4-op flag.
    pub fn is_pseudo_four_op(&self) -> bool {
        self.four_op && self.pseudo_four_op
    }

    /// Whether the instrument occupies a true 4-op channel pair
    pub fn is_true_four_op(&self) -> bool {
        self.four_op && !self.pseudo_four_op
    }

    /// Detune of the second pseudo-4-op voice in semitones
    pub fn second_voice_detune(&self) -> f64 {
        match self.fine_tune {
            0 => 0.0,
            1 => 0.000_025,
            -1 => -0.000_025,
            ft => f64::from(ft) * 15.625 / 1000.0,
        }
    }

    /// Load an instrument from its JSON representation
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        let mut inst: Instrument = serde_json::from_str(json)?;
        let name = std::mem::take(&mut inst.name);
        inst.set_name(&name);
        Ok(inst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_bounded() {
        let mut inst = Instrument::default();
        inst.set_name(&"x".repeat(100));
        assert_eq!(inst.name().len(), MAX_NAME_LEN);

        // Multi-byte characters must not be split
        inst.set_name(&"é".repeat(40));
        assert!(inst.name().len() <= MAX_NAME_LEN);
        assert!(inst.name().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_pseudo_requires_four_op() {
        let mut inst = Instrument::default();
        inst.pseudo_four_op = true;
        assert!(!inst.is_pseudo_four_op(), "Double voice needs the 4-op flag");

        inst.four_op = true;
        assert!(inst.is_pseudo_four_op());
        assert!(!inst.is_true_four_op());
    }

    #[test]
    fn test_second_voice_detune() {
        let mut inst = Instrument::default();
        assert_eq!(inst.second_voice_detune(), 0.0);

        inst.fine_tune = 1;
        assert!(inst.second_voice_detune() > 0.0 && inst.second_voice_detune() < 0.001);

        inst.fine_tune = 64;
        assert!((inst.second_voice_detune() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_operator_slot_roles() {
        assert!(!OperatorSlot::Modulator1.is_second_pair());
        assert!(OperatorSlot::Carrier2.is_second_pair());
        assert!(OperatorSlot::Carrier1.is_carrier());
        assert!(!OperatorSlot::Modulator2.is_carrier());
        assert_eq!(OperatorSlot::Carrier2.index(), 3);
    }

    #[test]
    fn test_json_roundtrip_keeps_fields() {
        let mut inst = Instrument::new("Bright Piano");
        inst.four_op = true;
        inst.connection2 = Connection::AM;
        inst.op_mut(OperatorSlot::Carrier2).waveform = 5;

        let json = serde_json::to_string(&inst).expect("serialize");
        let back = Instrument::from_json_str(&json).expect("deserialize");
        assert_eq!(back, inst);
    }

    #[test]
    fn test_json_missing_fields_use_defaults() {
        let inst = Instrument::from_json_str(r#"{"feedback1": 7}"#).expect("deserialize");
        assert_eq!(inst.feedback1, 7);
        assert_eq!(inst.perc_note_num, Instrument::default().perc_note_num);
    }
}
