//! OPL3 Register Definitions
//!
//! Maps logical channel/operator addressing onto the YMF262's physical
//! register file and packs logical field values into bit-packed register
//! bytes. Everything here is a pure function of its inputs.
//!
//! The chip has two register banks (0x000-0x0FF and 0x100-0x1FF), each with
//! nine channels of two operators. Operator registers live at
//! `base + offset`, where the offset of a channel's first operator is
//! `0,1,2,8,9,10,16,17,18` and the second operator sits 3 above it.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::instrument::Operator;

/// Total number of 2-op channels across both banks
pub const NUM_CHANNELS: usize = 18;

/// Channels per register bank
pub const CHANNELS_PER_BANK: usize = 9;

/// Total number of operator slots across both banks
pub const NUM_SLOTS: usize = 36;

/// Number of channel pairs that can be joined into a 4-op voice
pub const NUM_FOUR_OP_PAIRS: usize = 6;

/// Waveform select enable (OPL2) lives in bit 5 of this register
pub const REG_WAVE_SELECT: u16 = 0x01;
/// Composite sine / note-select register
pub const REG_NOTE_SELECT: u16 = 0x08;
/// Tremolo depth, vibrato depth and rhythm control
pub const REG_DEPTH_RHYTHM: u16 = 0xBD;
/// 4-op connection select (one bit per pair)
pub const REG_FOUR_OP: u16 = 0x104;
/// OPL3 mode enable ("NEW" bit)
pub const REG_NEW: u16 = 0x105;

/// Waveform select enable bit in [`REG_WAVE_SELECT`]
pub const WAVE_SELECT_ENABLE: u8 = 0x20;
/// Deep tremolo bit in [`REG_DEPTH_RHYTHM`]
pub const DEEP_TREMOLO: u8 = 0x80;
/// Deep vibrato bit in [`REG_DEPTH_RHYTHM`]
pub const DEEP_VIBRATO: u8 = 0x40;
/// Key-on bit in the B0 channel register
pub const KEY_ON: u8 = 0x20;

/// Offset of each channel's first operator inside its bank
const OPERATOR_OFFSETS: [u16; CHANNELS_PER_BANK] =
    [0x00, 0x01, 0x02, 0x08, 0x09, 0x0A, 0x10, 0x11, 0x12];

/// Local slot number for each operator register offset (`None` = unused offset)
const OFFSET_TO_SLOT: [Option<u8>; 32] = [
    Some(0), Some(1), Some(2), Some(3), Some(4), Some(5), None, None,
    Some(6), Some(7), Some(8), Some(9), Some(10), Some(11), None, None,
    Some(12), Some(13), Some(14), Some(15), Some(16), Some(17), None, None,
    None, None, None, None, None, None, None, None,
];

/// Which register layout the chip is driven in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipMode {
    /// Legacy 2-op mode: 4 waveforms, 9 channels per bank, no 4-op pairs
    Opl2,
    /// Full OPL3 mode: 8 waveforms and 4-op pairs
    #[default]
    Opl3,
}

impl ChipMode {
    /// Highest valid waveform index in this mode
    pub fn max_waveform(self) -> u8 {
        match self {
            ChipMode::Opl2 => 3,
            ChipMode::Opl3 => 7,
        }
    }

    /// Whether 4-op channel pairs are available
    pub fn supports_four_op(self) -> bool {
        self == ChipMode::Opl3
    }
}

/// A single physical register write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterWrite {
    /// 9-bit register address (bit 8 selects the second bank)
    pub address: u16,
    /// Data byte
    pub value: u8,
}

impl RegisterWrite {
    /// Create a register write
    pub fn new(address: u16, value: u8) -> Self {
        RegisterWrite { address, value }
    }
}

impl fmt::Display for RegisterWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}={:02X}", self.address, self.value)
    }
}

/// Index of a 2-op channel (0-17)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    /// Create a channel index, `None` when out of range
    pub fn new(index: usize) -> Option<Self> {
        (index < NUM_CHANNELS).then_some(Channel(index as u8))
    }

    /// Raw channel number
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Register bank base (0x000 or 0x100)
    pub fn bank(self) -> u16 {
        if self.index() >= CHANNELS_PER_BANK {
            0x100
        } else {
            0
        }
    }

    /// Channel number within its bank (0-8)
    pub fn local(self) -> usize {
        self.index() % CHANNELS_PER_BANK
    }

    /// Address of a per-channel register
    pub fn register(self, reg: ChannelRegister) -> u16 {
        self.bank() | (reg as u16 + self.local() as u16)
    }

    /// Address of an operator register of this channel
    ///
    /// `second` selects the channel's second operator.
    pub fn operator_register(self, second: bool, reg: OperatorRegister) -> u16 {
        let offset = OPERATOR_OFFSETS[self.local()] + if second { 3 } else { 0 };
        self.bank() | (reg as u16 + offset)
    }

    /// Global slot number (0-35) of one of this channel's operators
    pub fn slot(self, second: bool) -> usize {
        let local = self.local();
        let bank_slots = if self.bank() != 0 { 18 } else { 0 };
        bank_slots + (local / 3) * 6 + usize::from(second) * 3 + local % 3
    }
}

/// One of the six channel pairs that can form a 4-op voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourOpPair(u8);

impl FourOpPair {
    /// Create a pair index, `None` when out of range
    pub fn new(index: usize) -> Option<Self> {
        (index < NUM_FOUR_OP_PAIRS).then_some(FourOpPair(index as u8))
    }

    /// Raw pair number
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Channel holding operators 1 and 2 (and the frequency/key registers)
    pub fn first(self) -> Channel {
        let i = self.index();
        Channel(if i < 3 { i as u8 } else { (i + 6) as u8 })
    }

    /// Channel holding operators 3 and 4
    pub fn second(self) -> Channel {
        Channel(self.first().0 + 3)
    }

    /// Bit of this pair in register 0x104
    pub fn connection_bit(self) -> u8 {
        1 << self.0
    }

    /// Pair that owns the given channel, if any
    pub fn containing(channel: Channel) -> Option<Self> {
        (0..NUM_FOUR_OP_PAIRS)
            .map(|i| FourOpPair(i as u8))
            .find(|p| p.first() == channel || p.second() == channel)
    }
}

/// Per-operator register groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorRegister {
    /// AM / VIB / EGT / KSR / MULT - 0x20
    Characteristic = 0x20,
    /// KSL / TL - 0x40
    ScaleLevel = 0x40,
    /// AR / DR - 0x60
    AttackDecay = 0x60,
    /// SL / RR - 0x80
    SustainRelease = 0x80,
    /// WS - 0xE0
    Waveform = 0xE0,
}

impl OperatorRegister {
    /// All operator registers in the order the compiler emits them
    pub const ALL: [OperatorRegister; 5] = [
        OperatorRegister::Characteristic,
        OperatorRegister::ScaleLevel,
        OperatorRegister::AttackDecay,
        OperatorRegister::SustainRelease,
        OperatorRegister::Waveform,
    ];

    fn from_base(base: u8) -> Option<Self> {
        match base {
            0x20 => Some(OperatorRegister::Characteristic),
            0x40 => Some(OperatorRegister::ScaleLevel),
            0x60 => Some(OperatorRegister::AttackDecay),
            0x80 => Some(OperatorRegister::SustainRelease),
            0xE0 => Some(OperatorRegister::Waveform),
            _ => None,
        }
    }
}

/// Per-channel registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRegister {
    /// F-number low 8 bits - 0xA0
    FnumLow = 0xA0,
    /// Key-on / block / F-number high 2 bits - 0xB0
    KeyBlockFnum = 0xB0,
    /// Output / feedback / connection - 0xC0
    FeedbackConnection = 0xC0,
}

bitflags! {
    /// Flag bits of the 0x20 operator register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Characteristic: u8 {
        /// Amplitude modulation (tremolo)
        const TREMOLO = 0x80;
        /// Frequency vibrato
        const VIBRATO = 0x40;
        /// Sustaining envelope
        const SUSTAINING = 0x20;
        /// Key-scale rate
        const KSR = 0x10;
    }
}

bitflags! {
    /// Output routing bits of the 0xC0 channel register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelOutput: u8 {
        /// Left speaker
        const LEFT = 0x10;
        /// Right speaker
        const RIGHT = 0x20;
        /// Output C (unused on stereo boards)
        const OUT_C = 0x40;
        /// Output D (unused on stereo boards)
        const OUT_D = 0x80;
    }
}

/// Logical operator fields, each stored in one bit range of one register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorField {
    /// Attack rate
    Attack,
    /// Decay rate
    Decay,
    /// Sustain level
    Sustain,
    /// Release rate
    Release,
    /// Waveform select
    Waveform,
    /// Frequency multiplier
    Multiplier,
    /// Total level (attenuation)
    Level,
    /// Key-scale level
    KeyScaleLevel,
    /// Tremolo enable
    Tremolo,
    /// Vibrato enable
    Vibrato,
    /// Sustaining envelope type
    Sustaining,
    /// Key-scale rate enable
    KeyScaleRate,
}

impl OperatorField {
    /// Every operator field
    pub const ALL: [OperatorField; 12] = [
        OperatorField::Attack,
        OperatorField::Decay,
        OperatorField::Sustain,
        OperatorField::Release,
        OperatorField::Waveform,
        OperatorField::Multiplier,
        OperatorField::Level,
        OperatorField::KeyScaleLevel,
        OperatorField::Tremolo,
        OperatorField::Vibrato,
        OperatorField::Sustaining,
        OperatorField::KeyScaleRate,
    ];

    /// Register holding this field
    pub fn register(self) -> OperatorRegister {
        use OperatorField::*;
        match self {
            Tremolo | Vibrato | Sustaining | KeyScaleRate | Multiplier => {
                OperatorRegister::Characteristic
            }
            KeyScaleLevel | Level => OperatorRegister::ScaleLevel,
            Attack | Decay => OperatorRegister::AttackDecay,
            Sustain | Release => OperatorRegister::SustainRelease,
            Waveform => OperatorRegister::Waveform,
        }
    }

    /// Bit position of the field's least significant bit
    pub fn shift(self) -> u8 {
        use OperatorField::*;
        match self {
            Tremolo => 7,
            Vibrato | KeyScaleLevel => 6,
            Sustaining => 5,
            KeyScaleRate | Attack | Sustain => 4,
            Multiplier | Level | Decay | Release | Waveform => 0,
        }
    }

    /// Largest value the field can hold in the given chip mode
    pub fn max_value(self, mode: ChipMode) -> u8 {
        use OperatorField::*;
        match self {
            Tremolo | Vibrato | Sustaining | KeyScaleRate => 1,
            KeyScaleLevel => 3,
            Level => 63,
            Waveform => mode.max_waveform(),
            Attack | Decay | Sustain | Release | Multiplier => 15,
        }
    }

    /// Field mask within its register byte
    pub fn mask(self, mode: ChipMode) -> u8 {
        let width_mask = match self {
            // The waveform field is physically 3 bits wide in both modes
            OperatorField::Waveform => 0x07,
            other => other.max_value(mode),
        };
        width_mask << self.shift()
    }

    /// Pack a value into its bit position, clamping to the field range
    pub fn pack(self, mode: ChipMode, value: u8) -> u8 {
        value.min(self.max_value(mode)) << self.shift()
    }

    /// Extract the field from a register byte
    pub fn unpack(self, mode: ChipMode, byte: u8) -> u8 {
        (byte & self.mask(mode)) >> self.shift()
    }

    /// Read this field out of an operator descriptor
    pub fn get(self, op: &Operator) -> u8 {
        use OperatorField::*;
        match self {
            Attack => op.attack,
            Decay => op.decay,
            Sustain => op.sustain,
            Release => op.release,
            Waveform => op.waveform,
            Multiplier => op.multiplier,
            Level => op.level,
            KeyScaleLevel => op.ksl,
            Tremolo => u8::from(op.tremolo),
            Vibrato => u8::from(op.vibrato),
            Sustaining => u8::from(op.sustaining),
            KeyScaleRate => u8::from(op.ksr),
        }
    }

    /// Fields stored in the given register
    pub fn in_register(reg: OperatorRegister) -> impl Iterator<Item = OperatorField> {
        OperatorField::ALL
            .into_iter()
            .filter(move |f| f.register() == reg)
    }
}

/// Per-channel fields of the 0xC0 and 0xB0 registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelField {
    /// Connection (CNT) bit
    Connection,
    /// Feedback level
    Feedback,
    /// Octave block
    Block,
}

impl ChannelField {
    /// Every channel field
    pub const ALL: [ChannelField; 3] = [
        ChannelField::Connection,
        ChannelField::Feedback,
        ChannelField::Block,
    ];

    /// Register holding this field
    pub fn register(self) -> ChannelRegister {
        match self {
            ChannelField::Connection | ChannelField::Feedback => {
                ChannelRegister::FeedbackConnection
            }
            ChannelField::Block => ChannelRegister::KeyBlockFnum,
        }
    }

    /// Bit position of the field
    pub fn shift(self) -> u8 {
        match self {
            ChannelField::Connection => 0,
            ChannelField::Feedback => 1,
            ChannelField::Block => 2,
        }
    }

    /// Largest value of the field
    pub fn max_value(self) -> u8 {
        match self {
            ChannelField::Connection => 1,
            ChannelField::Feedback | ChannelField::Block => 7,
        }
    }

    /// Pack a value into its bit position, clamping to the field range
    pub fn pack(self, value: u8) -> u8 {
        value.min(self.max_value()) << self.shift()
    }

    /// Extract the field from a register byte
    pub fn unpack(self, byte: u8) -> u8 {
        (byte >> self.shift()) & self.max_value()
    }
}

/// Pack every field of `reg` from an operator descriptor
pub fn pack_operator_register(reg: OperatorRegister, op: &Operator, mode: ChipMode) -> u8 {
    OperatorField::in_register(reg).fold(0u8, |acc, field| acc | field.pack(mode, field.get(op)))
}

/// Full register write for one operator register
pub fn operator_write(
    channel: Channel,
    second: bool,
    reg: OperatorRegister,
    op: &Operator,
    mode: ChipMode,
) -> RegisterWrite {
    RegisterWrite::new(
        channel.operator_register(second, reg),
        pack_operator_register(reg, op, mode),
    )
}

/// Register write that replaces a single field inside `current`
///
/// Other fields sharing the byte are preserved.
pub fn operator_field_write(
    channel: Channel,
    second: bool,
    field: OperatorField,
    value: u8,
    current: u8,
    mode: ChipMode,
) -> RegisterWrite {
    let byte = (current & !field.mask(mode)) | field.pack(mode, value);
    RegisterWrite::new(channel.operator_register(second, field.register()), byte)
}

/// Pack the 0xC0 register
pub fn pack_feedback_connection(feedback: u8, connection: u8, output: ChannelOutput) -> u8 {
    output.bits()
        | ChannelField::Feedback.pack(feedback)
        | ChannelField::Connection.pack(connection)
}

/// Pack a frequency into (0xA0, 0xB0) bytes
pub fn pack_frequency(fnum: u16, block: u8, key_on: bool) -> (u8, u8) {
    let fnum = fnum.min(0x3FF);
    let lo = (fnum & 0xFF) as u8;
    let hi = ((fnum >> 8) as u8 & 0x03)
        | ChannelField::Block.pack(block)
        | if key_on { KEY_ON } else { 0 };
    (lo, hi)
}

/// Unpack (0xA0, 0xB0) bytes into (fnum, block, key_on)
pub fn unpack_frequency(lo: u8, hi: u8) -> (u16, u8, bool) {
    let fnum = (u16::from(hi & 0x03) << 8) | u16::from(lo);
    (fnum, ChannelField::Block.unpack(hi), hi & KEY_ON != 0)
}

/// Decode an operator register address into its register group and global slot
pub fn decode_operator_address(address: u16) -> Option<(OperatorRegister, usize)> {
    let bank = usize::from(address & 0x100 != 0);
    let regm = (address & 0xFF) as u8;
    let reg = OperatorRegister::from_base(regm & 0xE0)?;
    let slot = OFFSET_TO_SLOT[(regm & 0x1F) as usize]?;
    Some((reg, bank * 18 + slot as usize))
}

/// Decode a channel register address into its register and channel
///
/// 0xBD in the first bank is the rhythm register and decodes to `None`.
pub fn decode_channel_address(address: u16) -> Option<(ChannelRegister, Channel)> {
    let bank = usize::from(address & 0x100 != 0);
    let regm = (address & 0xFF) as u8;
    let local = (regm & 0x0F) as usize;
    if local >= CHANNELS_PER_BANK {
        return None;
    }
    let reg = match regm & 0xF0 {
        0xA0 => ChannelRegister::FnumLow,
        0xB0 => ChannelRegister::KeyBlockFnum,
        0xC0 => ChannelRegister::FeedbackConnection,
        _ => return None,
    };
    Channel::new(bank * CHANNELS_PER_BANK + local).map(|ch| (reg, ch))
}

/// Channel and operator position (second = true) of a global slot
pub fn slot_channel(slot: usize) -> (Channel, bool) {
    let bank = slot / 18;
    let local = slot % 18;
    let group = local / 6;
    let within = local % 6;
    let channel = bank * CHANNELS_PER_BANK + group * 3 + within % 3;
    (Channel(channel as u8), within >= 3)
}
