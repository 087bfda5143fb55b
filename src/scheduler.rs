//! Voice/note scheduler
//!
//! Maps test-note requests (single notes, chord shapes, percussion hits) onto
//! chip voice slots and produces the register writes that key them. The
//! scheduler never touches a backend itself; callers apply the returned
//! writes in order, which keeps every operation a pure state transition that
//! is easy to test.

use std::fmt;

use tracing::debug;

use crate::instrument::Instrument;
use crate::opl3::registers::{
    Channel, ChipMode, FourOpPair, RegisterWrite, NUM_CHANNELS, NUM_FOUR_OP_PAIRS,
};
use crate::patch::{PatchCompiler, VoiceLayout, VoiceSlot};

/// Highest valid MIDI note
const MAX_NOTE: u8 = 127;

/// Chord shapes offered for previewing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChordShape {
    /// Root, major third, fifth
    Major,
    /// Root, minor third, fifth
    Minor,
    /// Root, major third, augmented fifth
    Augmented,
    /// Root, minor third, diminished fifth
    Diminished,
    /// Major triad plus major seventh
    Major7,
    /// Minor triad plus minor seventh
    Minor7,
}

impl ChordShape {
    /// All shapes
    pub const ALL: [ChordShape; 6] = [
        ChordShape::Major,
        ChordShape::Minor,
        ChordShape::Augmented,
        ChordShape::Diminished,
        ChordShape::Major7,
        ChordShape::Minor7,
    ];

    /// Semitone intervals above the root, root included
    pub fn intervals(self) -> &'static [u8] {
        match self {
            ChordShape::Major => &[0, 4, 7],
            ChordShape::Minor => &[0, 3, 7],
            ChordShape::Augmented => &[0, 4, 8],
            ChordShape::Diminished => &[0, 3, 6],
            ChordShape::Major7 => &[0, 4, 7, 11],
            ChordShape::Minor7 => &[0, 3, 7, 10],
        }
    }

    /// Parse a shape name (case-insensitive)
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "major" | "maj" => Some(ChordShape::Major),
            "minor" | "min" => Some(ChordShape::Minor),
            "augmented" | "aug" => Some(ChordShape::Augmented),
            "diminished" | "dim" => Some(ChordShape::Diminished),
            "major7" | "maj7" => Some(ChordShape::Major7),
            "minor7" | "min7" => Some(ChordShape::Minor7),
            _ => None,
        }
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            ChordShape::Major => "major",
            ChordShape::Minor => "minor",
            ChordShape::Augmented => "augmented",
            ChordShape::Diminished => "diminished",
            ChordShape::Major7 => "major7",
            ChordShape::Minor7 => "minor7",
        }
    }
}

impl fmt::Display for ChordShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A test-note request from the editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteRequest {
    /// One note (MIDI number)
    Note(u8),
    /// A chord built on a root note
    Chord(u8, ChordShape),
    /// The instrument's fixed percussion key
    Percussion,
}

/// State of the test voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VoiceState {
    /// Nothing keyed
    #[default]
    Idle,
    /// One or more voices keyed on
    Sounding,
}

/// A keyed voice: which slot plays which note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActiveVoice {
    /// Chip channels of the voice
    pub slot: VoiceSlot,
    /// Sounding note before instrument offsets
    pub note: u8,
}

/// Maps note requests to voice slots and key writes
#[derive(Debug, Clone)]
pub struct NoteScheduler {
    compiler: PatchCompiler,
    instrument: Instrument,
    voices: Vec<ActiveVoice>,
    percussion: bool,
    recent_melodic_note: u8,
}

impl NoteScheduler {
    /// Create an idle scheduler holding the default instrument
    pub fn new(mode: ChipMode) -> Self {
        NoteScheduler {
            compiler: PatchCompiler::new(mode),
            instrument: Instrument::default(),
            voices: Vec::new(),
            percussion: false,
            recent_melodic_note: 60,
        }
    }

    /// Compiler used for patches
    pub fn compiler(&self) -> &PatchCompiler {
        &self.compiler
    }

    /// Current instrument
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Voice state
    pub fn state(&self) -> VoiceState {
        if self.voices.is_empty() {
            VoiceState::Idle
        } else {
            VoiceState::Sounding
        }
    }

    /// Voices currently keyed on
    pub fn active_voices(&self) -> &[ActiveVoice] {
        &self.voices
    }

    /// Notes currently keyed on, in trigger order
    pub fn active_notes(&self) -> Vec<u8> {
        self.voices.iter().map(|v| v.note).collect()
    }

    /// Whether requests play the fixed percussion key
    pub fn is_percussion_mode(&self) -> bool {
        self.percussion
    }

    /// Last melodic note requested, restored when leaving percussion mode
    pub fn recent_melodic_note(&self) -> u8 {
        self.recent_melodic_note
    }

    /// Enter or leave percussion mode
    ///
    /// In percussion mode every request plays the instrument's
    /// `perc_note_num` and chords collapse to a single note.
    pub fn set_percussion_mode(&mut self, enabled: bool) {
        if self.percussion != enabled {
            debug!(enabled, recent_note = self.recent_melodic_note, "Percussion mode changed");
        }
        self.percussion = enabled;
    }

    /// Replace the current instrument
    ///
    /// While sounding, the patch is rewritten in place on the keyed slots and
    /// the key-on is re-issued without an intermediate key-off. If the new
    /// instrument needs a different slot layout the old voices are released
    /// and the same notes re-triggered on fresh slots.
    pub fn set_instrument(&mut self, instrument: Instrument) -> Vec<RegisterWrite> {
        if self.voices.is_empty() {
            self.instrument = instrument;
            return Vec::new();
        }

        if self.compiler.layout(&instrument) != self.compiler.layout(&self.instrument) {
            debug!("Instrument layout changed, re-allocating voices");
            let notes = self.active_notes();
            // Release with the old instrument so every old channel is keyed off
            let mut writes = self.note_off();
            self.instrument = instrument;
            writes.extend(self.key_notes(&notes));
            return writes;
        }

        self.instrument = instrument;
        self.replay_writes()
    }

    /// Writes that rebuild the current chip state on a freshly reset backend
    pub fn replay_writes(&self) -> Vec<RegisterWrite> {
        let mut writes = self
            .compiler
            .global_writes(self.compiler.four_op_mask(&self.instrument));
        for voice in &self.voices {
            writes.extend(self.compiler.compile(&self.instrument, voice.slot));
            writes.extend(self.compiler.frequency_writes(
                &self.instrument,
                voice.slot,
                voice.note,
                true,
            ));
        }
        writes
    }

    /// Key the requested note(s), releasing whatever was sounding
    pub fn note_on(&mut self, request: NoteRequest) -> Vec<RegisterWrite> {
        let notes = self.resolve(request);
        let mut writes = self.note_off();
        writes.extend(self.key_notes(&notes));
        writes
    }

    /// Release every sounding voice
    pub fn note_off(&mut self) -> Vec<RegisterWrite> {
        let mut writes = Vec::new();
        for voice in self.voices.drain(..) {
            writes.extend(
                self.compiler
                    .frequency_writes(&self.instrument, voice.slot, voice.note, false),
            );
        }
        writes
    }

    /// Notes a request expands to
    fn resolve(&mut self, request: NoteRequest) -> Vec<u8> {
        let perc = self.instrument.perc_note_num.min(MAX_NOTE);
        match request {
            NoteRequest::Percussion => vec![perc],
            _ if self.percussion => vec![perc],
            NoteRequest::Note(note) => {
                let note = note.min(MAX_NOTE);
                self.recent_melodic_note = note;
                vec![note]
            }
            NoteRequest::Chord(root, shape) => {
                let root = root.min(MAX_NOTE);
                self.recent_melodic_note = root;
                shape
                    .intervals()
                    .iter()
                    .filter_map(|i| root.checked_add(*i).filter(|n| *n <= MAX_NOTE))
                    .collect()
            }
        }
    }

    /// Allocate slots for `notes`, compile the patch into each and key them
    fn key_notes(&mut self, notes: &[u8]) -> Vec<RegisterWrite> {
        let slots = allocate(self.compiler.layout(&self.instrument), notes.len());
        if slots.len() < notes.len() {
            debug!(
                requested = notes.len(),
                available = slots.len(),
                "Not enough voice slots, dropping notes"
            );
        }

        let mut writes = self
            .compiler
            .global_writes(self.compiler.four_op_mask(&self.instrument));
        for (&note, slot) in notes.iter().zip(slots) {
            writes.extend(self.compiler.compile(&self.instrument, slot));
            writes.extend(self.compiler.frequency_writes(&self.instrument, slot, note, true));
            self.voices.push(ActiveVoice { slot, note });
        }
        writes
    }
}

/// First `count` slots of the pool for a layout
fn allocate(layout: VoiceLayout, count: usize) -> Vec<VoiceSlot> {
    match layout {
        VoiceLayout::FourOp => (0..NUM_FOUR_OP_PAIRS)
            .filter_map(FourOpPair::new)
            .map(|pair| VoiceSlot::FourOp { pair })
            .take(count)
            .collect(),
        VoiceLayout::TwoOp => (0..NUM_CHANNELS)
            .filter_map(Channel::new)
            .map(|channel| VoiceSlot::TwoOp { channel })
            .take(count)
            .collect(),
        VoiceLayout::Pseudo => (0..NUM_CHANNELS / 2)
            .filter_map(|i| Some((Channel::new(i * 2)?, Channel::new(i * 2 + 1)?)))
            .map(|(first, second)| VoiceSlot::Pseudo { first, second })
            .take(count)
            .collect(),
    }
}
