//! End-to-end tests of the preview pipeline: instrument in, PCM frames out.

use approx::assert_relative_eq;
use opl3_preview::opl3::registers::{decode_operator_address, slot_channel, Channel, FourOpPair};
use opl3_preview::opl3::NATIVE_RATE;
use opl3_preview::patch::note_to_fnum;
use opl3_preview::streaming::ChipRenderer;
use opl3_preview::{
    BackendKind, ChipMode, ChordShape, Instrument, LinearResampler, NoteRequest, NoteScheduler,
    OperatorSlot, PatchCompiler, PreviewCommand, PreviewConfig, PreviewEngine, PreviewSynth,
    StreamConfig, VoiceSlot,
};
use std::time::{Duration, Instant};

fn config(kind: BackendKind) -> PreviewConfig {
    PreviewConfig {
        backend: kind,
        ..PreviewConfig::default()
    }
}

fn render(synth: &mut PreviewSynth, frames: usize) -> Vec<[i16; 2]> {
    let mut out = vec![[0i16; 2]; frames];
    synth.render(&mut out);
    out
}

fn is_silent(frames: &[[i16; 2]]) -> bool {
    frames.iter().all(|f| *f == [0, 0])
}

/// Two 2-op halves that are exactly the same sound
fn doubled(inst: &Instrument) -> Instrument {
    let mut out = inst.clone();
    out.four_op = true;
    out.pseudo_four_op = true;
    out.operators[OperatorSlot::Modulator2.index()] = *inst.op(OperatorSlot::Modulator1);
    out.operators[OperatorSlot::Carrier2.index()] = *inst.op(OperatorSlot::Carrier1);
    out.feedback2 = inst.feedback1;
    out.connection2 = inst.connection1;
    out.note_offset1 = 0;
    out.note_offset2 = 0;
    out.fine_tune = 0;
    out
}

#[test]
fn test_recompiling_is_byte_identical() {
    let compiler = PatchCompiler::new(ChipMode::Opl3);
    let mut inst = Instrument::new("Brass");
    inst.four_op = true;
    let slot = VoiceSlot::FourOp {
        pair: FourOpPair::new(2).unwrap(),
    };
    assert_eq!(compiler.compile(&inst, slot), compiler.compile(&inst, slot));
    assert_eq!(
        compiler.frequency_writes(&inst, slot, 64, true),
        compiler.frequency_writes(&inst, slot, 64, true)
    );
}

#[test]
fn test_two_op_instrument_never_programs_second_pair() {
    let mut inst = Instrument::new("Lead");
    // Distinctive second pair values that must never reach the chip
    inst.op_mut(OperatorSlot::Modulator2).level = 63;
    inst.op_mut(OperatorSlot::Carrier2).multiplier = 15;

    let mut scheduler = NoteScheduler::new(ChipMode::Opl3);
    scheduler.set_instrument(inst);
    let writes = scheduler.note_on(NoteRequest::Note(60));

    let channels: Vec<usize> = writes
        .iter()
        .filter_map(|w| decode_operator_address(w.address))
        .map(|(_, slot)| slot_channel(slot).0.index())
        .collect();
    assert!(!channels.is_empty());
    assert!(channels.iter().all(|&c| c == 0), "touched {channels:?}");
    assert!(writes.iter().all(|w| w.address != 0x104 || w.value == 0));
}

#[test]
fn test_pseudo_four_op_halves_sound_identical() {
    let inst = doubled(&Instrument::new("Pad"));
    let compiler = PatchCompiler::new(ChipMode::Opl3);
    let slot = VoiceSlot::Pseudo {
        first: Channel::new(0).unwrap(),
        second: Channel::new(1).unwrap(),
    };

    let mut chip = BackendKind::Accurate.create(NATIVE_RATE).unwrap();
    chip.write_all(&compiler.global_writes(0));
    chip.write_all(&compiler.compile(&inst, slot));
    chip.write_all(&compiler.frequency_writes(&inst, slot, 57, true));
    // First voice hard left, second voice hard right
    chip.write_pan(0, 0);
    chip.write_pan(1, 127);

    let mut frames = vec![[0i16; 2]; 4096];
    chip.generate_into(&mut frames);
    assert!(frames.iter().any(|f| f[0] != 0));
    for (i, f) in frames.iter().enumerate() {
        assert_eq!(f[0], f[1], "voices diverge at frame {i}");
    }
}

#[test]
fn test_major_chord_keys_three_notes() {
    let mut synth = PreviewSynth::new(&config(BackendKind::Accurate)).unwrap();
    synth
        .apply(PreviewCommand::NoteOn(NoteRequest::Chord(60, ChordShape::Major)))
        .unwrap();
    assert_eq!(synth.scheduler().active_notes(), vec![60, 64, 67]);
    assert!(!is_silent(&render(&mut synth, 2048)));

    synth.apply(PreviewCommand::NoteOff).unwrap();
    assert!(synth.scheduler().active_notes().is_empty());
}

#[test]
fn test_note_frequency_is_in_tune() {
    for note in [33u8, 57, 69, 81, 96] {
        let (fnum, block) = note_to_fnum(f64::from(note));
        let hz = f64::from(fnum) * f64::from(NATIVE_RATE)
            / f64::from(1u32 << (20 - u32::from(block)));
        let expected = 440.0 * ((f64::from(note) - 69.0) / 12.0).exp2();
        assert_relative_eq!(hz, expected, max_relative = 0.003);
    }
}

#[test]
fn test_rate_conversion_stays_within_one_frame() {
    let second = vec![[100i16, -100]; NATIVE_RATE as usize];
    for rate in [22_050u32, 44_100, 48_000, 96_000] {
        let mut resampler = LinearResampler::new(NATIVE_RATE, rate);
        let mut out = Vec::new();
        // Chip time arrives in uneven chunks
        for chunk in second.chunks(777) {
            resampler.process(chunk, &mut out);
        }
        let drift = (out.len() as f64 - f64::from(rate)).abs();
        assert!(drift <= 1.0, "{rate} Hz produced {} frames", out.len());
    }

    // The renderer pulls exactly what is asked for
    let mut renderer = ChipRenderer::new(BackendKind::Accurate, 48_000).unwrap();
    assert!(renderer.is_resampling());
    let mut out = vec![[1i16; 2]; 48_000];
    renderer.render(&mut out);
    assert!(is_silent(&out));
}

#[test]
fn test_rendering_is_deterministic() {
    for kind in BackendKind::ALL {
        let run = || {
            let mut synth = PreviewSynth::new(&config(kind)).unwrap();
            synth
                .apply(PreviewCommand::SetInstrument(Instrument::new("Bell")))
                .unwrap();
            synth.apply(PreviewCommand::NoteOn(NoteRequest::Note(72))).unwrap();
            let mut frames = render(&mut synth, 3000);
            synth.apply(PreviewCommand::NoteOff).unwrap();
            frames.extend(render(&mut synth, 3000));
            frames
        };
        assert_eq!(run(), run(), "{kind} output differs between runs");
    }
}

#[test]
fn test_backend_switch_mid_note() {
    let mut synth = PreviewSynth::new(&config(BackendKind::Fast)).unwrap();
    synth.apply(PreviewCommand::NoteOn(NoteRequest::Note(60))).unwrap();
    render(&mut synth, 1024);

    synth
        .apply(PreviewCommand::SelectBackend(BackendKind::Accurate))
        .unwrap();
    assert_eq!(synth.backend_kind(), BackendKind::Accurate);
    assert!(synth.renderer().is_resampling());
    assert!(!is_silent(&render(&mut synth, 4096)));

    // Selecting the active backend is a no-op
    synth
        .apply(PreviewCommand::SelectBackend(BackendKind::Accurate))
        .unwrap();
    assert_eq!(synth.backend_kind(), BackendKind::Accurate);
}

#[test]
fn test_opl2_mode_plays_four_op_as_two_op() {
    let mut inst = Instrument::new("Organ");
    inst.four_op = true;
    let mut synth = PreviewSynth::new(&PreviewConfig {
        chip_mode: ChipMode::Opl2,
        ..PreviewConfig::default()
    })
    .unwrap();
    synth.apply(PreviewCommand::SetInstrument(inst)).unwrap();
    synth.apply(PreviewCommand::NoteOn(NoteRequest::Note(60))).unwrap();
    assert_eq!(synth.renderer().backend().read_register(0x104), Some(0));
    assert_eq!(synth.renderer().backend().read_register(0x105), Some(0));
    assert!(!is_silent(&render(&mut synth, 2048)));
}

#[test]
fn test_instrument_json_reaches_the_chip() {
    let json = r#"{
        "name": "Kick",
        "perc_note_num": 36,
        "feedback1": 7
    }"#;
    let inst = Instrument::from_json_str(json).unwrap();
    assert_eq!(inst.name(), "Kick");

    let mut synth = PreviewSynth::new(&config(BackendKind::Accurate)).unwrap();
    synth.apply(PreviewCommand::SetInstrument(inst)).unwrap();
    synth.apply(PreviewCommand::NoteOn(NoteRequest::Percussion)).unwrap();
    assert_eq!(synth.scheduler().active_notes(), vec![36]);
    assert_eq!(
        synth.renderer().backend().read_register(0xC0).map(|v| (v >> 1) & 7),
        Some(7)
    );
}

#[test]
fn test_engine_start_and_stop() {
    let config = PreviewConfig {
        stream: StreamConfig::low_latency(44_100),
        ..PreviewConfig::default()
    };
    let engine = PreviewEngine::start(config).unwrap();
    assert!(engine.is_running());

    engine.set_instrument(Instrument::new("Strings"));
    engine.note_on(NoteRequest::Chord(48, ChordShape::Minor7));

    let buffer = engine.buffer();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut heard = false;
    let mut chunk = vec![0i16; 1024];
    while !heard && Instant::now() < deadline {
        let read = buffer.read(&mut chunk);
        heard = chunk[..read].iter().any(|&s| s != 0);
        if read == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    assert!(heard, "chord never reached the buffer");
    assert!(engine.stats().frames_rendered > 0);

    let started = Instant::now();
    engine.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(buffer.is_empty());
}

fn energy(frames: &[[i16; 2]]) -> i64 {
    frames
        .iter()
        .map(|f| i64::from(f[0]).abs() + i64::from(f[1]).abs())
        .sum()
}

#[test]
fn test_repeated_percussion_hit_retriggers() {
    let mut drum = Instrument::new("Snare");
    for slot in [OperatorSlot::Modulator1, OperatorSlot::Carrier1] {
        let op = drum.op_mut(slot);
        op.sustaining = false;
        op.decay = 8;
        op.release = 8;
    }

    for kind in BackendKind::ALL {
        let mut synth = PreviewSynth::new(&config(kind)).unwrap();
        synth.apply(PreviewCommand::SetInstrument(drum.clone())).unwrap();

        synth.apply(PreviewCommand::NoteOn(NoteRequest::Percussion)).unwrap();
        let first = energy(&render(&mut synth, 4410));
        render(&mut synth, 88_200);

        // Second hit without a note-off in between
        synth.apply(PreviewCommand::NoteOn(NoteRequest::Percussion)).unwrap();
        let second = energy(&render(&mut synth, 4410));

        assert!(first > 0, "{kind}: first hit is silent");
        assert!(
            second * 2 > first,
            "{kind}: second hit {second} much quieter than first {first}"
        );
    }
}
