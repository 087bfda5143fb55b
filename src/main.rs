use std::env;
use std::fs;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use opl3_preview::{
    BackendKind, ChipMode, ChordShape, Instrument, NoteRequest, PreviewCommand, PreviewConfig,
    PreviewSynth,
};

const USAGE: &str = "Usage:
  opl3-preview [options] (--wav <out.wav> | --play)

Flags:
  --backend <kind>     Chip backend: accurate (default) | fast
  --mode <mode>        Register mode: opl3 (default) | opl2
  --config <file>      JSON preview configuration
  --instrument <file>  JSON instrument (default: built-in organ)
  --note <n>           MIDI note to preview (default 60)
  --chord <shape>      major | minor | augmented | diminished | major7 | minor7
  --percussion         Play the instrument's percussion key
  --pan <0-127>        Stereo position (default 64)
  --rate <hz>          Output sample rate
  --seconds <s>        Preview length (default 2)
  --wav <file>         Render offline to a WAV file
  --play               Play through the default audio device
  -h, --help           Show this help

Examples:
  opl3-preview --chord major7 --wav chord.wav
  opl3-preview --backend fast --instrument bass.json --note 36 --play
";

/// Options gathered from the command line
struct Options {
    config: PreviewConfig,
    instrument: Instrument,
    request: NoteRequest,
    pan: Option<u8>,
    seconds: f32,
    wav: Option<String>,
    play: bool,
}

fn value<T: std::str::FromStr>(flag: &str, raw: Option<String>) -> anyhow::Result<T> {
    let raw = raw.with_context(|| format!("{flag} requires an argument"))?;
    raw.parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {flag}: {raw}"))
}

fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut config = PreviewConfig::default();
    let mut backend: Option<BackendKind> = None;
    let mut mode: Option<ChipMode> = None;
    let mut rate: Option<u32> = None;
    let mut instrument = Instrument::new("Organ");
    let mut note = 60u8;
    let mut chord: Option<ChordShape> = None;
    let mut percussion = false;
    let mut pan = None;
    let mut seconds = 2.0f32;
    let mut wav = None;
    let mut play = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(None),
            "--backend" => {
                let name: String = value(&arg, args.next())?;
                backend = Some(
                    BackendKind::from_str(&name)
                        .with_context(|| format!("Unknown backend: {name}"))?,
                );
            }
            "--mode" => {
                let name: String = value(&arg, args.next())?;
                mode = Some(match name.to_ascii_lowercase().as_str() {
                    "opl2" => ChipMode::Opl2,
                    "opl3" => ChipMode::Opl3,
                    _ => bail!("Unknown chip mode: {name}"),
                });
            }
            "--config" => {
                let path: String = value(&arg, args.next())?;
                config = PreviewConfig::load(&path)
                    .with_context(|| format!("Failed to load config '{path}'"))?;
            }
            "--instrument" => {
                let path: String = value(&arg, args.next())?;
                let json = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read instrument '{path}'"))?;
                instrument = Instrument::from_json_str(&json)
                    .with_context(|| format!("Invalid instrument '{path}'"))?;
            }
            "--note" => note = value(&arg, args.next())?,
            "--chord" => {
                let name: String = value(&arg, args.next())?;
                chord = Some(
                    ChordShape::from_str(&name)
                        .with_context(|| format!("Unknown chord shape: {name}"))?,
                );
            }
            "--percussion" => percussion = true,
            "--pan" => pan = Some(value(&arg, args.next())?),
            "--rate" => rate = Some(value(&arg, args.next())?),
            "--seconds" => seconds = value(&arg, args.next())?,
            "--wav" => wav = Some(value(&arg, args.next())?),
            "--play" => play = true,
            _ => bail!("Unknown flag: {arg}"),
        }
    }

    if wav.is_none() && !play {
        return Ok(None);
    }
    if !(seconds > 0.0 && seconds <= 600.0) {
        bail!("--seconds must be within (0, 600]");
    }

    // Command-line flags override the config file
    if let Some(backend) = backend {
        config.backend = backend;
    }
    if let Some(mode) = mode {
        config.chip_mode = mode;
    }
    if let Some(rate) = rate {
        config.stream.sample_rate = rate;
    }
    config.validate()?;

    let request = if percussion {
        NoteRequest::Percussion
    } else if let Some(shape) = chord {
        NoteRequest::Chord(note, shape)
    } else {
        NoteRequest::Note(note)
    };

    Ok(Some(Options {
        config,
        instrument,
        request,
        pan,
        seconds,
        wav,
        play,
    }))
}

/// Render the preview offline into a 16-bit stereo WAV file
fn render_wav(options: &Options, path: &str) -> anyhow::Result<()> {
    let mut synth = PreviewSynth::new(&options.config)?;
    synth.apply(PreviewCommand::SetInstrument(options.instrument.clone()))?;
    if let Some(pan) = options.pan {
        synth.apply(PreviewCommand::SetPan(pan))?;
    }
    synth.apply(PreviewCommand::NoteOn(options.request))?;

    let rate = synth.output_rate();
    let total = (options.seconds * rate as f32) as usize;
    // Hold for three quarters, then let the release ring out
    let held = total * 3 / 4;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create '{path}'"))?;

    let mut frames = vec![[0i16; 2]; 1024];
    let mut written = 0;
    for (end, release) in [(held, true), (total, false)] {
        while written < end {
            let count = frames.len().min(end - written);
            synth.render(&mut frames[..count]);
            for frame in &frames[..count] {
                writer.write_sample(frame[0])?;
                writer.write_sample(frame[1])?;
            }
            written += count;
        }
        if release {
            synth.apply(PreviewCommand::NoteOff)?;
        }
    }
    writer.finalize()?;

    println!(
        "Wrote {} frames ({:.2}s @ {} Hz, {} backend) to {}",
        total,
        options.seconds,
        rate,
        synth.backend_kind(),
        path
    );
    Ok(())
}

#[cfg(feature = "streaming")]
fn play(options: &Options) -> anyhow::Result<()> {
    use opl3_preview::{DeviceStatus, PreviewEngine};
    use std::time::{Duration, Instant};

    let engine = PreviewEngine::start_with_device(options.config)?;
    println!("Playing via {} backend (Ctrl+C to stop)", engine.backend_kind());
    if let DeviceStatus::Unavailable(reason) = engine.device_status() {
        bail!("Audio device unavailable: {reason}");
    }

    engine.set_instrument(options.instrument.clone());
    if let Some(pan) = options.pan {
        engine.set_pan(pan);
    }
    engine.note_on(options.request);

    let start = Instant::now();
    let length = Duration::from_secs_f32(options.seconds);
    std::thread::sleep(length.mul_f32(0.75));
    engine.note_off();
    std::thread::sleep(length.saturating_sub(start.elapsed()));

    let stats = engine.stats();
    let latency = engine.config().latency_ms();
    engine.stop();

    println!("\n=== Playback Statistics ===");
    println!("Duration:          {:.2} seconds", start.elapsed().as_secs_f32());
    println!("Frames rendered:   {}", stats.frames_rendered);
    println!("Underrun events:   {}", stats.underrun_count);
    println!("Buffer latency:    {latency:.1} ms");
    Ok(())
}

#[cfg(not(feature = "streaming"))]
fn play(_options: &Options) -> anyhow::Result<()> {
    bail!("Playback requires the \"streaming\" feature. Rebuild with `--features streaming`.")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(options) = parse_args()? else {
        eprint!("{USAGE}");
        return Ok(());
    };

    if let Some(path) = options.wav.as_deref() {
        render_wav(&options, path)?;
    }
    if options.play {
        play(&options)?;
    }
    Ok(())
}
