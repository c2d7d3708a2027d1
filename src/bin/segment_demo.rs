/// Offline segmentation demo
/// Runs a WAV recording through the speech segmenter and saves every segment
///
/// Usage: segment_demo <input.wav> [energy_threshold]
use std::error::Error;
use std::path::Path;
use turnkeeper::audio_seg::{AudioSegmenter, SegmenterEvent};
use turnkeeper::barge_in::BargeInSignal;
use turnkeeper::config::SegConfig;
use turnkeeper::transcription::encode_wav;

const FRAME_SAMPLES: usize = 1600;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next() else {
        eprintln!("Usage: segment_demo <input.wav> [energy_threshold]");
        std::process::exit(2);
    };

    let mut reader = hound::WavReader::open(&input)?;
    let spec = reader.spec();
    if spec.channels != 1
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(format!("{} must be 16-bit mono PCM", input).into());
    }
    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;

    let mut config = SegConfig {
        sample_rate: spec.sample_rate,
        ..Default::default()
    };
    if let Some(threshold) = args.next() {
        config.energy_threshold = threshold.parse()?;
    }

    println!(
        "Segmenting {} ({:.1}s at {} Hz, threshold {})",
        input,
        samples.len() as f32 / spec.sample_rate as f32,
        spec.sample_rate,
        config.energy_threshold
    );

    let barge_in = BargeInSignal::new();
    let mut segmenter = AudioSegmenter::new(config, barge_in);
    let stem = Path::new(&input)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("segment");

    let mut saved = 0;
    for frame in samples.chunks(FRAME_SAMPLES) {
        match segmenter.push_frame(frame) {
            Some(SegmenterEvent::SpeechStarted { start_sample }) => {
                println!(
                    "  speech started at {:.2}s",
                    start_sample as f32 / spec.sample_rate as f32
                );
            }
            Some(SegmenterEvent::SpeechEnded(segment)) => {
                let filename = format!("{}_seg{:03}.wav", stem, segment.seq);
                std::fs::write(&filename, encode_wav(&segment.pcm, segment.sample_rate)?)?;
                println!(
                    "  segment #{} {:.2}s..{:.2}s ({:?}) -> {}",
                    segment.seq,
                    segment.start_sample as f32 / spec.sample_rate as f32,
                    segment.end_sample as f32 / spec.sample_rate as f32,
                    segment.close_reason,
                    filename
                );
                saved += 1;
            }
            None => {}
        }
    }

    if segmenter.is_capturing() {
        println!("  recording ended during speech, last segment not closed");
    }
    println!("{} segment(s) saved", saved);
    Ok(())
}
