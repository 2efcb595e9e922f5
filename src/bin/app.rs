use clap::Parser;
use ndarray_npy::write_npy;
use polyvox::audio::{write_wav, MelConfig, MelExtractor};
use polyvox::dict::CmuDictionary;
use polyvox::synthesis;
use polyvox::tacotron2::Tacotron2;
use polyvox::text::TextFrontend;
use polyvox::vocoder::HiFiGan;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser, Debug)]
pub struct Args {
    /// Text to synthesise speech for
    #[clap(long, short)]
    input: String,
    /// Location to save the output audio file
    #[clap(short, long, default_value = "output.wav")]
    output: PathBuf,
    /// Saves the generated spectrogram for debugging purposes
    #[clap(long)]
    output_spectrogram: Option<PathBuf>,
    /// Directory where the tacotron2 ONNX models can be found
    #[clap(long, default_value = "./models/tacotron2")]
    tacotron2: PathBuf,
    /// Path to the HiFi-GAN ONNX model
    #[clap(long, default_value = "./models/hifigan.onnx")]
    hifigan: PathBuf,
    /// Optional CMU dictionary, enables phoneme inputs
    #[clap(long)]
    dictionary: Option<PathBuf>,
    /// Speaker to synthesise as
    #[clap(long, default_value_t = 0)]
    speaker: i64,
}

fn main() -> anyhow::Result<()> {
    polyvox::setup_logging();
    let args = Args::parse();

    info!("Loading resources");
    let model = Tacotron2::load(&args.tacotron2)?;
    let vocoder = HiFiGan::load(&args.hifigan)?;
    let mut frontend = TextFrontend::new(vec!["english_cleaners".to_string()])?;
    if let Some(path) = &args.dictionary {
        let dict = CmuDictionary::open(path)?;
        frontend = frontend.with_dictionary(dict, 1.0);
    }
    let mut rng = StdRng::seed_from_u64(0);

    let start = Instant::now();
    let lines: Vec<&str> = args
        .input
        .split('\n')
        .filter(|l| !l.trim().is_empty())
        .collect();
    let audio = synthesis::tts(
        &lines,
        &model,
        &vocoder,
        &frontend,
        args.speaker,
        1.0,
        &mut rng,
    )?;
    info!("Synthesis took {:?}", start.elapsed());

    if let Some(spectrogram) = &args.output_spectrogram {
        let extractor = MelExtractor::new(MelConfig::default());
        write_npy(spectrogram, &extractor.mel_spectrogram(&audio))?;
    }
    write_wav(&args.output, &audio, 22050)?;
    info!("Wrote {}", args.output.display());
    Ok(())
}
