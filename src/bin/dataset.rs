use clap::{Parser, Subcommand};
use polyvox::audio::{MelConfig, MelExtractor};
use polyvox::dataset::catalogue::Catalogue;
use polyvox::dataset::TextMelDataset;
use polyvox::text::TextFrontend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;

/// Filelist bookkeeping: validate training filelists, catalogue speaker corpora and assemble
/// multi-speaker filelists out of the catalogue.
#[derive(Parser, Debug)]
pub struct Args {
    /// Location of the filelist catalogue
    #[clap(long, default_value = "catalogue.json")]
    catalogue: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a training filelist for missing audio, empty transcripts and duplicates
    Validate {
        /// Filelist of `audio|transcript|speaker` lines
        filelist: PathBuf,
    },
    /// Catalogue a corpus where each subdirectory is one speaker
    AddMultispeaker {
        root: PathBuf,
        #[clap(long)]
        dataset_name: String,
    },
    /// Catalogue a single-speaker corpus
    AddSinglespeaker {
        root: PathBuf,
        #[clap(long)]
        speaker_name: String,
        #[clap(long)]
        dataset_name: String,
    },
    /// List every catalogued filelist
    List,
    /// Assemble a training filelist from catalogue record ids, renumbering speakers densely
    Export {
        /// Record ids in the speaker order wanted
        ids: Vec<String>,
        #[clap(short, long, default_value = "train_filelist.txt")]
        output: PathBuf,
    },
    /// Dump the catalogue as CSV
    ExportCsv {
        #[clap(short, long, default_value = "catalogue.csv")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    polyvox::setup_logging();
    let args = Args::parse();
    let mut rng = StdRng::from_entropy();

    match args.command {
        Command::Validate { filelist } => {
            let frontend = TextFrontend::new(vec!["english_cleaners".to_string()])?;
            let extractor = MelExtractor::new(MelConfig::default());
            let dataset = TextMelDataset::from_filelist(&filelist, frontend, extractor, 0)?;
            info!("Loaded {} entries", dataset.len());
            if !dataset.validate() {
                anyhow::bail!("{} failed validation", filelist.display());
            }
        }
        Command::AddMultispeaker { root, dataset_name } => {
            let mut catalogue = Catalogue::open(&args.catalogue)?;
            let ids = catalogue.add_multispeaker(&mut rng, &root, &dataset_name)?;
            catalogue.save(&args.catalogue)?;
            for id in ids {
                println!("{id}");
            }
        }
        Command::AddSinglespeaker {
            root,
            speaker_name,
            dataset_name,
        } => {
            let mut catalogue = Catalogue::open(&args.catalogue)?;
            let ids =
                catalogue.add_singlespeaker(&mut rng, &root, &speaker_name, &dataset_name)?;
            catalogue.save(&args.catalogue)?;
            for id in ids {
                println!("{id}");
            }
        }
        Command::List => {
            let catalogue = Catalogue::open(&args.catalogue)?;
            for record in catalogue.records() {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.id,
                    record.speaker_name,
                    record.dataset_name,
                    record.dir_path.join(&record.rel_path).display()
                );
            }
        }
        Command::Export { ids, output } => {
            let catalogue = Catalogue::open(&args.catalogue)?;
            catalogue.export_filelist(&ids, &output)?;
            info!("Wrote {}", output.display());
        }
        Command::ExportCsv { output } => {
            let catalogue = Catalogue::open(&args.catalogue)?;
            catalogue.export_csv(&output)?;
            info!("Wrote {}", output.display());
        }
    }
    Ok(())
}
