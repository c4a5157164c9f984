use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use gcode_splicer_lib as gs;
use gs::config::MaterialMatrix;
use gs::{Context, PrinterProfile, Progress, SpliceError, SpliceFile};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

/// Turns multi-tool G-code into single-nozzle G-code plus a splice file.
#[derive(Parser, Debug)]
#[command(name = "gcode_splicer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log per-layer and per-transition detail
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process a G-code file
    Process {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output G-code; defaults to INPUT with a .spliced.gcode suffix
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,

        /// Output splice file; defaults to INPUT with a .msf suffix
        #[arg(long, value_name = "MSF")]
        msf: Option<PathBuf>,

        /// Printer profile (JSON)
        #[arg(long, value_name = "PROFILE")]
        profile: Option<PathBuf>,

        /// Material matrix (JSON)
        #[arg(long, value_name = "MATERIALS")]
        materials: Option<PathBuf>,

        /// Allow degraded results, such as a tower placed off the bed
        #[arg(long)]
        advanced: bool,
    },
    /// Print a splice file in readable form
    Inspect {
        #[arg(value_name = "MSF")]
        file: PathBuf,
    },
}

const PHASES: u64 = 6;

struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Result<BarProgress> {
        let bar = ProgressBar::new(PHASES);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .context("progress bar template")?
                .progress_chars("#>-"),
        );
        Ok(BarProgress { bar })
    }
}

impl Progress for BarProgress {
    fn increment(&mut self, label: &str) {
        if !self.bar.message().is_empty() {
            self.bar.inc(1);
        }
        self.bar.set_message(label.to_owned());
    }
}

fn with_suffix(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    input.with_file_name(format!("{}{}", stem, suffix))
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Process {
            input,
            output,
            msf,
            profile,
            materials,
            advanced,
        } => {
            let profile = match profile {
                Some(path) => PrinterProfile::from_file(&path)
                    .with_context(|| format!("loading profile {}", path.display()))?,
                None => PrinterProfile::default(),
            };
            let mut cx = Context::new(profile);
            if let Some(path) = materials {
                cx.materials = MaterialMatrix::from_file(&path)
                    .with_context(|| format!("loading materials {}", path.display()))?;
            }
            cx.advanced_mode = advanced;
            let output = output.unwrap_or_else(|| with_suffix(&input, ".spliced.gcode"));
            let msf = msf.unwrap_or_else(|| with_suffix(&input, ".msf"));

            let mut progress = BarProgress::new()?;
            let result = gs::process_files(&input, &output, &msf, &cx, &mut progress)
                .with_context(|| format!("processing {}", input.display()))?;
            progress.bar.finish_with_message("done");

            for warning in &result.warnings {
                eprintln!("warning: {}", warning);
            }
            info!(
                "{} transitions, {} splices, {} pings",
                result.report.transition_count(),
                result.splice_file.splices.len(),
                result.splice_file.pings.len()
            );
            println!("{}", output.display());
            println!("{}", msf.display());
        }
        Commands::Inspect { file } => {
            let text = fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let splice_file = SpliceFile::decode(&text).with_context(|| format!("decoding {}", file.display()))?;
            print!("{}", splice_file.render_human());
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {:#}", e);
        if let Some(detail) = e.downcast_ref::<SpliceError>().and_then(|s| s.detail()) {
            eprintln!("{}", detail);
        }
        let code = e.downcast_ref::<SpliceError>().map(|s| s.exit_code()).unwrap_or(1);
        process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn default_outputs_sit_beside_input() {
        let input = Path::new("prints/cube.gcode");
        assert_eq!(with_suffix(input, ".msf"), PathBuf::from("prints/cube.msf"));
        assert_eq!(
            with_suffix(input, ".spliced.gcode"),
            PathBuf::from("prints/cube.spliced.gcode")
        );
    }
}
