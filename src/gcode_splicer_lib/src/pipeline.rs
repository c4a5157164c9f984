use log::info;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

use crate::config::{Context, TransitionMethod};
use crate::error::{Result, SpliceError, Warning};
use crate::merge::OutputMergeEngine;
use crate::msf::SpliceFile;
use crate::preflight::{PreflightAnalyzer, PreflightReport};
use crate::tape::Tape;
use crate::tower::{Tower, TransitionTowerBuilder};
use crate::transitions;
use crate::Progress;

const GCODE_EXTENSIONS: [&str; 3] = ["gcode", "gco", "g"];

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct SpliceOutput {
    pub tape: Tape,
    pub splice_file: SpliceFile,
    pub warnings: Vec<Warning>,
    pub tower: Option<Tower>,
    pub report: PreflightReport,
}

pub fn check_extension(path: &Path) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if GCODE_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(SpliceError::UnsupportedExtension { extension })
    }
}

/// Run every stage over an in-memory program. Stages never overlap and a
/// cancelled run stops at the next stage boundary.
pub fn process(mut tape: Tape, cx: &Context, progress: &mut dyn Progress) -> Result<SpliceOutput> {
    cx.profile.validate()?;
    cx.materials.validate()?;
    cx.cancel.checkpoint()?;

    progress.increment("preflight");
    let mut report = PreflightAnalyzer::new(cx).analyze(&mut tape)?;
    cx.cancel.checkpoint()?;

    progress.increment("transitions");
    transitions::plan_lengths(&mut report, cx);
    transitions::pad(&mut report, cx);
    cx.cancel.checkpoint()?;

    let tower = if cx.profile.transition_method == TransitionMethod::Tower {
        progress.increment("tower");
        Some(TransitionTowerBuilder::new(cx).build(&mut report)?)
    } else {
        None
    };
    cx.cancel.checkpoint()?;

    progress.increment("merge");
    let merged = OutputMergeEngine::new(cx, &report, tower.as_ref()).run(&mut tape)?;
    cx.cancel.checkpoint()?;

    let mut warnings = report.warnings.clone();
    if let Some(tower) = &tower {
        warnings.extend(tower.warnings.iter().cloned());
    }
    Ok(SpliceOutput {
        tape,
        splice_file: merged.splice_file,
        warnings,
        tower,
        report,
    })
}

/// Read `input`, process it and write the G-code and splice file. Outputs are
/// written beside their final names first, so `output` may be `input`.
pub fn process_files(
    input: &Path,
    output: &Path,
    msf_output: &Path,
    cx: &Context,
    progress: &mut dyn Progress,
) -> Result<SpliceOutput> {
    check_extension(input)?;

    progress.increment("read");
    let before_read = Instant::now();
    let tape = Tape::read_file(input)?;
    info!("read {} lines - elapsed: {:.2?}", tape.len(), before_read.elapsed());
    cx.cancel.checkpoint()?;

    let result = process(tape, cx, progress)?;

    progress.increment("write");
    let before_write = Instant::now();
    write_atomically(output, |out| result.tape.write_to(out))?;
    let encoded = result.splice_file.encode();
    write_atomically(msf_output, |out| out.write_all(encoded.as_bytes()))?;
    info!(
        "wrote {} lines and {} splices - elapsed: {:.2?}",
        result.tape.len(),
        result.splice_file.splices.len(),
        before_write.elapsed()
    );
    Ok(result)
}

fn write_atomically<F>(path: &Path, f: F) -> Result<()>
where
    F: FnOnce(&mut io::BufWriter<fs::File>) -> io::Result<()>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    let mut writer = io::BufWriter::with_capacity(8 * 1024, fs::File::create(tmp)?);
    f(&mut writer)?;
    writer.flush()?;
    drop(writer);
    fs::rename(tmp, path)?;
    Ok(())
}
