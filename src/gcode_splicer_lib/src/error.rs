use std::io;
use thiserror::Error;

use crate::Mm;

pub type Result<T> = std::result::Result<T, SpliceError>;

/// Every failure the pipeline can raise. None of these are retried; the whole
/// run unwinds to the caller.
#[derive(Error, Debug)]
pub enum SpliceError {
    #[error("Unsupported file extension: {extension:?}")]
    UnsupportedExtension { extension: String },

    #[error("Splice file version {version} is obsolete")]
    ObsoleteSpliceVersion { version: String },

    #[error("Malformed splice file at line {line}: {reason}")]
    MalformedSpliceFile { line: usize, reason: String },

    #[error("Could not parse G-code line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Tool T{tool} has no splicer drive (only T0-T3 are supported)")]
    UnsupportedTool { tool: u8 },

    #[error("No print layers detected")]
    NoPrintLayers,

    #[error("No tool changes detected")]
    NoTransitions,

    #[error("Could not determine the print bounding box")]
    IndeterminateBoundingBox,

    #[error("No infill extrusion found to derive an extrusion factor from")]
    NoExtrusionFactorSamples,

    #[error("Cannot position tower ({width:.1} x {depth:.1} mm) on the bed")]
    TowerUnplaceable { width: Mm, depth: Mm },

    #[error("Internal inconsistency: {detail}")]
    InternalInconsistency { detail: String },

    #[error("Invalid splice length at splice {index} ({length:.2} mm): {reason}")]
    InvalidSpliceLength {
        index: usize,
        length: Mm,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Configuration could not be read: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SpliceError {
    pub fn inconsistency(detail: impl Into<String>) -> Self {
        SpliceError::InternalInconsistency {
            detail: detail.into(),
        }
    }

    /// Process exit code; each detection failure gets its own.
    pub fn exit_code(&self) -> i32 {
        match self {
            SpliceError::UnsupportedExtension { .. } => 10,
            SpliceError::ObsoleteSpliceVersion { .. } => 11,
            SpliceError::MalformedSpliceFile { .. } => 12,
            SpliceError::Parse { .. } => 13,
            SpliceError::UnsupportedTool { .. } => 14,
            SpliceError::NoPrintLayers => 20,
            SpliceError::NoTransitions => 21,
            SpliceError::IndeterminateBoundingBox => 22,
            SpliceError::NoExtrusionFactorSamples => 23,
            SpliceError::TowerUnplaceable { .. } => 30,
            SpliceError::InternalInconsistency { .. } => 40,
            SpliceError::InvalidSpliceLength { .. } => 41,
            SpliceError::InvalidConfig { .. } => 50,
            SpliceError::Config(_) => 51,
            SpliceError::Cancelled => 60,
            SpliceError::Io(_) => 70,
        }
    }

    /// Longer explanation for the user, where there is something useful to say.
    pub fn detail(&self) -> Option<String> {
        match self {
            SpliceError::UnsupportedExtension { .. } => {
                Some("Expected a .gcode, .gco or .g file.".into())
            }
            SpliceError::ObsoleteSpliceVersion { .. } => {
                Some("Re-generate the splice file with a current version.".into())
            }
            SpliceError::NoPrintLayers => Some(
                "The file contains no layer with both extrusion and XY movement.".into(),
            ),
            SpliceError::NoTransitions => Some(
                "The print uses a single tool; there is nothing to splice.".into(),
            ),
            SpliceError::IndeterminateBoundingBox => Some(
                "No print layer has positive net extrusion with XY movement.".into(),
            ),
            SpliceError::NoExtrusionFactorSamples => Some(
                "Slice with infill enabled or with feature comments turned on.".into(),
            ),
            SpliceError::TowerUnplaceable { .. } => Some(
                "Move the model away from the bed edges or reduce the purge length.".into(),
            ),
            SpliceError::InternalInconsistency { .. } => Some(
                "Preflight analysis and output merge disagree about the transitions.".into(),
            ),
            _ => None,
        }
    }
}

/// Conditions worth telling the user about that do not stop processing.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    UnusualToolchangeRetraction { peak: Mm, retract_distance: Mm },
    TowerOffBed { x: Mm, y: Mm },
    DensityNotConverged { layer: usize, error: f32 },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::UnusualToolchangeRetraction {
                peak,
                retract_distance,
            } => write!(
                f,
                "toolchange retraction of {:.2} mm is unusual (regular retraction {:.2} mm); \
                 disable toolchange retraction in the slicer",
                peak, retract_distance
            ),
            Warning::TowerOffBed { x, y } => write!(
                f,
                "tower does not fit on the bed; placed off-bed at ({:.1}, {:.1})",
                x, y
            ),
            Warning::DensityNotConverged { layer, error } => write!(
                f,
                "tower layer {} purge is off by {:.2}% after density correction",
                layer,
                error * 100.0
            ),
        }
    }
}
