pub mod config;
pub mod error;
pub mod gcode;
pub mod geometry;
pub mod merge;
pub mod msf;
pub mod pipeline;
pub mod preflight;
pub mod tape;
pub mod tower;
pub mod transitions;
pub mod zlift;

// This way we can switch to f64 easily for comparing memory and performance.
pub use f32 as Mm;
pub use f32 as Factor;

/// Input drives on the splicer; tools T0-T3 map onto them.
pub const DRIVE_COUNT: usize = 4;

pub use config::{CancellationToken, Context, MaterialMatrix, PrinterProfile, TransitionMethod};
pub use error::{Result, SpliceError, Warning};
pub use msf::{MsfVersion, SpliceFile};
pub use pipeline::{check_extension, process, process_files, SpliceOutput};
pub use tape::Tape;

/// Receives one call per named pipeline phase, for display only.
pub trait Progress {
    fn increment(&mut self, label: &str);
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl Progress for NoProgress {
    fn increment(&mut self, _label: &str) {}
}
