//! Printer profile, material matrix and the per-run context.
//!
//! Profiles and material matrices are plain JSON documents; every field has a
//! default so a profile only needs to name what differs from a stock setup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SpliceError};
use crate::geometry::BedShape;
use crate::msf::{MsfVersion, SpliceAlgorithm, MAX_MATERIAL_INDEX};
use crate::{Factor, Mm, DRIVE_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransitionMethod {
    None,
    Side,
    #[default]
    Tower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColorStrength {
    Weak,
    #[default]
    Medium,
    Strong,
}

impl ColorStrength {
    pub fn index(self) -> usize {
        match self {
            ColorStrength::Weak => 0,
            ColorStrength::Medium => 1,
            ColorStrength::Strong => 2,
        }
    }
}

/// One of the splicer's input drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSlot {
    /// 0 means no material is loaded on this drive.
    pub material_index: u8,
    pub name: String,
    pub strength: ColorStrength,
}

impl Default for DriveSlot {
    fn default() -> Self {
        DriveSlot {
            material_index: 1,
            name: "PLA".into(),
            strength: ColorStrength::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionSettings {
    /// Purge length used when interpolation is off.
    pub purge_length: Mm,
    pub min_purge_length: Mm,
    pub max_purge_length: Mm,
    /// Fraction of the transition, from its start, at which the splice lands.
    pub target_position: Factor,
    pub use_interpolation: bool,
    pub infill_dump: bool,
    /// Layers starting below this much model extrusion use the reduced
    /// ziggurat purge. Zero disables the ziggurat.
    pub ziggurat_threshold: Mm,
    pub ziggurat_purge_factor: Factor,
}

impl Default for TransitionSettings {
    fn default() -> Self {
        TransitionSettings {
            purge_length: 130.0,
            min_purge_length: 60.0,
            max_purge_length: 200.0,
            target_position: 0.4,
            use_interpolation: false,
            infill_dump: false,
            ziggurat_threshold: 0.0,
            ziggurat_purge_factor: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TowerSettings {
    pub min_density: Factor,
    pub max_density: Factor,
    pub first_layer_min_density: Factor,
    pub raft_base_min_density: Factor,
    pub raft_top_min_density: Factor,
    pub ziggurat_roof_min_density: Factor,
    pub extrusion_width: Mm,
    /// Gap kept between the tower footprint and the model's bounding box.
    pub model_clearance: Mm,
    /// Gap kept between the tower footprint and the bed edge.
    pub bed_clearance: Mm,
    pub min_brim_length: Mm,
    pub max_brim_loops: usize,
}

impl Default for TowerSettings {
    fn default() -> Self {
        TowerSettings {
            min_density: 0.05,
            max_density: 1.0,
            first_layer_min_density: 0.6,
            raft_base_min_density: 0.8,
            raft_top_min_density: 0.5,
            ziggurat_roof_min_density: 0.35,
            extrusion_width: 0.45,
            model_clearance: 5.0,
            bed_clearance: 5.0,
            min_brim_length: 300.0,
            max_brim_loops: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BedEdge {
    North,
    South,
    East,
    West,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum PurgeLocation {
    /// Purge in place at a fixed point by jogging back and forth.
    Fixed { x: Mm, y: Mm },
    /// Purge along a bed edge, bouncing between clearance-limited endpoints.
    Edge { edge: BedEdge },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidePurgeSettings {
    pub location: PurgeLocation,
    pub lift: bool,
    /// Jog amplitude for in-place purging.
    pub jog_distance: Mm,
    /// Filament pushed per jog stroke.
    pub jog_extrusion: Mm,
    /// Filament per mm of travel when bouncing along an edge.
    pub edge_extrusion_per_mm: Factor,
    /// Inset from the edge line; negative values purge past the bed edge.
    pub edge_offset: Mm,
    pub feedrate: Mm,
}

impl Default for SidePurgeSettings {
    fn default() -> Self {
        SidePurgeSettings {
            location: PurgeLocation::Edge {
                edge: BedEdge::West,
            },
            lift: true,
            jog_distance: 1.0,
            jog_extrusion: 5.0,
            edge_extrusion_per_mm: 0.25,
            edge_offset: 2.0,
            feedrate: 600.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum PingSpacing {
    #[default]
    Linear,
    Exponential { base: Factor, max_spacing: Mm },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingSettings {
    pub enabled: bool,
    /// Filament extruded between the two pauses of a ping.
    pub window: Mm,
    pub min_spacing: Mm,
    pub spacing: PingSpacing,
    pub dwell_millis: u32,
}

impl Default for PingSettings {
    fn default() -> Self {
        PingSettings {
            enabled: true,
            window: 20.0,
            min_spacing: 350.0,
            spacing: PingSpacing::Linear,
            dwell_millis: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpliceSettings {
    pub first_piece_min_length: Mm,
    pub min_splice_length: Mm,
    /// Filament the splicer purges on its own after the last splice.
    pub hardware_purge_length: Mm,
    pub bowden_allowance: Mm,
    pub pulses_per_mm: f32,
    pub loading_offset: u32,
}

impl Default for SpliceSettings {
    fn default() -> Self {
        SpliceSettings {
            first_piece_min_length: 140.0,
            min_splice_length: 80.0,
            hardware_purge_length: 150.0,
            bowden_allowance: 100.0,
            pulses_per_mm: 30.0,
            loading_offset: 1500,
        }
    }
}

impl SpliceSettings {
    /// Loading offset expressed in filament length.
    pub fn loading_offset_mm(&self) -> Mm {
        if self.pulses_per_mm > 0.0 {
            self.loading_offset as Mm / self.pulses_per_mm
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterProfile {
    pub filament_diameter: Mm,
    pub nozzle_diameter: Mm,
    pub bed: BedShape,
    pub retract_distance_override: Option<Mm>,
    pub z_lift_override: Option<Mm>,
    pub transition_method: TransitionMethod,
    pub transitions: TransitionSettings,
    pub tower: TowerSettings,
    pub side_purge: SidePurgeSettings,
    pub pings: PingSettings,
    pub splice: SpliceSettings,
    pub msf_version: MsfVersion,
    pub drives: [DriveSlot; DRIVE_COUNT],
}

impl Default for PrinterProfile {
    fn default() -> Self {
        PrinterProfile {
            filament_diameter: 1.75,
            nozzle_diameter: 0.4,
            bed: BedShape::Rectangular {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 250.0,
                max_y: 210.0,
            },
            retract_distance_override: None,
            z_lift_override: None,
            transition_method: TransitionMethod::Tower,
            transitions: TransitionSettings::default(),
            tower: TowerSettings::default(),
            side_purge: SidePurgeSettings::default(),
            pings: PingSettings::default(),
            splice: SpliceSettings::default(),
            msf_version: MsfVersion::V1_4,
            drives: Default::default(),
        }
    }
}

impl PrinterProfile {
    pub fn from_file(path: &Path) -> Result<PrinterProfile> {
        let text = fs::read_to_string(path)?;
        let profile: PrinterProfile = serde_json::from_str(&text)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn filament_area(&self) -> Mm {
        let r = self.filament_diameter / 2.0;
        std::f32::consts::PI * r * r
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(SpliceError::InvalidConfig {
                reason: reason.into(),
            })
        };
        if self.filament_diameter <= 0.0 {
            return invalid("filament_diameter must be positive");
        }
        for drive in &self.drives {
            if drive.material_index > MAX_MATERIAL_INDEX {
                return invalid("drive material_index must be at most 15");
            }
            if drive.name.contains(|c: char| c == ';' || c == '\n') {
                return invalid("drive names cannot contain ';' or line breaks");
            }
        }
        let t = &self.transitions;
        if !(0.0..=1.0).contains(&t.target_position) {
            return invalid("transitions.target_position must be within [0, 1]");
        }
        if t.min_purge_length > t.max_purge_length {
            return invalid("transitions.min_purge_length exceeds max_purge_length");
        }
        let tower = &self.tower;
        if tower.min_density <= 0.0 || tower.min_density > tower.max_density {
            return invalid("tower density bounds must satisfy 0 < min <= max");
        }
        if tower.max_density > 1.0 {
            return invalid("tower.max_density cannot exceed 1");
        }
        if tower.extrusion_width <= 0.0 {
            return invalid("tower.extrusion_width must be positive");
        }
        let side = &self.side_purge;
        if side.jog_extrusion <= 0.0 || side.edge_extrusion_per_mm <= 0.0 || side.feedrate <= 0.0 {
            return invalid("side purge extrusion and feedrate must be positive");
        }
        if self.pings.enabled && (self.pings.window <= 0.0 || self.pings.min_spacing <= 0.0) {
            return invalid("ping window and spacing must be positive");
        }
        if let PingSpacing::Exponential { base, .. } = self.pings.spacing {
            if base < 1.0 {
                return invalid("exponential ping spacing base must be at least 1");
            }
        }
        Ok(())
    }
}

/// Purge interpolation and splice tuning per pair of materials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialMatrix {
    /// `purge_factors[from][to]` places the purge between the minimum (0.0)
    /// and maximum (1.0) purge length, indexed by color strength.
    pub purge_factors: [[Factor; 3]; 3],
    pub algorithms: Vec<SpliceAlgorithm>,
}

impl Default for MaterialMatrix {
    fn default() -> Self {
        MaterialMatrix {
            purge_factors: [
                [0.50, 0.25, 0.00],
                [0.75, 0.50, 0.25],
                [1.00, 0.75, 0.50],
            ],
            algorithms: vec![],
        }
    }
}

impl MaterialMatrix {
    pub fn from_file(path: &Path) -> Result<MaterialMatrix> {
        let text = fs::read_to_string(path)?;
        let materials: MaterialMatrix = serde_json::from_str(&text)?;
        materials.validate()?;
        Ok(materials)
    }

    pub fn validate(&self) -> Result<()> {
        for a in &self.algorithms {
            if a.ingoing > MAX_MATERIAL_INDEX || a.outgoing > MAX_MATERIAL_INDEX {
                return Err(SpliceError::InvalidConfig {
                    reason: format!(
                        "splice algorithm {}-{} names a material index above 15",
                        a.ingoing, a.outgoing
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn interpolate(&self, from: ColorStrength, to: ColorStrength, min: Mm, max: Mm) -> Mm {
        let factor = self.purge_factors[from.index()][to.index()].clamp(0.0, 1.0);
        min + (max - min) * factor
    }
}

/// Shared flag a caller can trip to stop the pipeline at the next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SpliceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything a stage needs to know about the run, passed explicitly.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub profile: PrinterProfile,
    pub materials: MaterialMatrix,
    /// Allows degraded results, such as an off-bed tower, instead of failing.
    pub advanced_mode: bool,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(profile: PrinterProfile) -> Context {
        Context {
            profile,
            ..Context::default()
        }
    }
}
