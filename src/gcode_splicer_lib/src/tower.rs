//! The transition tower: a sacrificial block printed beside the model that
//! soaks up purge filament.
//!
//! Building it runs in a fixed order. Every print layer gets a footprint
//! area from the purge it must absorb. The tower is trimmed to the layers
//! that still see transitions, and extrusion factors are recovered from the
//! model's own infill. One rectangle is placed next to the model for all
//! layers. Each layer gets a density, its strokes are rasterized, and the
//! density is corrected until the infill extrudes what the transitions need.

use log::{debug, info, warn};
use std::time::Instant;

use crate::config::Context;
use crate::error::{Result, SpliceError, Warning};
use crate::geometry::{BoundingBox, Point2};
use crate::preflight::{LayerStat, PreflightReport};
use crate::{Factor, Mm};

/// Long over short side of the footprint, the square root of the golden ratio.
pub const GOLDEN_ASPECT: Factor = 1.272_019_6;
/// Neither side of the tower may shrink below this.
const MIN_TOWER_SIDE: Mm = 5.0;
const SHRINK_STEP: Factor = 0.9;
const MAX_PLACEMENT_STEPS: usize = 64;
/// Relative purge error a layer may be left with.
pub const CONVERGENCE_TOLERANCE: Factor = 0.001;
const MAX_CALIBRATION_PASSES: usize = 100;
const TRIM_FRACTION: Factor = 0.1;
/// Fewer infill samples than this and a layer uses the global factor.
const MIN_LAYER_SAMPLES: usize = 3;
/// Towers are sized for this share of the maximum density.
const SIZING_HEADROOM: Factor = 0.9;
/// Samples further than this factor from the trimmed mean are clipped.
const OUTLIER_CLIP: Factor = 0.5;

/// One straight nozzle move of the tower; zero extrusion means travel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stroke {
    pub from: Point2,
    pub to: Point2,
    pub extrusion: Mm,
}

impl Stroke {
    pub fn is_travel(&self) -> bool {
        self.extrusion <= 0.0
    }

    pub fn length(&self) -> Mm {
        self.from.distance(self.to)
    }

    /// Split so the first part extrudes `extrusion`.
    pub fn split_at_extrusion(&self, extrusion: Mm) -> (Stroke, Stroke) {
        let t = (extrusion / self.extrusion).clamp(0.0, 1.0);
        let mid = self.from.lerp(self.to, t);
        (
            Stroke { from: self.from, to: mid, extrusion },
            Stroke { from: mid, to: self.to, extrusion: self.extrusion - extrusion },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    First,
    RaftBase,
    RaftTop,
    ZigguratRoof,
    Regular,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TowerLayer {
    pub z: Mm,
    pub thickness: Mm,
    pub role: LayerRole,
    pub ziggurat: bool,
    pub transitions: usize,
    /// Purge the layer's infill has to absorb.
    pub purge: Mm,
    pub required_area: Mm,
    pub density: Factor,
    pub floor: Factor,
    /// Filament per mm of stroke.
    pub factor: Factor,
    pub strokes: Vec<Stroke>,
    /// Strokes before this index are brim and perimeters.
    pub infill_start: usize,
}

impl TowerLayer {
    pub fn prefix(&self) -> &[Stroke] {
        &self.strokes[..self.infill_start]
    }

    pub fn infill(&self) -> &[Stroke] {
        &self.strokes[self.infill_start..]
    }

    pub fn infill_extrusion(&self) -> Mm {
        self.infill().iter().map(|s| s.extrusion).sum()
    }

    pub fn prefix_extrusion(&self) -> Mm {
        self.prefix().iter().map(|s| s.extrusion).sum()
    }

    /// Relative difference between what the infill extrudes and the purge.
    pub fn purge_error(&self) -> Factor {
        if self.purge <= 0.0 {
            return 0.0;
        }
        (self.infill_extrusion() - self.purge) / self.purge
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tower {
    pub bounds: BoundingBox,
    /// Footprint of the reduced-purge bottom layers, never smaller than `bounds`.
    pub ziggurat_bounds: BoundingBox,
    pub layers: Vec<TowerLayer>,
    pub brim_loops: usize,
    pub brim_extrusion: Mm,
    /// Extrusion factor per mm of layer thickness, from the whole model.
    pub default_factor: Factor,
    pub raft_layers: usize,
    pub off_bed: bool,
    pub warnings: Vec<Warning>,
}

impl Tower {
    pub fn layer_bounds(&self, layer: &TowerLayer) -> BoundingBox {
        if layer.ziggurat {
            self.ziggurat_bounds
        } else {
            self.bounds
        }
    }
}

/// Mean of the middle 80% of the samples, computed again after clipping
/// whatever still sits far from that mean.
pub fn trimmed_mean(samples: &[Factor]) -> Option<Factor> {
    let mut sorted: Vec<Factor> = samples.iter().copied().filter(|s| s.is_finite() && *s > 0.0).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let trim = (sorted.len() as Factor * TRIM_FRACTION).floor() as usize;
    let kept = &sorted[trim..sorted.len() - trim];
    let mean = kept.iter().sum::<Factor>() / kept.len() as Factor;
    let (lo, hi) = (mean * (1.0 - OUTLIER_CLIP), mean * (1.0 + OUTLIER_CLIP));
    Some(kept.iter().map(|s| s.clamp(lo, hi)).sum::<Factor>() / kept.len() as Factor)
}

/// Extrusion per mm of line on a layer: its own samples when there are
/// enough, otherwise the model-wide factor scaled to its thickness.
fn layer_factor(stat: &LayerStat, default_factor: Factor) -> Factor {
    let fallback = default_factor * stat.thickness;
    if stat.factor_samples.len() < MIN_LAYER_SAMPLES {
        return fallback;
    }
    trimmed_mean(&stat.factor_samples).unwrap_or(fallback)
}

/// Sides (width along X, depth along Y) of a golden rectangle of `area`.
fn golden_sides(area: Mm) -> (Mm, Mm) {
    let long = (area * GOLDEN_ASPECT).sqrt();
    (long, area / long)
}

/// Margin that grows a `width` x `depth` rectangle evenly to `area`.
fn grow_margin(width: Mm, depth: Mm, area: Mm) -> Mm {
    if area <= width * depth {
        return 0.0;
    }
    let sum = width + depth;
    (-sum + (sum * sum - 4.0 * (width * depth - area)).sqrt()) / 4.0
}

#[derive(Debug, Clone, Copy)]
enum Side {
    West,
    East,
    North,
    South,
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    bounds: BoundingBox,
    ziggurat_bounds: BoundingBox,
    brim_loops: usize,
    off_bed: bool,
}

pub struct TransitionTowerBuilder<'a> {
    cx: &'a Context,
}

impl<'a> TransitionTowerBuilder<'a> {
    pub fn new(cx: &'a Context) -> TransitionTowerBuilder<'a> {
        TransitionTowerBuilder { cx }
    }

    fn width(&self) -> Mm {
        self.cx.profile.tower.extrusion_width
    }

    /// Inset from the footprint edge to the infill area.
    fn infill_inset(&self, role: LayerRole) -> Mm {
        if role == LayerRole::RaftBase {
            self.width()
        } else {
            2.0 * self.width()
        }
    }

    pub fn build(&self, report: &mut PreflightReport) -> Result<Tower> {
        let started = Instant::now();
        let count = report
            .layers
            .iter()
            .rposition(|l| !l.transitions.is_empty())
            .map(|i| i + 1)
            .ok_or(SpliceError::NoTransitions)?;
        debug!("tower trimmed to {} of {} print layers", count, report.layers.len());

        let default_factor = self.default_factor(report)?;
        self.size_layers(report, default_factor);
        let mut layers = self.tower_layers(report, count, default_factor);
        let raft_layers = layers
            .iter()
            .filter(|l| matches!(l.role, LayerRole::RaftBase | LayerRole::RaftTop))
            .count();

        let regular_area = layers
            .iter()
            .filter(|l| !l.ziggurat)
            .map(|l| l.required_area)
            .fold(0.0, Mm::max);
        let ziggurat_area = layers
            .iter()
            .filter(|l| l.ziggurat)
            .map(|l| l.required_area)
            .fold(0.0, Mm::max);
        let sizing_density = self.cx.profile.tower.max_density * SIZING_HEADROOM;
        let main_area = (if regular_area > 0.0 { regular_area } else { ziggurat_area }) / sizing_density;
        let ziggurat_area = ziggurat_area / sizing_density;
        let mut warnings = vec![];
        let placement = self.place(&report.bounding_box, main_area, ziggurat_area, &mut warnings)?;

        let mut tower = Tower {
            bounds: placement.bounds,
            ziggurat_bounds: placement.ziggurat_bounds,
            layers: vec![],
            brim_loops: placement.brim_loops,
            brim_extrusion: 0.0,
            default_factor,
            raft_layers,
            off_bed: placement.off_bed,
            warnings,
        };
        for (i, layer) in layers.iter_mut().enumerate() {
            let bounds = tower.layer_bounds(layer);
            let chosen = bounds.offset(-self.infill_inset(layer.role)).area();
            let initial = if chosen > 0.0 { layer.required_area / chosen } else { 0.0 };
            layer.density = initial.clamp(layer.floor, self.cx.profile.tower.max_density);
            report.layers[i].density = layer.density;
            self.rasterize(layer, i, &bounds, tower.brim_loops);
        }
        tower.layers = layers;
        tower.brim_extrusion = self.brim_extrusion(&tower);

        self.calibrate(&mut tower)?;
        for (stat, layer) in report.layers.iter_mut().zip(&tower.layers) {
            stat.density = layer.density;
        }
        info!(
            "tower - layers: {} size: {:.1} x {:.1} at ({:.1}, {:.1}) brim loops: {} elapsed: {:.2?}",
            tower.layers.len(),
            tower.bounds.width(),
            tower.bounds.depth(),
            tower.bounds.min.x,
            tower.bounds.min.y,
            tower.brim_loops,
            started.elapsed()
        );
        Ok(tower)
    }

    /// Infill area each print layer needs at full density to take its purge,
    /// never less than one ping window.
    pub fn size_layers(&self, report: &mut PreflightReport, default_factor: Factor) {
        let window = self.cx.profile.pings.window;
        let w = self.width();
        for layer in report.layers.iter_mut() {
            if layer.transitions.is_empty() || layer.thickness <= 0.0 {
                layer.required_area = 0.0;
                continue;
            }
            let purge: Mm = layer.transitions.iter().map(|t| t.purge_length()).sum();
            layer.required_area = purge.max(window) * w / layer_factor(layer, default_factor);
        }
    }

    fn default_factor(&self, report: &PreflightReport) -> Result<Factor> {
        let samples: Vec<Factor> = report
            .layers
            .iter()
            .filter(|l| l.thickness > 0.0)
            .flat_map(|l| l.factor_samples.iter().map(move |s| s / l.thickness))
            .collect();
        trimmed_mean(&samples).ok_or(SpliceError::NoExtrusionFactorSamples)
    }

    fn tower_layers(&self, report: &PreflightReport, count: usize, default_factor: Factor) -> Vec<TowerLayer> {
        let settings = &self.cx.profile.tower;
        let mut seen_raft = false;
        (0..count)
            .map(|i| {
                let stat = &report.layers[i];
                let roof = stat.ziggurat && !report.layers.get(i + 1).is_some_and(|n| n.ziggurat);
                let role = if stat.raft && !seen_raft {
                    LayerRole::RaftBase
                } else if stat.raft {
                    LayerRole::RaftTop
                } else if i == 0 {
                    LayerRole::First
                } else if roof {
                    LayerRole::ZigguratRoof
                } else {
                    LayerRole::Regular
                };
                seen_raft |= stat.raft;
                let mut floor = match role {
                    LayerRole::RaftBase => settings.raft_base_min_density,
                    LayerRole::RaftTop => settings.raft_top_min_density,
                    LayerRole::ZigguratRoof => settings.ziggurat_roof_min_density,
                    LayerRole::First | LayerRole::Regular => settings.min_density,
                };
                if i == 0 {
                    floor = floor.max(settings.first_layer_min_density);
                }
                let floor = floor.max(settings.min_density).min(settings.max_density);
                let factor = layer_factor(stat, default_factor);
                TowerLayer {
                    z: stat.z,
                    thickness: stat.thickness,
                    role,
                    ziggurat: stat.ziggurat,
                    transitions: stat.transitions.len(),
                    purge: stat.transitions.iter().map(|t| t.purge_length()).sum(),
                    required_area: stat.required_area,
                    density: floor,
                    floor,
                    factor,
                    strokes: vec![],
                    infill_start: 0,
                }
            })
            .collect()
    }

    fn brim_loops_for(&self, footprint: &BoundingBox) -> usize {
        let settings = &self.cx.profile.tower;
        let perimeter = 2.0 * (footprint.width() + footprint.depth());
        if settings.min_brim_length <= 0.0 || perimeter <= 0.0 {
            return 0;
        }
        let mut loops = 0;
        let mut total = 0.0;
        while total < settings.min_brim_length && loops < settings.max_brim_loops {
            loops += 1;
            let grown = footprint.offset(self.width() * (loops as Mm - 0.5));
            total += 2.0 * (grown.width() + grown.depth());
        }
        loops
    }

    fn place(
        &self,
        model: &BoundingBox,
        main_area: Mm,
        ziggurat_area: Mm,
        warnings: &mut Vec<Warning>,
    ) -> Result<Placement> {
        let settings = &self.cx.profile.tower;
        let bed = &self.cx.profile.bed;
        let inset = 2.0 * self.width();
        let keep_out = model.offset(settings.model_clearance);
        let (mut long, mut short) = golden_sides(main_area.max(MIN_TOWER_SIDE * MIN_TOWER_SIDE));

        // Footprint rectangles for infill sides (w, d), origin at zero.
        let footprint = |w: Mm, d: Mm| {
            let main = BoundingBox::new(0.0, 0.0, w + 2.0 * inset, d + 2.0 * inset);
            let margin = grow_margin(w, d, ziggurat_area);
            let ziggurat = main.offset(margin);
            let loops = self.brim_loops_for(&ziggurat);
            let outer = ziggurat.offset(self.width() * loops as Mm);
            (main, ziggurat, outer, loops)
        };

        let mut last_size = (0.0, 0.0);
        for step in 0..MAX_PLACEMENT_STEPS {
            if long.min(short) < MIN_TOWER_SIDE {
                break;
            }
            for (w, d) in [(short, long), (long, short)] {
                let (main, ziggurat, outer, loops) = footprint(w, d);
                last_size = (main.width(), main.depth());
                for side in [Side::West, Side::East, Side::North, Side::South] {
                    let Some(at) = self.try_side(&outer, &keep_out, side) else { continue };
                    let shift = at.min - outer.min;
                    debug!("tower placed {:?} of the model after {} size steps", side, step);
                    return Ok(Placement {
                        bounds: main.translate(shift),
                        ziggurat_bounds: ziggurat.translate(shift),
                        brim_loops: loops,
                        off_bed: false,
                    });
                }
            }
            long *= SHRINK_STEP;
            short /= SHRINK_STEP;
        }

        if !self.cx.advanced_mode {
            return Err(SpliceError::TowerUnplaceable {
                width: last_size.0,
                depth: last_size.1,
            });
        }
        let (w, d) = golden_sides(main_area.max(MIN_TOWER_SIDE * MIN_TOWER_SIDE));
        let (main, ziggurat, outer, loops) = footprint(d, w);
        let beds = bed.bounds();
        let target = Point2::new(
            beds.min.x - settings.bed_clearance - outer.width(),
            beds.center().y - outer.depth() / 2.0,
        );
        let shift = target - outer.min;
        let bounds = main.translate(shift);
        let warning = Warning::TowerOffBed {
            x: bounds.center().x,
            y: bounds.center().y,
        };
        warn!("{}", warning);
        warnings.push(warning);
        Ok(Placement {
            bounds,
            ziggurat_bounds: ziggurat.translate(shift),
            brim_loops: loops,
            off_bed: true,
        })
    }

    /// Put `outer` against one side of the keep-out box, then slide it along
    /// that side until the bed holds it.
    fn try_side(&self, outer: &BoundingBox, keep_out: &BoundingBox, side: Side) -> Option<BoundingBox> {
        let settings = &self.cx.profile.tower;
        let bed = &self.cx.profile.bed;
        let c = keep_out.center();
        let (w, d) = (outer.width(), outer.depth());
        let (origin, along_x) = match side {
            Side::West => (Point2::new(keep_out.min.x - w, c.y - d / 2.0), false),
            Side::East => (Point2::new(keep_out.max.x, c.y - d / 2.0), false),
            Side::North => (Point2::new(c.x - w / 2.0, keep_out.max.y), true),
            Side::South => (Point2::new(c.x - w / 2.0, keep_out.min.y - d), true),
        };
        let rect = BoundingBox::from_origin(origin, w, d);
        let moved = bed.nudge(&rect, settings.bed_clearance, along_x)?;
        (!moved.intersects(&keep_out.offset(-1e-3))).then_some(moved)
    }

    fn brim_extrusion(&self, tower: &Tower) -> Mm {
        let Some(first) = tower.layers.first() else { return 0.0 };
        let bounds = tower.layer_bounds(first);
        (1..=tower.brim_loops)
            .map(|i| {
                let g = bounds.offset(self.width() * (i as Mm - 0.5));
                2.0 * (g.width() + g.depth()) * first.factor
            })
            .sum()
    }

    /// Fill `layer.strokes`: brim loops on the first layer, perimeters and
    /// diagonal infill.
    pub fn rasterize(&self, layer: &mut TowerLayer, index: usize, bounds: &BoundingBox, brim_loops: usize) {
        let w = self.width();
        let factor = layer.factor;
        let mut strokes: Vec<Stroke> = vec![];
        if index == 0 {
            for i in (1..=brim_loops).rev() {
                push_loop(&mut strokes, &bounds.offset(w * (i as Mm - 0.5)), factor);
            }
        }
        push_loop(&mut strokes, &bounds.offset(-w / 2.0), factor);
        if layer.role != LayerRole::RaftBase {
            push_loop(&mut strokes, &bounds.offset(-1.5 * w), factor);
        }
        let infill_start = strokes.len();
        let area = bounds.offset(-self.infill_inset(layer.role));
        if layer.density > 0.0 && area.width() > 0.0 && area.depth() > 0.0 {
            let spacing = w / layer.density;
            let rising = index % 2 == 0;
            for (k, (a, b)) in diagonal_segments(&area, spacing, rising).into_iter().enumerate() {
                let (from, to) = if k % 2 == 0 { (a, b) } else { (b, a) };
                push_path(&mut strokes, &[from, to], factor);
            }
        }
        layer.strokes = strokes;
        layer.infill_start = infill_start;
    }

    /// Correct densities until every layer with transitions extrudes its purge
    /// within tolerance or is pinned at a density bound.
    pub fn calibrate(&self, tower: &mut Tower) -> Result<()> {
        let max_density = self.cx.profile.tower.max_density;
        let mut passes = 0;
        loop {
            self.cx.cancel.checkpoint()?;
            let mut changed = 0;
            for i in 0..tower.layers.len() {
                let layer = &tower.layers[i];
                if layer.transitions == 0 {
                    continue;
                }
                let error = layer.purge_error();
                if error.abs() < CONVERGENCE_TOLERANCE {
                    continue;
                }
                let step = error.abs().min(0.5);
                let scaled = if error < 0.0 {
                    layer.density / (1.0 - step)
                } else {
                    layer.density / (1.0 + step)
                };
                let density = scaled.clamp(layer.floor, max_density);
                if density == layer.density {
                    continue;
                }
                let bounds = tower.layer_bounds(layer);
                let brim_loops = tower.brim_loops;
                let layer = &mut tower.layers[i];
                layer.density = density;
                self.rasterize(layer, i, &bounds, brim_loops);
                changed += 1;
            }
            passes += 1;
            debug!("density pass {}: {} layers re-rasterized", passes, changed);
            if changed == 0 || passes >= MAX_CALIBRATION_PASSES {
                break;
            }
        }
        for (i, layer) in tower.layers.iter().enumerate() {
            let error = layer.purge_error();
            let pinned_low = error > 0.0 && layer.density <= layer.floor;
            if layer.transitions > 0 && error.abs() >= CONVERGENCE_TOLERANCE && !pinned_low {
                let warning = Warning::DensityNotConverged { layer: i, error };
                warn!("{}", warning);
                tower.warnings.push(warning);
            }
        }
        info!("tower densities settled after {} passes", passes);
        Ok(())
    }
}

fn push_path(strokes: &mut Vec<Stroke>, points: &[Point2], factor: Factor) {
    let Some(first) = points.first() else { return };
    if let Some(last) = strokes.last() {
        if last.to != *first {
            strokes.push(Stroke { from: last.to, to: *first, extrusion: 0.0 });
        }
    }
    for pair in points.windows(2) {
        let length = pair[0].distance(pair[1]);
        strokes.push(Stroke { from: pair[0], to: pair[1], extrusion: length * factor });
    }
}

fn push_loop(strokes: &mut Vec<Stroke>, rect: &BoundingBox, factor: Factor) {
    if rect.width() <= 0.0 || rect.depth() <= 0.0 {
        return;
    }
    let [a, b, c, d] = rect.corners();
    push_path(strokes, &[a, b, c, d, a], factor);
}

/// Parallel 45 degree chords of `rect`, `spacing` apart. Rising lines run
/// along (1, 1), falling ones along (1, -1).
pub fn diagonal_segments(rect: &BoundingBox, spacing: Mm, rising: bool) -> Vec<(Point2, Point2)> {
    let step = spacing * std::f32::consts::SQRT_2;
    let (c_min, c_max) = if rising {
        (rect.min.y - rect.max.x, rect.max.y - rect.min.x)
    } else {
        (rect.min.x + rect.min.y, rect.max.x + rect.max.y)
    };
    let mut segments = vec![];
    let mut c = c_min + step / 2.0;
    while c < c_max {
        let (x_lo, x_hi) = if rising {
            (rect.min.x.max(rect.min.y - c), rect.max.x.min(rect.max.y - c))
        } else {
            (rect.min.x.max(c - rect.max.y), rect.max.x.min(c - rect.min.y))
        };
        if x_lo < x_hi {
            let y = |x: Mm| if rising { x + c } else { c - x };
            segments.push((Point2::new(x_lo, y(x_lo)), Point2::new(x_hi, y(x_hi))));
        }
        c += step;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BedShape;
    use crate::preflight::{HeightClass, Speeds, TransitionRecord};
    use approx::assert_relative_eq;

    fn layer(z: Mm, transitions: usize, purge: Mm) -> LayerStat {
        LayerStat {
            z,
            thickness: 0.2,
            transitions: (0..transitions)
                .map(|i| TransitionRecord {
                    sequence: i,
                    from: (i % 2) as u8,
                    to: ((i + 1) % 2) as u8,
                    layer: 0,
                    extrusion: 0.0,
                    following_infill: 0.0,
                    length: purge,
                    infill_dump: Default::default(),
                    extra_piece_length: 0.0,
                })
                .collect(),
            extrusion: 100.0,
            extrusion_before: 0.0,
            extrusion_moves: 50,
            raft: false,
            ziggurat: false,
            print_speed: 1800.0,
            factor_samples: vec![0.033, 0.034, 0.033, 0.035, 0.032, 0.2],
            required_area: 0.0,
            density: 0.0,
        }
    }

    fn report(layers: Vec<LayerStat>, model: BoundingBox) -> PreflightReport {
        PreflightReport {
            layers,
            heights: vec![(0.2, HeightClass::Print)],
            retract_distance: 0.8,
            firmware_retraction: false,
            toolchange_retraction: 0.0,
            speeds: Speeds {
                travel: 9000.0,
                z: 600.0,
                first_layer: 1200.0,
                print: 1800.0,
                per_tool: [None; 4],
            },
            bounding_box: model,
            z_lift: 0.0,
            initial_tool: 0,
            drives_used: [true, true, false, false],
            total_extrusion: 1000.0,
            feature_comments: true,
            warnings: vec![],
        }
    }

    fn three_layers() -> Vec<LayerStat> {
        let mut layers = vec![layer(0.2, 1, 130.0), layer(0.4, 0, 0.0), layer(0.6, 2, 130.0), layer(0.8, 0, 0.0)];
        for (i, l) in layers.iter_mut().enumerate() {
            for t in l.transitions.iter_mut() {
                t.layer = i;
            }
        }
        layers
    }

    #[test]
    fn trimmed_mean_ignores_outliers() {
        let m = trimmed_mean(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 50.0]).unwrap();
        assert_relative_eq!(m, 1.0);
        assert!(trimmed_mean(&[]).is_none());
        assert!(trimmed_mean(&[0.0, -1.0]).is_none());
    }

    #[test]
    fn golden_rectangle_keeps_area_and_ratio() {
        let (long, short) = golden_sides(400.0);
        assert_relative_eq!(long * short, 400.0, epsilon = 1e-2);
        assert_relative_eq!(long / short, GOLDEN_ASPECT, epsilon = 1e-4);
        let m = grow_margin(10.0, 20.0, 400.0);
        assert_relative_eq!((10.0 + 2.0 * m) * (20.0 + 2.0 * m), 400.0, epsilon = 1e-2);
    }

    #[test]
    fn builds_trimmed_placed_and_calibrated_tower() {
        let cx = Context::default();
        let model = BoundingBox::new(100.0, 80.0, 150.0, 130.0);
        let mut r = report(three_layers(), model);
        let tower = TransitionTowerBuilder::new(&cx).build(&mut r).unwrap();

        assert_eq!(tower.layers.len(), 3);
        assert!(!tower.off_bed);
        let keep_out = model.offset(cx.profile.tower.model_clearance);
        let outer = tower.ziggurat_bounds.offset(tower.brim_loops as Mm * 0.45);
        assert!(!outer.intersects(&keep_out.offset(-1e-2)));
        assert!(cx.profile.bed.holds(&tower.bounds, cx.profile.tower.bed_clearance));

        let settings = &cx.profile.tower;
        for (i, l) in tower.layers.iter().enumerate() {
            assert!(l.density >= settings.min_density - 1e-6 && l.density <= settings.max_density + 1e-6);
            assert_relative_eq!(r.layers[i].density, l.density);
            if l.transitions > 0 {
                let converged = l.purge_error().abs() < CONVERGENCE_TOLERANCE;
                let pinned = l.density <= l.floor && l.purge_error() > 0.0;
                assert!(converged || pinned, "layer {} error {}", i, l.purge_error());
            }
        }
        assert_eq!(tower.layers[0].role, LayerRole::First);
        assert!(tower.layers[0].density >= settings.first_layer_min_density);
        assert!(tower.warnings.is_empty());
    }

    #[test]
    fn model_filling_the_bed_cannot_host_a_tower() {
        let mut cx = Context::default();
        cx.profile.bed = BedShape::Rectangular { min_x: 0.0, min_y: 0.0, max_x: 200.0, max_y: 200.0 };
        let model = BoundingBox::new(5.0, 5.0, 195.0, 195.0);
        let mut r = report(three_layers(), model);
        match TransitionTowerBuilder::new(&cx).build(&mut r) {
            Err(e @ SpliceError::TowerUnplaceable { .. }) => {
                assert!(e.to_string().starts_with("Cannot position tower"))
            }
            other => panic!("unexpected {:?}", other.map(|t| t.bounds)),
        }

        cx.advanced_mode = true;
        let mut r = report(three_layers(), model);
        let tower = TransitionTowerBuilder::new(&cx).build(&mut r).unwrap();
        assert!(tower.off_bed);
        assert!(tower.bounds.max.x < 0.0);
        assert!(matches!(tower.warnings.first(), Some(Warning::TowerOffBed { .. })));
    }

    #[test]
    fn circular_bed_placement_stays_on_bed() {
        let mut cx = Context::default();
        cx.profile.bed = BedShape::Circular { center_x: 0.0, center_y: 0.0, diameter: 200.0 };
        let model = BoundingBox::new(-30.0, -30.0, 30.0, 30.0);
        let mut r = report(three_layers(), model);
        let tower = TransitionTowerBuilder::new(&cx).build(&mut r).unwrap();
        assert!(cx.profile.bed.holds(&tower.bounds, cx.profile.tower.bed_clearance));
        assert!(!tower.bounds.intersects(&model.offset(cx.profile.tower.model_clearance)));
    }

    #[test]
    fn infill_stays_inside_and_alternates_direction() {
        let cx = Context::default();
        let builder = TransitionTowerBuilder::new(&cx);
        let bounds = BoundingBox::new(0.0, 0.0, 20.0, 15.0);
        let area = bounds.offset(-0.9);
        let mut slopes = vec![];
        for index in 0..2 {
            let mut l = TowerLayer {
                z: 0.2,
                thickness: 0.2,
                role: LayerRole::Regular,
                ziggurat: false,
                transitions: 1,
                purge: 100.0,
                required_area: 100.0,
                density: 0.3,
                floor: 0.05,
                factor: 0.03,
                strokes: vec![],
                infill_start: 0,
            };
            builder.rasterize(&mut l, index, &bounds, 0);
            let grown = area.offset(1e-3);
            for s in l.infill().iter().filter(|s| !s.is_travel()) {
                assert!(grown.contains(s.from) && grown.contains(s.to));
            }
            let first = l.infill().iter().find(|s| !s.is_travel()).unwrap();
            let d = first.to - first.from;
            slopes.push((d.y / d.x).signum());
        }
        assert_ne!(slopes[0], slopes[1]);
    }

    #[test]
    fn first_layer_has_enough_brim() {
        let cx = Context::default();
        let model = BoundingBox::new(100.0, 80.0, 150.0, 130.0);
        let mut r = report(three_layers(), model);
        let tower = TransitionTowerBuilder::new(&cx).build(&mut r).unwrap();
        assert!(tower.brim_loops > 0);
        let w = cx.profile.tower.extrusion_width;
        let brim_length: Mm = (1..=tower.brim_loops)
            .map(|i| {
                let g = tower.layer_bounds(&tower.layers[0]).offset(w * (i as Mm - 0.5));
                2.0 * (g.width() + g.depth())
            })
            .sum();
        assert!(brim_length >= cx.profile.tower.min_brim_length || tower.brim_loops == cx.profile.tower.max_brim_loops);
        assert!(tower.brim_extrusion > 0.0);
        assert!(tower.layers[1].prefix().len() < tower.layers[0].prefix().len());
    }

    #[test]
    fn stroke_split_is_exact() {
        let s = Stroke { from: Point2::new(0.0, 0.0), to: Point2::new(10.0, 0.0), extrusion: 1.0 };
        let (a, b) = s.split_at_extrusion(0.25);
        assert_relative_eq!(a.to.x, 2.5);
        assert_relative_eq!(a.extrusion + b.extrusion, 1.0);
        assert_eq!(a.to, b.from);
    }

    #[test]
    fn missing_samples_are_fatal() {
        let cx = Context::default();
        let mut layers = three_layers();
        for l in layers.iter_mut() {
            l.factor_samples.clear();
        }
        let mut r = report(layers, BoundingBox::new(100.0, 80.0, 150.0, 130.0));
        assert!(matches!(
            TransitionTowerBuilder::new(&cx).build(&mut r),
            Err(SpliceError::NoExtrusionFactorSamples)
        ));
    }
}
