//! One forward pass over the input collecting everything later stages need:
//! which heights are print layers, where every tool change belongs, how the
//! slicer retracts and how fast it moves.

use log::{debug, info, warn};
use ordered_float::OrderedFloat;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::config::Context;
use crate::error::{Result, SpliceError, Warning};
use crate::gcode::Instruction;
use crate::geometry::{BoundingBox, Point2};
use crate::tape::{Motion, Tape};
use crate::zlift::{ZLiftClassifier, ZState};
use crate::{Factor, Mm, DRIVE_COUNT};

/// Shortest move whose extrusion ratio is trusted as a sample.
const MIN_SAMPLE_LENGTH: Mm = 1.0;
/// Layers this close in Z are the same layer.
const LAYER_KEY_SCALE: f32 = 10_000.0;
/// Candidate print layers at the bottom with this many extrusion moves or
/// fewer are priming blobs, not layers.
const PROBATION_MAX_MOVES: usize = 2;
const PROBATION_LAYERS: usize = 2;
const TOOLCHANGE_RETRACTION_CEILING: Mm = 20.0;

const DEFAULT_TRAVEL_FEEDRATE: Mm = 6000.0;
const DEFAULT_Z_FEEDRATE: Mm = 600.0;
const DEFAULT_PRINT_FEEDRATE: Mm = 1800.0;

fn layer_key(z: Mm) -> i64 {
    (z * LAYER_KEY_SCALE).round() as i64
}

/// Credit against a transition's tower purge from model infill printed
/// right after the change.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InfillDump {
    /// Purge that the following infill absorbs instead of the tower.
    pub usable: Mm,
    /// Length into the transition at which the infill takes over.
    pub offset: Mm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    /// Chronological index among all transitions.
    pub sequence: usize,
    pub from: u8,
    pub to: u8,
    /// Print layer index this change belongs to.
    pub layer: usize,
    /// Net model extrusion before the change.
    pub extrusion: Mm,
    /// Infill extruded right after the change, before anything else.
    pub following_infill: Mm,
    /// Purge needed to clear `from` out of the way of `to`.
    pub length: Mm,
    pub infill_dump: InfillDump,
    /// Padding purged before the splice point to keep pieces long enough.
    pub extra_piece_length: Mm,
}

impl TransitionRecord {
    /// Filament the tower (or side purge) receives for this transition.
    pub fn purge_length(&self) -> Mm {
        self.extra_piece_length + self.length - self.infill_dump.usable
    }

    /// Distance past the pre-change extrusion where the new drive begins.
    pub fn splice_offset(&self, target_position: Factor) -> Mm {
        self.extra_piece_length + self.length * target_position
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerStat {
    pub z: Mm,
    pub thickness: Mm,
    pub transitions: Vec<TransitionRecord>,
    /// Net model extrusion on this layer.
    pub extrusion: Mm,
    /// Net model extrusion when the layer starts.
    pub extrusion_before: Mm,
    pub extrusion_moves: usize,
    pub raft: bool,
    pub ziggurat: bool,
    pub print_speed: Mm,
    /// Extrusion per mm of path of the layer's infill moves.
    pub factor_samples: Vec<Factor>,
    /// Footprint the tower needs on this layer, set by tower sizing.
    pub required_area: Mm,
    /// Tower infill density, set by the tower builder.
    pub density: Factor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightClass {
    Print,
    Raft,
    NonPrint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Speeds {
    pub travel: Mm,
    pub z: Mm,
    pub first_layer: Mm,
    pub print: Mm,
    pub per_tool: [Option<Mm>; DRIVE_COUNT],
}

#[derive(Debug, Clone)]
pub struct PreflightReport {
    /// Print layers, bottom up.
    pub layers: Vec<LayerStat>,
    /// Every height the nozzle visited and what it was used for.
    pub heights: Vec<(Mm, HeightClass)>,
    pub retract_distance: Mm,
    pub firmware_retraction: bool,
    pub toolchange_retraction: Mm,
    pub speeds: Speeds,
    pub bounding_box: BoundingBox,
    pub z_lift: Mm,
    pub initial_tool: u8,
    pub drives_used: [bool; DRIVE_COUNT],
    pub total_extrusion: Mm,
    pub feature_comments: bool,
    pub warnings: Vec<Warning>,
}

impl PreflightReport {
    pub fn transition_count(&self) -> usize {
        self.layers.iter().map(|l| l.transitions.len()).sum()
    }

    /// All transitions in the order they happen.
    pub fn transitions(&self) -> Vec<&TransitionRecord> {
        let mut all: Vec<&TransitionRecord> =
            self.layers.iter().flat_map(|l| l.transitions.iter()).collect();
        all.sort_by_key(|t| t.sequence);
        all
    }

    pub fn transitions_mut(&mut self) -> Vec<&mut TransitionRecord> {
        let mut all: Vec<&mut TransitionRecord> = self
            .layers
            .iter_mut()
            .flat_map(|l| l.transitions.iter_mut())
            .collect();
        all.sort_by_key(|t| t.sequence);
        all
    }

    /// Print layer a height belongs to: the lowest print layer at or above it.
    pub fn layer_index_for(&self, z: Mm) -> Option<usize> {
        layer_index_for(&self.layers, z)
    }

    /// Print layer exactly at `z`.
    pub fn layer_at(&self, z: Mm) -> Option<usize> {
        let key = layer_key(z);
        self.layers.iter().position(|l| layer_key(l.z) == key)
    }
}

fn layer_index_for(layers: &[LayerStat], z: Mm) -> Option<usize> {
    if layers.is_empty() {
        return None;
    }
    let key = layer_key(z);
    Some(
        layers
            .iter()
            .position(|l| layer_key(l.z) >= key)
            .unwrap_or(layers.len() - 1),
    )
}

/// What a tool change does to the drive in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChangeEffect {
    /// Picks the starting drive; nothing was extruded yet.
    Select(u8),
    Transition { from: u8, to: u8 },
    /// The same tool again, or a tool that never extrudes before the next
    /// change or the end of the program.
    Ignored,
}

/// Classify the tool change at the cursor. The lines after the cursor are
/// the ones that follow the change.
pub fn tool_change_effect(tape: &mut Tape, current_tool: u8, extruded_so_far: Mm, tool: u8) -> ToolChangeEffect {
    if extruded_so_far <= 0.0 {
        ToolChangeEffect::Select(tool)
    } else if tool == current_tool || !extrudes_before_next_change(tape) {
        ToolChangeEffect::Ignored
    } else {
        ToolChangeEffect::Transition { from: current_tool, to: tool }
    }
}

fn extrudes_before_next_change(tape: &mut Tape) -> bool {
    let mut ahead = tape.lookahead();
    while ahead.step_forward() {
        if matches!(ahead.current(), Some(Instruction::ToolChange(_))) {
            return false;
        }
        if ahead.state().motion == Motion::Extrude {
            return true;
        }
    }
    false
}

/// Most frequent value, ties going to the smaller value.
#[derive(Debug, Default)]
pub struct Histogram {
    counts: HashMap<OrderedFloat<f32>, usize>,
}

impl Histogram {
    pub fn add(&mut self, value: f32) {
        let rounded = (value * 1e5).round() / 1e5;
        *self.counts.entry(OrderedFloat(rounded)).or_insert(0) += 1;
    }

    pub fn mode(&self) -> Option<(f32, usize)> {
        self.counts
            .iter()
            .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then(vb.cmp(va)))
            .map(|(v, c)| (v.into_inner(), *c))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feature {
    Unknown,
    Infill,
    Raft,
    Other,
}

struct FeatureDetector {
    feature: Regex,
    layer: Regex,
}

impl FeatureDetector {
    fn new() -> FeatureDetector {
        FeatureDetector {
            feature: Regex::new(r"(?i)^\s*(?:type:|feature\s+|structure:)\s*(?<name>.+?)\s*$")
                .expect("feature pattern"),
            layer: Regex::new(r"^\s*LAYER:(-?)\d+").expect("layer pattern"),
        }
    }

    /// `Some(true)` for a raft layer marker, `Some(false)` for a model layer.
    fn layer_marker(&self, comment: &str) -> Option<bool> {
        self.layer
            .captures(comment)
            .map(|c| c.get(1).is_some_and(|m| m.as_str() == "-"))
    }

    fn classify(&self, comment: &str) -> Option<Feature> {
        let captures = self.feature.captures(comment)?;
        let name = captures["name"].to_ascii_lowercase();
        Some(if name.contains("raft") {
            Feature::Raft
        } else if name.contains("infill") || name == "fill" {
            Feature::Infill
        } else {
            Feature::Other
        })
    }
}

#[derive(Debug, Default)]
struct HeightAccumulator {
    extrusion: Mm,
    raft_extrusion: Mm,
    extrusion_moves: usize,
    extrusion_before: Option<Mm>,
    bounds: Option<BoundingBox>,
    speeds: Histogram,
    infill_samples: Vec<Factor>,
    untagged_samples: Vec<Factor>,
    raft_marked: bool,
}

struct PendingTransition {
    sequence: usize,
    from: u8,
    to: u8,
    print_z: Mm,
    extrusion: Mm,
    following_infill: Mm,
}

pub struct PreflightAnalyzer<'a> {
    cx: &'a Context,
}

impl<'a> PreflightAnalyzer<'a> {
    pub fn new(cx: &'a Context) -> PreflightAnalyzer<'a> {
        PreflightAnalyzer { cx }
    }

    pub fn analyze(&self, tape: &mut Tape) -> Result<PreflightReport> {
        let started = Instant::now();
        let detector = FeatureDetector::new();
        let mut heights: BTreeMap<i64, HeightAccumulator> = BTreeMap::new();
        let mut retractions = Histogram::default();
        let mut hops = Histogram::default();
        let mut travel_speeds = Histogram::default();
        let mut z_speeds = Histogram::default();
        let mut tool_speeds: Vec<Histogram> = (0..DRIVE_COUNT).map(|_| Histogram::default()).collect();
        let mut feature = Feature::Unknown;
        let mut feature_comments = false;
        let mut firmware_retraction = false;
        let mut classifier = ZLiftClassifier::new(0.0);
        let mut pending: Vec<PendingTransition> = vec![];
        // index into `pending` of the transition whose following infill is still being measured
        let mut dump_probe: Option<usize> = None;
        let mut change_retraction: Option<Mm> = None;
        let mut toolchange_retraction: Mm = 0.0;
        let mut current_tool: Option<u8> = None;
        let mut drives_used = [false; DRIVE_COUNT];
        let mut raft_layer_marker = false;

        tape.rewind();
        while tape.step_forward() {
            let before_state = tape.previous_state().clone();
            let previous_z_state = *classifier.state();
            let z_state = classifier.next_state(tape);
            if z_state != previous_z_state {
                if let Some(h) = z_state.hop_height() {
                    if !matches!(previous_z_state, ZState::Hop { .. } | ZState::HopDown { .. }) {
                        hops.add(h);
                    }
                }
            }
            let Some(instruction) = tape.current().cloned() else { continue };
            let state = tape.state().clone();

            match &instruction {
                Instruction::Comment(text) => {
                    if let Some(raft) = detector.layer_marker(text) {
                        raft_layer_marker = raft;
                    } else if let Some(f) = detector.classify(text) {
                        feature_comments = true;
                        feature = f;
                    }
                }
                Instruction::Retract => firmware_retraction = true,
                Instruction::ToolChange(t) => {
                    if *t as usize >= DRIVE_COUNT {
                        return Err(SpliceError::UnsupportedTool { tool: *t });
                    }
                    let tool = current_tool.unwrap_or(before_state.tool);
                    match tool_change_effect(tape, tool, before_state.total_extrusion, *t) {
                        ToolChangeEffect::Select(t) => current_tool = Some(t),
                        ToolChangeEffect::Transition { from, to } => {
                            let sequence = pending.len();
                            pending.push(PendingTransition {
                                sequence,
                                from,
                                to,
                                print_z: z_state.print_z(),
                                extrusion: before_state.total_extrusion,
                                following_infill: 0.0,
                            });
                            dump_probe = Some(sequence);
                            change_retraction = Some(state.retraction);
                            drives_used[to as usize] = true;
                            current_tool = Some(to);
                        }
                        ToolChangeEffect::Ignored => debug!("T{} at z={:.3} is not a transition", t, state.z),
                    }
                }
                _ => {}
            }

            match state.motion {
                Motion::Retract if !matches!(instruction, Instruction::Retract) => {
                    retractions.add(state.retraction - before_state.retraction);
                }
                Motion::Travel => {
                    if let Instruction::Move { f: Some(f), .. } = instruction {
                        travel_speeds.add(f);
                    }
                }
                Motion::ZOnly => {
                    if let Instruction::Move { f: Some(f), .. } = instruction {
                        z_speeds.add(f);
                    }
                }
                _ => {}
            }
            if let Some(r) = change_retraction.as_mut() {
                *r = r.max(state.retraction);
            }

            if state.motion != Motion::Extrude {
                continue;
            }
            let tool = current_tool.unwrap_or(state.tool);
            if current_tool.is_none() {
                current_tool = Some(tool);
            }
            drives_used[tool as usize % DRIVE_COUNT] = true;
            if let Some(r) = change_retraction.take() {
                toolchange_retraction = toolchange_retraction.max(r);
            }
            let from = Point2::new(before_state.x, before_state.y);
            let to = Point2::new(state.x, state.y);
            let length = from.distance(to);
            let acc = heights.entry(layer_key(state.z)).or_default();
            acc.extrusion += state.extruded;
            if feature == Feature::Raft || raft_layer_marker {
                acc.raft_extrusion += state.extruded;
                acc.raft_marked |= raft_layer_marker;
            }
            if let Some(probe) = dump_probe {
                if feature == Feature::Infill && layer_key(state.z) == layer_key(pending[probe].print_z) {
                    pending[probe].following_infill += state.extruded;
                } else {
                    dump_probe = None;
                }
            }
            if length <= 0.0 {
                continue;
            }
            acc.extrusion_moves += 1;
            acc.extrusion_before.get_or_insert(before_state.total_extrusion);
            match acc.bounds.as_mut() {
                Some(b) => {
                    b.include(from);
                    b.include(to);
                }
                None => {
                    let mut b = BoundingBox { min: to, max: to };
                    b.include(from);
                    acc.bounds = Some(b);
                }
            }
            if let Instruction::Move { f, .. } = instruction {
                let feed = f.unwrap_or(state.feedrate);
                if feed > 0.0 {
                    acc.speeds.add(feed);
                    tool_speeds[tool as usize % DRIVE_COUNT].add(feed);
                }
            }
            if length >= MIN_SAMPLE_LENGTH {
                let sample = state.extruded / length;
                if feature == Feature::Infill {
                    acc.infill_samples.push(sample);
                }
                acc.untagged_samples.push(sample);
            }
        }
        let total_extrusion = tape.state().total_extrusion;
        tape.rewind();

        // Print layer candidates, then probation at the bottom.
        let mut candidates: Vec<i64> = heights
            .iter()
            .filter(|(_, a)| a.extrusion_moves > 0 && a.extrusion > 0.0)
            .map(|(k, _)| *k)
            .collect();
        let mut probation_checked = 0;
        candidates.retain(|k| {
            if probation_checked >= PROBATION_LAYERS {
                return true;
            }
            probation_checked += 1;
            let keep = heights[k].extrusion_moves > PROBATION_MAX_MOVES;
            if !keep {
                debug!("dropping candidate print layer at z={} (priming only)", *k as f32 / LAYER_KEY_SCALE);
            }
            keep
        });
        if candidates.is_empty() {
            return Err(SpliceError::NoPrintLayers);
        }

        let mut layers: Vec<LayerStat> = Vec::with_capacity(candidates.len());
        let mut bounding_box: Option<BoundingBox> = None;
        let mut previous_z = 0.0;
        for key in &candidates {
            let acc = heights.get_mut(key).ok_or_else(|| SpliceError::inconsistency("lost layer"))?;
            let z = *key as f32 / LAYER_KEY_SCALE;
            if acc.extrusion > 0.0 {
                if let Some(b) = acc.bounds {
                    match bounding_box.as_mut() {
                        Some(bb) => {
                            bb.include(b.min);
                            bb.include(b.max);
                        }
                        None => bounding_box = Some(b),
                    }
                }
            }
            let samples = if feature_comments {
                std::mem::take(&mut acc.infill_samples)
            } else {
                std::mem::take(&mut acc.untagged_samples)
            };
            layers.push(LayerStat {
                z,
                thickness: z - previous_z,
                transitions: vec![],
                extrusion: acc.extrusion,
                extrusion_before: acc.extrusion_before.unwrap_or(0.0),
                extrusion_moves: acc.extrusion_moves,
                raft: acc.raft_marked || acc.raft_extrusion > acc.extrusion * 0.5,
                ziggurat: false,
                print_speed: acc.speeds.mode().map(|(v, _)| v).unwrap_or(0.0),
                factor_samples: samples,
                required_area: 0.0,
                density: 0.0,
            });
            previous_z = z;
        }
        let bounding_box = bounding_box.ok_or(SpliceError::IndeterminateBoundingBox)?;

        if pending.is_empty() {
            return Err(SpliceError::NoTransitions);
        }
        for p in pending {
            let layer = layer_index_for(&layers, p.print_z)
                .ok_or_else(|| SpliceError::inconsistency("transition without a layer"))?;
            layers[layer].transitions.push(TransitionRecord {
                sequence: p.sequence,
                from: p.from,
                to: p.to,
                layer,
                extrusion: p.extrusion,
                following_infill: p.following_infill,
                length: 0.0,
                infill_dump: InfillDump::default(),
                extra_piece_length: 0.0,
            });
        }

        let steady = {
            let mut h = Histogram::default();
            for l in layers.iter().skip(1) {
                if l.print_speed > 0.0 {
                    h.add(l.print_speed);
                }
            }
            h.mode().map(|(v, _)| v)
        };
        let first_layer = if layers[0].print_speed > 0.0 {
            layers[0].print_speed
        } else {
            DEFAULT_PRINT_FEEDRATE
        };
        let print = steady.unwrap_or(first_layer);
        for l in layers.iter_mut() {
            if l.print_speed <= 0.0 {
                l.print_speed = print;
            }
        }
        let mut per_tool = [None; DRIVE_COUNT];
        for (slot, h) in per_tool.iter_mut().zip(&tool_speeds) {
            *slot = h.mode().map(|(v, _)| v);
        }
        let speeds = Speeds {
            travel: travel_speeds.mode().map(|(v, _)| v).unwrap_or(DEFAULT_TRAVEL_FEEDRATE),
            z: z_speeds.mode().map(|(v, _)| v).unwrap_or(DEFAULT_Z_FEEDRATE),
            first_layer,
            print,
            per_tool,
        };

        // Dedicated retract commands mean retraction lives in firmware.
        let detected_retraction = if firmware_retraction {
            0.0
        } else {
            retractions.mode().map(|(v, _)| v).unwrap_or(0.0)
        };
        let retract_distance = self.cx.profile.retract_distance_override.unwrap_or(detected_retraction);
        let detected_lift = match hops.mode() {
            Some((h, count)) if count > 1 => h,
            _ => 0.0,
        };
        let z_lift = self.cx.profile.z_lift_override.unwrap_or(detected_lift);

        let mut warnings = vec![];
        if !firmware_retraction
            && (toolchange_retraction > (2.0 * retract_distance).max(retract_distance + 0.5)
                || toolchange_retraction > TOOLCHANGE_RETRACTION_CEILING)
        {
            let w = Warning::UnusualToolchangeRetraction {
                peak: toolchange_retraction,
                retract_distance,
            };
            warn!("{}", w);
            warnings.push(w);
        }

        let print_keys: Vec<i64> = candidates.clone();
        let heights_out = heights
            .iter()
            .map(|(k, a)| {
                let class = if !print_keys.contains(k) {
                    HeightClass::NonPrint
                } else if a.raft_marked || a.raft_extrusion > a.extrusion * 0.5 {
                    HeightClass::Raft
                } else {
                    HeightClass::Print
                };
                (*k as f32 / LAYER_KEY_SCALE, class)
            })
            .collect();

        let initial_tool = layers
            .iter()
            .flat_map(|l| l.transitions.iter())
            .min_by_key(|t| t.sequence)
            .map(|t| t.from)
            .unwrap_or(0);
        drives_used[initial_tool as usize] = true;

        let report = PreflightReport {
            layers,
            heights: heights_out,
            retract_distance,
            firmware_retraction,
            toolchange_retraction,
            speeds,
            bounding_box,
            z_lift,
            initial_tool,
            drives_used,
            total_extrusion,
            feature_comments,
            warnings,
        };
        info!(
            "preflight - print layers: {} transitions: {} retract: {:.3} z-lift: {:.3} extrusion: {:.1} elapsed: {:.2?}",
            report.layers.len(),
            report.transition_count(),
            report.retract_distance,
            report.z_lift,
            report.total_extrusion,
            started.elapsed()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn analyze(program: &str) -> Result<PreflightReport> {
        let cx = Context::default();
        let mut tape = Tape::parse(program).unwrap();
        PreflightAnalyzer::new(&cx).analyze(&mut tape)
    }

    /// A square perimeter of 4 moves at the current height.
    fn square(x: f32, e: f32) -> String {
        format!(
            "G1 X{x} Y10 E{e} F1800\nG1 X{x2} Y10 E{e}\nG1 X{x2} Y20 E{e}\nG1 X{x} Y20 E{e}\n",
            x = x,
            x2 = x + 10.0,
            e = e
        )
    }

    fn two_layer_program() -> String {
        let mut p = String::from("G90\nM83\nT0\nG1 Z0.2 F600\nG0 X10 Y20 F9000\n");
        p += ";TYPE:FILL\n";
        p += &square(10.0, 0.5);
        p += "G1 E-0.8 F2400\nG0 X50 Y50 F9000\nG1 E0.8\n";
        p += "T1\n";
        p += &square(50.0, 0.5);
        p += "G1 E-0.8\nG1 Z0.6 F600\nG0 X10 Y10 F9000\nG1 Z0.4\nG1 E0.8\n";
        p += &square(10.0, 0.5);
        p += "T0\n";
        p += &square(10.0, 0.5);
        p
    }

    #[test]
    fn finds_layers_transitions_and_stats() {
        let report = analyze(&two_layer_program()).unwrap();
        assert_eq!(report.layers.len(), 2);
        assert_relative_eq!(report.layers[0].z, 0.2);
        assert_relative_eq!(report.layers[1].thickness, 0.2, epsilon = 1e-5);
        assert_eq!(report.transition_count(), 2);
        let t = report.transitions();
        assert_eq!((t[0].from, t[0].to, t[0].layer), (0, 1, 0));
        assert_eq!((t[1].from, t[1].to, t[1].layer), (1, 0, 1));
        assert_relative_eq!(t[0].extrusion, 2.0);
        assert_relative_eq!(report.retract_distance, 0.8);
        assert_relative_eq!(report.speeds.travel, 9000.0);
        assert_relative_eq!(report.speeds.first_layer, 1800.0);
        assert_eq!(report.drives_used, [true, true, false, false]);
        assert_relative_eq!(report.bounding_box.min.x, 10.0);
        assert_relative_eq!(report.bounding_box.max.x, 60.0);
        assert!(report.feature_comments);
        assert!(!report.layers[0].factor_samples.is_empty());
    }

    #[test]
    fn tool_change_without_extrusion_after_it_is_ignored() {
        let mut p = two_layer_program();
        p += "G1 E-0.8\nG1 Z10 F600\nT1\nM104 S0\n";
        let report = analyze(&p).unwrap();
        assert_eq!(report.transition_count(), 2);

        // T2 never prints, so the next transition starts from T1
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0, 0.5);
        p += "T1\n";
        p += &square(10.0, 0.5);
        p += "T2\nG0 X40 Y40\nT3\n";
        p += &square(10.0, 0.5);
        let report = analyze(&p).unwrap();
        let t = report.transitions();
        assert_eq!(t.len(), 2);
        assert_eq!((t[1].from, t[1].to), (1, 3));
        assert_eq!(report.drives_used, [true, true, false, true]);
    }

    #[test]
    fn lifted_tool_change_goes_to_the_next_layer() {
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0, 0.5);
        p += "G1 Z0.6\nT1\nG0 X10 Y10\nG1 Z0.4\n";
        p += &square(10.0, 0.5);
        let report = analyze(&p).unwrap();
        assert_eq!(report.transitions()[0].layer, 1);
    }

    #[test]
    fn hop_votes_need_repeats() {
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0, 0.5);
        p += "G1 Z0.6\nG0 X30\nG1 Z0.2\n";
        p += &square(10.0, 0.5);
        p += "T1\n";
        p += &square(10.0, 0.5);
        assert_relative_eq!(analyze(&p).unwrap().z_lift, 0.0);
        p += "G1 Z0.6\nG0 X30\nG1 Z0.2\n";
        p += &square(10.0, 0.5);
        assert_relative_eq!(analyze(&p).unwrap().z_lift, 0.4, epsilon = 1e-5);
    }

    #[test]
    fn priming_blob_is_not_a_layer() {
        let mut p = String::from("G90\nM83\nG1 Z0.1\nG1 X5 Y5 E3\n");
        p += "G1 Z0.3\n";
        p += &square(10.0, 0.5);
        p += "T1\n";
        p += &square(10.0, 0.5);
        let report = analyze(&p).unwrap();
        assert_eq!(report.layers.len(), 1);
        assert_relative_eq!(report.layers[0].z, 0.3);
        assert!(report
            .heights
            .iter()
            .any(|(z, c)| (*z - 0.1).abs() < 1e-4 && *c == HeightClass::NonPrint));
    }

    #[test]
    fn firmware_retraction_assumes_zero_distance() {
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0, 0.5);
        p += "G10\nT1\nG11\n";
        p += &square(10.0, 0.5);
        let report = analyze(&p).unwrap();
        assert!(report.firmware_retraction);
        assert_relative_eq!(report.retract_distance, 0.0);
    }

    #[test]
    fn warns_about_long_toolchange_retraction() {
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0, 0.5);
        p += "G1 E-0.8\nG1 E0.8\n";
        p += &square(10.0, 0.5);
        p += "G1 E-0.8\nG1 E0.8\n";
        p += "T1\nG1 E-15\nG1 E15\n";
        p += &square(10.0, 0.5);
        let report = analyze(&p).unwrap();
        assert!(matches!(
            report.warnings.as_slice(),
            [Warning::UnusualToolchangeRetraction { .. }]
        ));
    }

    #[test]
    fn single_tool_is_fatal() {
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0, 0.5);
        assert!(matches!(analyze(&p), Err(SpliceError::NoTransitions)));
    }

    #[test]
    fn travel_only_is_fatal() {
        assert!(matches!(
            analyze("G90\nG1 Z0.2\nG0 X10 Y10\nT1\nG0 X20"),
            Err(SpliceError::NoPrintLayers)
        ));
    }

    #[test]
    fn high_tools_are_rejected() {
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0, 0.5);
        p += "T5\n";
        assert!(matches!(analyze(&p), Err(SpliceError::UnsupportedTool { tool: 5 })));
    }
}
