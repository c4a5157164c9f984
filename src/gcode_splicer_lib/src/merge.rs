//! Rewrites the program for a single nozzle: tool changes become splices,
//! purges become detours to the tower or the side of the bed, and pings are
//! slipped into the purge.
//!
//! A detour always leaves the printer exactly as it found it: same height,
//! same outstanding retraction, same E register and coordinate modes. The
//! only difference is where in XY the print resumes, and that is either the
//! interrupted position or the target of the travel the print does next.

use log::{debug, info};
use std::time::Instant;

use crate::config::{Context, PingSettings, PingSpacing, PurgeLocation, TransitionMethod};
use crate::error::{Result, SpliceError};
use crate::gcode::{CoordinateMode, Instruction};
use crate::geometry::Point2;
use crate::msf::{MsfDrive, PingEntry, SpliceEntry, SpliceFile};
use crate::preflight::{tool_change_effect, PreflightReport, ToolChangeEffect, TransitionRecord};
use crate::tape::{Motion, Tape};
use crate::tower::{Stroke, Tower, TowerLayer};
use crate::transitions::closing_splice;
use crate::zlift::ZLiftClassifier;
use crate::{Mm, DRIVE_COUNT};

const RETRACT_FEEDRATE: Mm = 2400.0;
/// Extrusion below this is noise from float accumulation.
const E_EPSILON: Mm = 1e-5;
/// Shortfall a purge may have before it counts as running dry.
const PURGE_TOLERANCE: Mm = 1e-3;
const PING_START_MARGIN: f32 = 1.1;
const PING_LONG_TRANSITION: f32 = 2.2;

#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub splice_file: SpliceFile,
    /// Net filament the rewritten program extrudes.
    pub total_extrusion: Mm,
}

/// Where a detour has to put the printer back.
#[derive(Debug, Clone)]
struct Anchor {
    z: Mm,
    feedrate: Mm,
    retraction: Mm,
    firmware_retracted: bool,
    e_position: Mm,
    relative_xyz: bool,
    relative_e: bool,
    travel_z: Mm,
    reentry: Point2,
}

impl Anchor {
    /// Capture the printer state at the cursor. Looks ahead for the next XY
    /// move: when that is a plain travel the detour can return straight to
    /// its target.
    fn capture(tape: &mut Tape, travel_z: Mm) -> Anchor {
        let s = tape.state().clone();
        let at = Point2::new(s.x, s.y);
        let reentry = if s.relative_xyz { at } else { reentry_point(tape).unwrap_or(at) };
        Anchor {
            z: s.z,
            feedrate: s.feedrate,
            retraction: s.retraction,
            firmware_retracted: s.firmware_retracted,
            e_position: s.e_position,
            relative_xyz: s.relative_xyz,
            relative_e: s.relative_e,
            travel_z: travel_z.max(s.z),
            reentry,
        }
    }
}

fn reentry_point(tape: &mut Tape) -> Option<Point2> {
    let mut ahead = tape.lookahead();
    while ahead.step_forward() {
        let before = ahead.previous_state();
        let s = ahead.state();
        if s.x != before.x || s.y != before.y {
            return (s.motion == Motion::Travel).then(|| Point2::new(s.x, s.y));
        }
        if s.motion == Motion::Extrude {
            return None;
        }
    }
    None
}

/// Inserts generated moves at the tape cursor, in whatever E mode the
/// program is in at that point.
struct Emitter<'t> {
    tape: &'t mut Tape,
    travel_feed: Mm,
    z_feed: Mm,
    retract_distance: Mm,
    firmware: bool,
}

impl<'t> Emitter<'t> {
    fn total(&self) -> Mm {
        self.tape.state().total_extrusion
    }

    fn position(&self) -> Point2 {
        let s = self.tape.state();
        Point2::new(s.x, s.y)
    }

    fn emit(&mut self, instruction: Instruction) {
        self.tape.insert(instruction);
    }

    fn e_word(&self, delta: Mm) -> Mm {
        let s = self.tape.state();
        if s.relative_e {
            delta
        } else {
            s.e_position + delta
        }
    }

    /// Pull filament back until `target` mm are outstanding.
    fn retract_to(&mut self, target: Mm) {
        if self.firmware {
            if !self.tape.state().firmware_retracted {
                self.emit(Instruction::Retract);
            }
            return;
        }
        let amount = target - self.tape.state().retraction;
        if amount > E_EPSILON {
            let e = self.e_word(-amount);
            self.emit(Instruction::extrude_e(e, Some(RETRACT_FEEDRATE)));
        }
    }

    /// Bring the outstanding retraction to `target`, priming or retracting
    /// as needed. Firmware retraction only knows on or off.
    fn restore_retraction(&mut self, target: Mm, firmware_retracted: bool) {
        if self.firmware {
            match (self.tape.state().firmware_retracted, firmware_retracted) {
                (true, false) => self.emit(Instruction::Unretract),
                (false, true) => self.emit(Instruction::Retract),
                _ => {}
            }
            return;
        }
        let amount = self.tape.state().retraction - target;
        if amount > E_EPSILON {
            let e = self.e_word(amount);
            self.emit(Instruction::extrude_e(e, Some(RETRACT_FEEDRATE)));
        } else if amount < -E_EPSILON {
            self.retract_to(target);
        }
    }

    fn move_z(&mut self, z: Mm) {
        if (self.tape.state().z - z).abs() > 1e-4 {
            self.emit(Instruction::move_z(z, Some(self.z_feed)));
        }
    }

    fn travel(&mut self, p: Point2) {
        if self.position() != p {
            self.emit(Instruction::travel(p.x, p.y, Some(self.travel_feed)));
        }
    }

    fn stroke(&mut self, s: &Stroke, feed: Mm) {
        self.travel(s.from);
        if s.is_travel() {
            self.travel(s.to);
            return;
        }
        let f = (self.tape.state().feedrate != feed).then_some(feed);
        let e = self.e_word(s.extrusion);
        self.emit(Instruction::Move {
            rapid: false,
            x: Some(s.to.x),
            y: Some(s.to.y),
            z: None,
            e: Some(e),
            f,
        });
    }

    fn dwell(&mut self, millis: u32) {
        self.emit(Instruction::Dwell { millis });
    }
}

/// What a purge strategy has to provide; getting there, pinging and getting
/// back are shared.
trait Detour {
    /// First point of the purge, `None` when there is nothing left to print.
    fn entry(&self) -> Option<Point2>;
    fn purge_z(&self) -> Mm;
    fn feedrate(&self) -> Mm;
    fn next_stroke(&mut self) -> Option<Stroke>;
    /// Return the unprinted rest of a split stroke.
    fn put_back(&mut self, rest: Stroke);
    /// Extrusion still available.
    fn remaining(&self) -> Mm;
}

/// Progress through one tower layer's strokes, kept across detours.
#[derive(Debug, Clone, Default)]
struct StrokeCursor {
    next: usize,
    partial: Option<Stroke>,
}

/// A pass over tower strokes up to `end`.
struct TowerPass<'a> {
    layer: &'a TowerLayer,
    cursor: &'a mut StrokeCursor,
    end: usize,
    feedrate: Mm,
}

impl Detour for TowerPass<'_> {
    fn entry(&self) -> Option<Point2> {
        match &self.cursor.partial {
            Some(s) => Some(s.from),
            None => self.layer.strokes[..self.end].get(self.cursor.next).map(|s| s.from),
        }
    }

    fn purge_z(&self) -> Mm {
        self.layer.z
    }

    fn feedrate(&self) -> Mm {
        self.feedrate
    }

    fn next_stroke(&mut self) -> Option<Stroke> {
        if let Some(s) = self.cursor.partial.take() {
            return Some(s);
        }
        let s = self.layer.strokes[..self.end].get(self.cursor.next).copied()?;
        self.cursor.next += 1;
        Some(s)
    }

    fn put_back(&mut self, rest: Stroke) {
        self.cursor.partial = Some(rest);
    }

    fn remaining(&self) -> Mm {
        let partial = self.cursor.partial.map(|s| s.extrusion).unwrap_or(0.0);
        let start = self.cursor.next.min(self.end);
        partial + self.layer.strokes[start..self.end].iter().map(|s| s.extrusion).sum::<Mm>()
    }
}

/// Purging beside the print: jogging in place or bouncing along a bed edge.
struct SidePurge {
    a: Point2,
    b: Point2,
    extrusion_per_stroke: Mm,
    toward_b: bool,
    partial: Option<Stroke>,
    z: Mm,
    feedrate: Mm,
}

impl SidePurge {
    fn new(cx: &Context) -> SidePurge {
        let side = &cx.profile.side_purge;
        let (a, b, extrusion_per_stroke) = match side.location {
            PurgeLocation::Fixed { x, y } => {
                let a = Point2::new(x, y);
                (a, Point2::new(x + side.jog_distance, y), side.jog_extrusion)
            }
            PurgeLocation::Edge { edge } => {
                let (a, b) = cx.profile.bed.edge_segment(edge, side.edge_offset, cx.profile.tower.bed_clearance);
                (a, b, a.distance(b) * side.edge_extrusion_per_mm)
            }
        };
        SidePurge {
            a,
            b,
            extrusion_per_stroke,
            toward_b: true,
            partial: None,
            z: 0.0,
            feedrate: side.feedrate,
        }
    }
}

impl Detour for SidePurge {
    fn entry(&self) -> Option<Point2> {
        Some(match &self.partial {
            Some(s) => s.from,
            None if self.toward_b => self.a,
            None => self.b,
        })
    }

    fn purge_z(&self) -> Mm {
        self.z
    }

    fn feedrate(&self) -> Mm {
        self.feedrate
    }

    fn next_stroke(&mut self) -> Option<Stroke> {
        if let Some(s) = self.partial.take() {
            return Some(s);
        }
        let (from, to) = if self.toward_b { (self.a, self.b) } else { (self.b, self.a) };
        self.toward_b = !self.toward_b;
        Some(Stroke { from, to, extrusion: self.extrusion_per_stroke })
    }

    fn put_back(&mut self, rest: Stroke) {
        self.partial = Some(rest);
    }

    fn remaining(&self) -> Mm {
        Mm::INFINITY
    }
}

/// Decides when pings are due and whether one fits.
#[derive(Debug, Clone)]
pub struct PingScheduler {
    settings: PingSettings,
    next_start: Mm,
    count: i32,
}

impl PingScheduler {
    pub fn new(settings: &PingSettings) -> PingScheduler {
        PingScheduler {
            settings: settings.clone(),
            next_start: settings.min_spacing,
            count: 0,
        }
    }

    pub fn due(&self, at: Mm) -> bool {
        self.settings.enabled && at >= self.next_start
    }

    /// A ping only starts with enough purge left to finish it well before the
    /// transition ends; long transitions may run it up to their end.
    pub fn fits(&self, remaining: Mm, transition: Mm) -> bool {
        let w = self.settings.window;
        remaining >= PING_START_MARGIN * w || (transition > PING_LONG_TRANSITION * w && remaining >= w)
    }

    pub fn spacing(&self, completed: i32) -> Mm {
        match self.settings.spacing {
            PingSpacing::Linear => self.settings.min_spacing,
            PingSpacing::Exponential { base, max_spacing } => (self.settings.min_spacing
                * base.powi(completed - 1))
            .min(max_spacing)
            .max(self.settings.min_spacing),
        }
    }

    pub fn record(&mut self, start: Mm, end: Mm) -> PingEntry {
        self.count += 1;
        self.next_start = start + self.spacing(self.count);
        PingEntry { start, end: Some(end) }
    }
}

pub struct OutputMergeEngine<'a> {
    cx: &'a Context,
    report: &'a PreflightReport,
    tower: Option<&'a Tower>,
}

/// Mutable bookkeeping of one merge run.
struct Run<'a> {
    transitions: Vec<&'a TransitionRecord>,
    next_transition: usize,
    cursors: Vec<StrokeCursor>,
    visited: Vec<bool>,
    left_in_layer: Vec<usize>,
    pings: PingScheduler,
    splices: Vec<SpliceEntry>,
    ping_log: Vec<PingEntry>,
}

impl<'a> OutputMergeEngine<'a> {
    pub fn new(cx: &'a Context, report: &'a PreflightReport, tower: Option<&'a Tower>) -> OutputMergeEngine<'a> {
        OutputMergeEngine { cx, report, tower }
    }

    pub fn run(&self, tape: &mut Tape) -> Result<MergeOutput> {
        let started = Instant::now();
        let profile = &self.cx.profile;
        let method = profile.transition_method;
        if method == TransitionMethod::Tower && self.tower.is_none() {
            return Err(SpliceError::inconsistency("tower transitions without a tower"));
        }
        let tower_layers = self.tower.map(|t| t.layers.len()).unwrap_or(0);
        let mut run = Run {
            transitions: self.report.transitions(),
            next_transition: 0,
            cursors: vec![StrokeCursor::default(); tower_layers],
            visited: vec![false; tower_layers],
            left_in_layer: self
                .tower
                .map(|t| t.layers.iter().map(|l| l.transitions).collect())
                .unwrap_or_default(),
            pings: PingScheduler::new(&profile.pings),
            splices: vec![],
            ping_log: vec![],
        };
        let mut side = SidePurge::new(self.cx);
        let mut classifier = ZLiftClassifier::new(self.report.z_lift);
        let mut current_tool: Option<u8> = None;

        tape.rewind();
        let mut out = Emitter {
            tape: &mut *tape,
            travel_feed: self.report.speeds.travel,
            z_feed: self.report.speeds.z,
            retract_distance: self.report.retract_distance,
            firmware: self.report.firmware_retraction,
        };
        while out.tape.step_forward() {
            let z_state = classifier.next_state(out.tape);
            let Some(instruction) = out.tape.current().cloned() else { continue };
            let state = out.tape.state().clone();

            if let Instruction::ToolChange(t) = instruction {
                let before = out.tape.previous_state().clone();
                let tool = current_tool.unwrap_or(before.tool);
                out.tape.delete_current()?;
                let to = match tool_change_effect(out.tape, tool, before.total_extrusion, t) {
                    ToolChangeEffect::Select(t) => {
                        current_tool = Some(t);
                        continue;
                    }
                    ToolChangeEffect::Ignored => continue,
                    ToolChangeEffect::Transition { to, .. } => to,
                };
                current_tool = Some(to);
                let record = *run
                    .transitions
                    .get(run.next_transition)
                    .ok_or_else(|| SpliceError::inconsistency("more tool changes than preflight found"))?;
                let layer = self.report.layer_index_for(z_state.print_z());
                if record.from != tool || record.to != to || layer != Some(record.layer) {
                    return Err(SpliceError::inconsistency(format!(
                        "tool change T{}->T{} on layer {:?} does not match planned T{}->T{} on layer {}",
                        tool, to, layer, record.from, record.to, record.layer
                    )));
                }
                run.next_transition += 1;
                debug!(
                    "transition {} T{}->T{} at {:.2} mm, tower advance {:?}",
                    record.sequence,
                    tool,
                    to,
                    out.total(),
                    z_state.advance()
                );
                match method {
                    TransitionMethod::None => {
                        let at = out.total();
                        run.splices.push(SpliceEntry { drive: tool, length: at });
                    }
                    TransitionMethod::Side => {
                        let travel_z = if profile.side_purge.lift { classifier.travel_z() } else { state.z };
                        let anchor = Anchor::capture(out.tape, travel_z);
                        side.z = anchor.travel_z;
                        let start = out.total();
                        let amount = record.purge_length();
                        out.emit(Instruction::comment(format!(" splicer: side purge T{} -> T{}", tool, to)));
                        self.enter(&mut out, &mut side, &anchor);
                        let purged = self.purge(&mut out, &mut side, Some(amount), amount, &mut run)?;
                        self.leave(&mut out, &anchor);
                        check_purged(record, amount, purged)?;
                        run.splices.push(SpliceEntry {
                            drive: tool,
                            length: start + record.splice_offset(profile.transitions.target_position),
                        });
                    }
                    TransitionMethod::Tower => {
                        self.tower_transition(&mut out, record, classifier.travel_z(), &mut run)?;
                    }
                }
                continue;
            }

            if method == TransitionMethod::Tower && state.motion == Motion::Extrude {
                self.print_sparse_layer(&mut out, state.z, classifier.travel_z(), &mut run)?;
            }
        }

        if run.next_transition != run.transitions.len() {
            return Err(SpliceError::inconsistency(format!(
                "{} of {} planned transitions found while merging",
                run.next_transition,
                run.transitions.len()
            )));
        }
        let total_extrusion = out.total();
        let last = run.splices.last().map(|s| s.length).unwrap_or(0.0);
        let final_tool = current_tool.unwrap_or(self.report.initial_tool);
        run.splices.push(SpliceEntry {
            drive: final_tool,
            length: closing_splice(self.cx, total_extrusion, last),
        });

        let splice_file = self.splice_file(run.splices, run.ping_log);
        splice_file.validate_lengths(profile.splice.first_piece_min_length, profile.splice.min_splice_length)?;
        info!(
            "merge - splices: {} pings: {} output extrusion: {:.1} elapsed: {:.2?}",
            splice_file.splices.len(),
            splice_file.pings.len(),
            total_extrusion,
            started.elapsed()
        );
        tape.rewind();
        Ok(MergeOutput {
            splice_file,
            total_extrusion,
        })
    }

    fn tower_transition(
        &self,
        out: &mut Emitter<'_>,
        record: &TransitionRecord,
        travel_z: Mm,
        run: &mut Run<'_>,
    ) -> Result<()> {
        let tower = self
            .tower
            .ok_or_else(|| SpliceError::inconsistency("tower transitions without a tower"))?;
        let index = record.layer;
        let layer = tower
            .layers
            .get(index)
            .ok_or_else(|| SpliceError::inconsistency(format!("no tower layer {}", index)))?;
        let left = run
            .left_in_layer
            .get_mut(index)
            .filter(|left| **left > 0)
            .ok_or_else(|| SpliceError::inconsistency(format!("tower layer {} has no transitions left", index)))?;
        *left -= 1;
        let last_in_layer = *left == 0;

        let anchor = Anchor::capture(out.tape, travel_z);
        let feedrate = self.tower_feedrate(index);
        out.emit(Instruction::comment(format!(
            " splicer: tower layer {} T{} -> T{}",
            index, record.from, record.to
        )));
        let first_visit = !run.visited[index];
        run.visited[index] = true;
        let mut cursor = std::mem::take(&mut run.cursors[index]);
        let mut entered = false;
        if first_visit {
            let mut prefix = TowerPass { layer, cursor: &mut cursor, end: layer.infill_start, feedrate };
            if prefix.entry().is_some() {
                self.enter(out, &mut prefix, &anchor);
                entered = true;
                self.purge(out, &mut prefix, None, 0.0, run)?;
            }
        }
        let start = out.total();
        let mut pass = TowerPass { layer, cursor: &mut cursor, end: layer.strokes.len(), feedrate };
        let amount = if last_in_layer { None } else { Some(record.purge_length()) };
        let mut purged = 0.0;
        if pass.entry().is_some() {
            if !entered {
                self.enter(out, &mut pass, &anchor);
                entered = true;
            }
            let span = amount.unwrap_or_else(|| pass.remaining());
            purged = self.purge(out, &mut pass, amount, span, run)?;
        }
        if entered {
            self.leave(out, &anchor);
        }
        if let Some(wanted) = amount {
            check_purged(record, wanted, purged)?;
        }
        run.cursors[index] = cursor;
        run.splices.push(SpliceEntry {
            drive: record.from,
            length: start + record.splice_offset(self.cx.profile.transitions.target_position),
        });
        Ok(())
    }

    /// Tower layers without transitions are printed whole, right before the
    /// model first extrudes on that layer.
    fn print_sparse_layer(&self, out: &mut Emitter<'_>, z: Mm, travel_z: Mm, run: &mut Run<'_>) -> Result<()> {
        let Some(tower) = self.tower else { return Ok(()) };
        let Some(index) = self.report.layer_at(z) else { return Ok(()) };
        let Some(layer) = tower.layers.get(index) else { return Ok(()) };
        if layer.transitions > 0 || run.visited[index] {
            return Ok(());
        }
        run.visited[index] = true;
        out.tape.step_backward();
        let anchor = Anchor::capture(out.tape, travel_z);
        let feedrate = self.tower_feedrate(index);
        let mut cursor = StrokeCursor::default();
        let mut pass = TowerPass { layer, cursor: &mut cursor, end: layer.strokes.len(), feedrate };
        if pass.entry().is_some() {
            debug!("sparse tower layer {} at z={:.3}", index, layer.z);
            out.emit(Instruction::comment(format!(" splicer: tower layer {}", index)));
            self.enter(out, &mut pass, &anchor);
            let span = pass.remaining();
            self.purge(out, &mut pass, None, span, run)?;
            self.leave(out, &anchor);
        }
        out.tape.step_forward();
        Ok(())
    }

    fn tower_feedrate(&self, index: usize) -> Mm {
        if index == 0 {
            self.report.speeds.first_layer
        } else {
            self.report.speeds.print
        }
    }

    /// Retract, lift, travel to the detour and get ready to extrude there.
    fn enter(&self, out: &mut Emitter<'_>, detour: &mut dyn Detour, anchor: &Anchor) {
        if anchor.relative_xyz {
            out.emit(Instruction::CoordinateMode(CoordinateMode::AbsoluteXyz));
            if anchor.relative_e {
                out.emit(Instruction::CoordinateMode(CoordinateMode::RelativeE));
            }
        }
        out.retract_to(out.retract_distance.max(anchor.retraction));
        out.move_z(anchor.travel_z);
        if let Some(entry) = detour.entry() {
            out.travel(entry);
        }
        out.move_z(detour.purge_z());
        out.restore_retraction(0.0, false);
    }

    /// Extrude `amount` from the detour, or all of it for `None`, slipping in
    /// pings where they fit. `span` is the whole purge the pings must fit in;
    /// zero disables pings.
    fn purge(
        &self,
        out: &mut Emitter<'_>,
        detour: &mut dyn Detour,
        amount: Option<Mm>,
        span: Mm,
        run: &mut Run<'_>,
    ) -> Result<Mm> {
        let feed = detour.feedrate();
        let mut purged = 0.0;
        loop {
            let remaining = match amount {
                Some(a) => a - purged,
                None => detour.remaining(),
            };
            if remaining <= E_EPSILON {
                break;
            }
            if span > 0.0 && run.pings.due(out.total()) && run.pings.fits(remaining, span) {
                let settings = &self.cx.profile.pings;
                let start = out.total();
                out.dwell(settings.dwell_millis);
                let done = extrude_exactly(out, detour, settings.window);
                out.dwell(settings.dwell_millis);
                purged += done;
                debug!("ping at {:.2} mm", start);
                let ping = run.pings.record(start, start + done);
                run.ping_log.push(ping);
                continue;
            }
            let Some(stroke) = detour.next_stroke() else { break };
            let stroke = clip(stroke, remaining, detour);
            out.stroke(&stroke, feed);
            purged += stroke.extrusion;
        }
        Ok(purged)
    }

    /// Lift away from the detour, travel back and restore the printer state.
    fn leave(&self, out: &mut Emitter<'_>, anchor: &Anchor) {
        out.retract_to(out.retract_distance.max(anchor.retraction));
        let clear = anchor.travel_z.max(out.tape.state().z);
        out.move_z(clear);
        out.travel(anchor.reentry);
        out.move_z(anchor.z);
        out.restore_retraction(anchor.retraction, anchor.firmware_retracted);
        if !anchor.relative_e && (out.tape.state().e_position - anchor.e_position).abs() > E_EPSILON {
            out.emit(Instruction::SetPosition {
                x: None,
                y: None,
                z: None,
                e: Some(anchor.e_position),
            });
        }
        if anchor.feedrate > 0.0 && out.tape.state().feedrate != anchor.feedrate {
            out.emit(Instruction::Move {
                rapid: false,
                x: None,
                y: None,
                z: None,
                e: None,
                f: Some(anchor.feedrate),
            });
        }
        if anchor.relative_xyz {
            out.emit(Instruction::CoordinateMode(CoordinateMode::RelativeXyz));
            if !anchor.relative_e {
                out.emit(Instruction::CoordinateMode(CoordinateMode::AbsoluteE));
            }
        }
    }

    fn splice_file(&self, splices: Vec<SpliceEntry>, pings: Vec<PingEntry>) -> SpliceFile {
        let profile = &self.cx.profile;
        let mut file = SpliceFile::new(profile.msf_version);
        for i in 0..DRIVE_COUNT {
            let slot = &profile.drives[i];
            file.drives[i] = if self.report.drives_used[i] {
                MsfDrive {
                    material_index: slot.material_index,
                    name: slot.name.clone(),
                }
            } else {
                MsfDrive::default()
            };
        }
        file.pulses_per_mm = profile.splice.pulses_per_mm;
        file.loading_offset = profile.splice.loading_offset;
        file.splices = splices;
        file.pings = pings;
        if !file.version.has_ping_ends() {
            for ping in &mut file.pings {
                ping.end = None;
            }
        }
        if file.version.has_algorithms() {
            file.algorithms = self.cx.materials.algorithms.clone();
        }
        file
    }
}

/// A transition that got less purge than planned means the tower and the
/// transition list disagree.
fn check_purged(record: &TransitionRecord, wanted: Mm, purged: Mm) -> Result<()> {
    if wanted - purged > PURGE_TOLERANCE {
        return Err(SpliceError::inconsistency(format!(
            "transition {} T{}->T{} purged {:.2} of {:.2} mm",
            record.sequence, record.from, record.to, purged, wanted
        )));
    }
    Ok(())
}

/// Cut a stroke down to `limit`, handing the rest back to the detour.
fn clip(stroke: Stroke, limit: Mm, detour: &mut dyn Detour) -> Stroke {
    if stroke.is_travel() || stroke.extrusion <= limit + E_EPSILON {
        return stroke;
    }
    let (head, rest) = stroke.split_at_extrusion(limit);
    detour.put_back(rest);
    head
}

/// Print strokes until exactly `amount` is extruded or the detour runs dry.
fn extrude_exactly(out: &mut Emitter<'_>, detour: &mut dyn Detour, amount: Mm) -> Mm {
    let feed = detour.feedrate();
    let mut done = 0.0;
    while amount - done > E_EPSILON {
        let Some(stroke) = detour.next_stroke() else { break };
        let stroke = clip(stroke, amount - done, detour);
        out.stroke(&stroke, feed);
        done += stroke.extrusion;
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scheduler(spacing: PingSpacing) -> PingScheduler {
        PingScheduler::new(&PingSettings {
            spacing,
            ..PingSettings::default()
        })
    }

    #[test]
    fn linear_pings_are_evenly_spaced() {
        let mut s = scheduler(PingSpacing::Linear);
        assert!(!s.due(349.0));
        assert!(s.due(350.0));
        let p = s.record(355.0, 375.0);
        assert_eq!(p.end, Some(375.0));
        assert!(!s.due(700.0));
        assert!(s.due(705.0));
    }

    #[test]
    fn exponential_pings_spread_out_up_to_a_cap() {
        let s = scheduler(PingSpacing::Exponential { base: 2.0, max_spacing: 1000.0 });
        assert_relative_eq!(s.spacing(1), 350.0);
        assert_relative_eq!(s.spacing(2), 700.0);
        assert_relative_eq!(s.spacing(3), 1000.0);
    }

    #[test]
    fn ping_needs_room_before_the_transition_ends() {
        let s = scheduler(PingSpacing::Linear);
        // window 20: 22 mm must be left in a short transition
        assert!(!s.fits(21.0, 40.0));
        assert!(s.fits(22.5, 40.0));
        // a transition over 44 mm may run a ping to its very end
        assert!(s.fits(20.0, 45.0));
        assert!(!s.fits(19.0, 45.0));
    }

    #[test]
    fn side_purge_bounces_between_endpoints() {
        let cx = Context::default();
        let mut side = SidePurge::new(&cx);
        let a = side.next_stroke().unwrap();
        let b = side.next_stroke().unwrap();
        assert_eq!(a.from, b.to);
        assert_eq!(a.to, b.from);
        assert_relative_eq!(a.extrusion, a.length() * 0.25, epsilon = 1e-3);
    }

    #[test]
    fn extrude_splits_exactly_at_the_limit() {
        let cx = Context::default();
        let mut side = SidePurge::new(&cx);
        let mut tape = Tape::parse("G90\nM83\nG1 X10 Y10 E1").unwrap();
        while tape.step_forward() {}
        let mut out = Emitter {
            tape: &mut tape,
            travel_feed: 9000.0,
            z_feed: 600.0,
            retract_distance: 0.8,
            firmware: false,
        };
        let before = out.total();
        let per_stroke = side.extrusion_per_stroke;
        let done = extrude_exactly(&mut out, &mut side, per_stroke * 1.5);
        assert_relative_eq!(done, per_stroke * 1.5, epsilon = 1e-3);
        assert_relative_eq!(out.total() - before, per_stroke * 1.5, epsilon = 1e-3);
        assert!(side.partial.is_some());
    }
}
