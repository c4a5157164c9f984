//! Purge lengths and piece padding for every transition.
//!
//! Splice positions are planned in output filament length: the model's own
//! extrusion plus every purge printed before. A splice lands at
//! `output before the change + extra + target_position * length`, and the
//! extra padding is chosen so no piece comes out shorter than the splicer can
//! handle.

use log::{debug, info};

use crate::config::{Context, TransitionMethod};
use crate::preflight::{InfillDump, PreflightReport};
use crate::Mm;

/// Margin kept above the minimum splice length when padding.
pub const PIECE_MARGIN: Mm = 10.0;

/// Purge length of every transition, before padding.
pub fn plan_lengths(report: &mut PreflightReport, cx: &Context) {
    let settings = &cx.profile.transitions;
    let drives = &cx.profile.drives;
    let uses_purge = cx.profile.transition_method != TransitionMethod::None;
    let ziggurat_enabled = settings.ziggurat_threshold > 0.0;
    for layer in report.layers.iter_mut() {
        layer.ziggurat = ziggurat_enabled && layer.extrusion_before < settings.ziggurat_threshold;
        for t in layer.transitions.iter_mut() {
            if !uses_purge {
                t.length = 0.0;
                continue;
            }
            let mut length = if settings.use_interpolation {
                cx.materials.interpolate(
                    drives[t.from as usize].strength,
                    drives[t.to as usize].strength,
                    settings.min_purge_length,
                    settings.max_purge_length,
                )
            } else {
                settings.purge_length
            };
            if layer.ziggurat {
                length *= settings.ziggurat_purge_factor;
            }
            t.length = length;
            t.infill_dump = if settings.infill_dump {
                let usable = t.following_infill.min(length * (1.0 - settings.target_position));
                InfillDump { usable, offset: length - usable }
            } else {
                InfillDump::default()
            };
        }
    }
}

/// Pad transitions so the first piece and every later piece are long enough.
/// Returns the planned splice positions in transition order.
pub fn pad(report: &mut PreflightReport, cx: &Context) -> Vec<Mm> {
    let tp = cx.profile.transitions.target_position;
    let splice = &cx.profile.splice;
    let uses_purge = cx.profile.transition_method != TransitionMethod::None;
    let mut purged_before: Mm = 0.0;
    let mut positions: Vec<Mm> = vec![];
    let mut padded = 0;
    for t in report.transitions_mut() {
        let unpadded = t.extrusion + purged_before + tp * t.length;
        let required = match positions.last() {
            None => splice.first_piece_min_length,
            Some(previous) => previous + splice.min_splice_length + PIECE_MARGIN,
        };
        t.extra_piece_length = if uses_purge && unpadded < required {
            padded += 1;
            debug!(
                "transition {} T{}->T{} padded by {:.2} mm",
                t.sequence,
                t.from,
                t.to,
                required - unpadded
            );
            required - unpadded
        } else {
            0.0
        };
        positions.push(unpadded + t.extra_piece_length);
        purged_before += t.purge_length();
    }
    info!("planned {} splices, {} padded", positions.len(), padded);
    positions
}

/// Final splice after the last change: enough to finish the print plus what
/// the hardware itself consumes, never a short last piece and never shorter
/// than the loading offset.
pub fn closing_splice(cx: &Context, total_output: Mm, last_splice: Mm) -> Mm {
    let splice = &cx.profile.splice;
    (total_output + splice.hardware_purge_length + splice.bowden_allowance)
        .max(last_splice + splice.min_splice_length)
        .max(splice.loading_offset_mm())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColorStrength;
    use crate::preflight::PreflightAnalyzer;
    use crate::tape::Tape;
    use approx::assert_relative_eq;

    /// Two layers, T0 -> T1 on the first and T1 -> T0 on the second, with
    /// `per_layer` mm of extrusion per layer.
    fn report(cx: &Context, per_layer: Mm) -> PreflightReport {
        let e = per_layer / 4.0;
        let square = |x: Mm| {
            format!(
                ";TYPE:FILL\nG1 X{x} Y10 E{e}\nG1 X{x2} Y10 E{e}\nG1 X{x2} Y20 E{e}\nG1 X{x} Y20 E{e}\n",
                x = x,
                x2 = x + 10.0,
                e = e / 2.0
            )
        };
        let mut p = String::from("G90\nM83\nG1 Z0.2\n");
        p += &square(10.0);
        p += "T1\n";
        p += &square(10.0);
        p += "G1 Z0.4\n";
        p += &square(10.0);
        p += "T0\n";
        p += &square(10.0);
        let mut tape = Tape::parse(&p).unwrap();
        PreflightAnalyzer::new(cx).analyze(&mut tape).unwrap()
    }

    #[test]
    fn short_first_piece_is_padded_to_minimum() {
        let cx = Context::default();
        let mut r = report(&cx, 20.0);
        plan_lengths(&mut r, &cx);
        let positions = pad(&mut r, &cx);
        let t = r.transitions();
        // 10 mm of model extrusion before the first change
        let unpadded = 10.0 + 0.4 * 130.0;
        assert_relative_eq!(t[0].extra_piece_length, 140.0 - unpadded, epsilon = 1e-3);
        assert_relative_eq!(positions[0], 140.0, epsilon = 1e-3);
        assert!(positions[1] - positions[0] >= 80.0 + PIECE_MARGIN - 1e-3);
    }

    #[test]
    fn short_piece_is_padded_by_exact_deficit() {
        let cx = Context::default();
        let mut r = report(&cx, 20.0);
        plan_lengths(&mut r, &cx);
        pad(&mut r, &cx);
        let t = r.transitions();
        // second change: 30 mm model, first purge 130 + extra, splice at 0.4 * 130
        let unpadded = 30.0 + t[0].purge_length() + 0.4 * 130.0;
        let previous = 140.0;
        let deficit = previous + 90.0 - unpadded;
        if deficit > 0.0 {
            assert_relative_eq!(t[1].extra_piece_length, deficit, epsilon = 1e-3);
        } else {
            assert_relative_eq!(t[1].extra_piece_length, 0.0);
        }
    }

    #[test]
    fn long_pieces_need_no_padding() {
        let cx = Context::default();
        let mut r = report(&cx, 400.0);
        plan_lengths(&mut r, &cx);
        pad(&mut r, &cx);
        assert!(r.transitions().iter().all(|t| t.extra_piece_length == 0.0));
    }

    #[test]
    fn interpolation_and_ziggurat() {
        let mut cx = Context::default();
        cx.profile.transitions.use_interpolation = true;
        cx.profile.transitions.ziggurat_threshold = 15.0;
        cx.profile.drives[0].strength = ColorStrength::Strong;
        cx.profile.drives[1].strength = ColorStrength::Weak;
        let mut r = report(&cx, 20.0);
        plan_lengths(&mut r, &cx);
        assert!(r.layers[0].ziggurat);
        assert!(!r.layers[1].ziggurat);
        let t = r.transitions();
        assert_relative_eq!(t[0].length, 200.0 * 0.6);
        assert_relative_eq!(t[1].length, 60.0);
    }

    #[test]
    fn infill_dump_credits_following_infill() {
        let mut cx = Context::default();
        cx.profile.transitions.infill_dump = true;
        let mut r = report(&cx, 20.0);
        plan_lengths(&mut r, &cx);
        let t = r.transitions();
        assert_relative_eq!(t[0].infill_dump.usable, 10.0);
        assert_relative_eq!(t[0].infill_dump.offset, 120.0);
        assert_relative_eq!(t[0].purge_length(), 120.0);
    }

    #[test]
    fn no_purge_method_plans_nothing() {
        let mut cx = Context::default();
        cx.profile.transition_method = TransitionMethod::None;
        let mut r = report(&cx, 400.0);
        plan_lengths(&mut r, &cx);
        let positions = pad(&mut r, &cx);
        assert_relative_eq!(positions[0], 200.0);
        assert!(r.transitions().iter().all(|t| t.purge_length() == 0.0));
    }

    #[test]
    fn closing_splice_takes_the_largest_floor() {
        let cx = Context::default();
        assert_relative_eq!(closing_splice(&cx, 1000.0, 900.0), 1250.0);
        assert_relative_eq!(closing_splice(&cx, 10.0, 900.0), 980.0);
        assert_relative_eq!(closing_splice(&cx, 0.0, 0.0), 250.0);
    }
}
