//! Classification of upward Z moves.
//!
//! When the nozzle moves up from a layer, what happens next decides where the
//! print resumes: straight back down (a hop), on to another height, or
//! extrusion at the new height (a plain layer change). The classifier looks
//! ahead on the tape to tell these apart and then holds its answer until the
//! next genuine Z change.

use crate::tape::{Motion, Tape};
use crate::Mm;

const Z_EPSILON: Mm = 1e-4;

/// Upper bound on lines inspected per classification.
const LOOKAHEAD_LIMIT: usize = 2_000;

fn same_z(a: Mm, b: Mm) -> bool {
    (a - b).abs() < Z_EPSILON
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StairPhase {
    AtFirst,
    AtSecond,
}

/// Lift topology, each variant carrying only the heights it needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZState {
    /// Not lifted.
    Level { z: Mm },
    /// (A) Up to `lift_z`, back to `layer_z` before extruding.
    Hop { layer_z: Mm, lift_z: Mm },
    /// (B) Up to `lift_z`, then further up to `next_z` before extruding.
    HopUp { layer_z: Mm, lift_z: Mm, next_z: Mm },
    /// (C) Extrusion follows the up move directly: `layer_z` is a new layer.
    LayerChange { layer_z: Mm },
    /// (D) Up to `lift_z`, then down to `next_z` (not `layer_z`) before extruding.
    HopDown { layer_z: Mm, lift_z: Mm, next_z: Mm },
    /// (E) Three levels `lift_z`, `mid_z`, `next_z` before extruding at `next_z`.
    /// Longer climbs keep only the first intermediate level; each later one
    /// is classified again from `layer_z` when reached, and resolves to the
    /// same `next_z`.
    Staircase { layer_z: Mm, lift_z: Mm, mid_z: Mm, next_z: Mm, phase: StairPhase },
}

/// When the tower should move to another layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TowerAdvance {
    None,
    /// Once the current tower layer's transitions are used up.
    WhenExhausted(Mm),
    Immediate(Mm),
}

impl ZState {
    /// Height extrusion resumes at; tool changes made now belong to this layer.
    pub fn print_z(&self) -> Mm {
        match *self {
            ZState::Level { z } => z,
            ZState::Hop { layer_z, .. } => layer_z,
            ZState::HopUp { next_z, .. } => next_z,
            ZState::LayerChange { layer_z } => layer_z,
            ZState::HopDown { next_z, .. } => next_z,
            ZState::Staircase { next_z, .. } => next_z,
        }
    }

    pub fn unlift_z(&self, default_lift: Mm) -> Mm {
        match *self {
            ZState::LayerChange { layer_z } => layer_z + default_lift,
            _ => self.print_z(),
        }
    }

    pub fn advance(&self) -> TowerAdvance {
        match *self {
            ZState::Level { .. } | ZState::Hop { .. } => TowerAdvance::None,
            ZState::HopUp { next_z, .. } => TowerAdvance::WhenExhausted(next_z),
            ZState::LayerChange { layer_z } => TowerAdvance::Immediate(layer_z),
            ZState::HopDown { next_z, .. } | ZState::Staircase { next_z, .. } => {
                TowerAdvance::Immediate(next_z)
            }
        }
    }

    /// Safe height for travelling away from the print right now.
    pub fn travel_z(&self, default_lift: Mm) -> Mm {
        match *self {
            ZState::Level { z } => z + default_lift,
            ZState::LayerChange { layer_z } => layer_z + default_lift,
            ZState::Hop { lift_z, .. }
            | ZState::HopUp { lift_z, .. }
            | ZState::HopDown { lift_z, .. } => lift_z,
            ZState::Staircase { lift_z, mid_z, .. } => lift_z.max(mid_z),
        }
    }

    pub fn is_lifted(&self) -> bool {
        !matches!(self, ZState::Level { .. } | ZState::LayerChange { .. })
    }

    /// Height of a hop, for episodes that are hops.
    pub fn hop_height(&self) -> Option<Mm> {
        match *self {
            ZState::Hop { layer_z, lift_z } => Some(lift_z - layer_z),
            ZState::HopDown { lift_z, next_z, .. } => Some(lift_z - next_z),
            _ => None,
        }
    }

    fn layer_z(&self) -> Mm {
        match *self {
            ZState::Level { z } => z,
            ZState::Hop { layer_z, .. }
            | ZState::HopUp { layer_z, .. }
            | ZState::LayerChange { layer_z }
            | ZState::HopDown { layer_z, .. }
            | ZState::Staircase { layer_z, .. } => layer_z,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZLiftClassifier {
    state: ZState,
    default_lift: Mm,
}

impl ZLiftClassifier {
    pub fn new(default_lift: Mm) -> ZLiftClassifier {
        ZLiftClassifier {
            state: ZState::Level { z: 0.0 },
            default_lift,
        }
    }

    pub fn state(&self) -> &ZState {
        &self.state
    }

    pub fn default_lift(&self) -> Mm {
        self.default_lift
    }

    pub fn travel_z(&self) -> Mm {
        self.state.travel_z(self.default_lift)
    }

    pub fn unlift_z(&self) -> Mm {
        self.state.unlift_z(self.default_lift)
    }

    /// Update after the tape executed a line. Returns the same state for as
    /// long as Z does not change. The tape cursor is left where it was.
    pub fn next_state(&mut self, tape: &mut Tape) -> ZState {
        let before = tape.previous_state().z;
        let after = tape.state().z;
        if same_z(before, after) {
            return self.state;
        }
        self.state = match self.state {
            ZState::Hop { layer_z, .. } if same_z(after, layer_z) => ZState::Level { z: layer_z },
            ZState::HopUp { next_z, .. } | ZState::HopDown { next_z, .. }
                if same_z(after, next_z) =>
            {
                ZState::Level { z: next_z }
            }
            ZState::Staircase { phase: StairPhase::AtFirst, mid_z, .. } if same_z(after, mid_z) => {
                let mut s = self.state;
                if let ZState::Staircase { phase, .. } = &mut s {
                    *phase = StairPhase::AtSecond;
                }
                s
            }
            ZState::Staircase { phase: StairPhase::AtSecond, next_z, .. }
                if same_z(after, next_z) =>
            {
                ZState::Level { z: next_z }
            }
            current => {
                let from = current.layer_z();
                if after > from + Z_EPSILON {
                    classify(tape, from, after)
                } else {
                    ZState::Level { z: after }
                }
            }
        };
        self.state
    }
}

/// Decide the topology of a move from `z0` up to `z1`, which the tape has just
/// executed.
pub fn classify(tape: &mut Tape, z0: Mm, z1: Mm) -> ZState {
    if tape.state().motion == Motion::Extrude {
        return ZState::LayerChange { layer_z: z1 };
    }
    let mut ahead = tape.lookahead();
    let mut levels: Vec<Mm> = vec![];
    let mut last = z1;
    let mut extruded = false;
    while ahead.distance() < LOOKAHEAD_LIMIT && ahead.step_forward() {
        let s = ahead.state();
        if !same_z(s.z, last) {
            if levels.is_empty() && same_z(s.z, z0) {
                return ZState::Hop { layer_z: z0, lift_z: z1 };
            }
            levels.push(s.z);
            last = s.z;
        }
        if s.motion == Motion::Extrude {
            extruded = true;
            break;
        }
    }
    if !extruded {
        // nothing more is printed; treat it as a hop that never comes down
        return ZState::Hop { layer_z: z0, lift_z: z1 };
    }
    match levels.as_slice() {
        [] => ZState::LayerChange { layer_z: z1 },
        [z2] if *z2 > z1 => ZState::HopUp { layer_z: z0, lift_z: z1, next_z: *z2 },
        [z2] => ZState::HopDown { layer_z: z0, lift_z: z1, next_z: *z2 },
        [mid, .., z3] => ZState::Staircase {
            layer_z: z0,
            lift_z: z1,
            mid_z: *mid,
            next_z: *z3,
            phase: StairPhase::AtFirst,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Run the classifier over the whole program, returning the state seen
    /// right after the line at `probe` (0-based) and checking the cursor is
    /// where the classifier found it.
    fn state_after(program: &str, probe: usize) -> ZState {
        let mut tape = Tape::parse(program).unwrap();
        let mut classifier = ZLiftClassifier::new(0.4);
        let mut seen = None;
        while tape.step_forward() {
            let position = tape.position();
            let state = classifier.next_state(&mut tape);
            assert_eq!(tape.position(), position);
            if position == probe + 1 {
                seen = Some(state);
            }
        }
        seen.unwrap()
    }

    const PRELUDE: &str = "G90\nM83\nG1 Z0.2\nG1 X10 Y10 E1\n";

    #[test]
    fn pure_hop() {
        let p = format!("{PRELUDE}G1 Z0.6\nG0 X20\nG1 Z0.2\nG1 X30 E1");
        let s = state_after(&p, 4);
        assert_eq!(s, ZState::Hop { layer_z: 0.2, lift_z: 0.6 });
        assert_relative_eq!(s.unlift_z(0.4), 0.2);
        assert_eq!(s.advance(), TowerAdvance::None);
        assert_eq!(state_after(&p, 6), ZState::Level { z: 0.2 });
    }

    #[test]
    fn hop_then_up_to_new_layer() {
        let p = format!("{PRELUDE}G1 Z0.3\nG0 X20\nG1 Z0.4\nG1 X30 E1");
        let s = state_after(&p, 4);
        assert_eq!(s, ZState::HopUp { layer_z: 0.2, lift_z: 0.3, next_z: 0.4 });
        assert_relative_eq!(s.unlift_z(0.4), 0.4);
        assert_eq!(s.advance(), TowerAdvance::WhenExhausted(0.4));
    }

    #[test]
    fn plain_layer_change() {
        let p = format!("{PRELUDE}G1 Z0.4\nG0 X20\nG1 X30 E1");
        let s = state_after(&p, 4);
        assert_eq!(s, ZState::LayerChange { layer_z: 0.4 });
        assert_relative_eq!(s.unlift_z(0.4), 0.8, epsilon = 1e-5);
        assert_eq!(s.advance(), TowerAdvance::Immediate(0.4));
        // held while Z stays put
        assert_eq!(state_after(&p, 6), s);
    }

    #[test]
    fn hop_then_down_to_new_layer() {
        let p = format!("{PRELUDE}G1 Z1.0\nG0 X20\nG1 Z0.4\nG1 X30 E1");
        let s = state_after(&p, 4);
        assert_eq!(s, ZState::HopDown { layer_z: 0.2, lift_z: 1.0, next_z: 0.4 });
        assert_relative_eq!(s.unlift_z(0.4), 0.4);
        assert_eq!(s.advance(), TowerAdvance::Immediate(0.4));
        assert_relative_eq!(s.hop_height().unwrap(), 0.6, epsilon = 1e-5);
    }

    #[test]
    fn staircase_tracks_both_phases() {
        let p = format!("{PRELUDE}G1 Z0.8\nG0 X20\nG1 Z1.2\nG0 X25\nG1 Z0.4\nG1 X30 E1");
        let first = state_after(&p, 4);
        assert_eq!(
            first,
            ZState::Staircase {
                layer_z: 0.2,
                lift_z: 0.8,
                mid_z: 1.2,
                next_z: 0.4,
                phase: StairPhase::AtFirst,
            }
        );
        assert_relative_eq!(first.unlift_z(0.4), 0.4);
        assert_eq!(first.advance(), TowerAdvance::Immediate(0.4));
        let second = state_after(&p, 6);
        assert!(matches!(second, ZState::Staircase { phase: StairPhase::AtSecond, .. }));
        assert_relative_eq!(second.travel_z(0.4), 1.2);
        assert_eq!(state_after(&p, 8), ZState::Level { z: 0.4 });
    }

    #[test]
    fn longer_climbs_keep_the_final_height() {
        let p = format!("{PRELUDE}G1 Z0.8\nG0 X20\nG1 Z1.2\nG0 X25\nG1 Z1.0\nG0 X27\nG1 Z0.4\nG1 X30 E1");
        for line in [4, 5, 6, 7, 8, 9] {
            assert_relative_eq!(state_after(&p, line).print_z(), 0.4);
        }
        assert_eq!(
            state_after(&p, 8),
            ZState::HopDown { layer_z: 0.2, lift_z: 1.0, next_z: 0.4 }
        );
        assert_eq!(state_after(&p, 10), ZState::Level { z: 0.4 });
    }

    #[test]
    fn lift_with_nothing_after_is_a_hop() {
        let p = format!("{PRELUDE}G1 Z10\nG0 X0 Y200\nM104 S0");
        assert_eq!(state_after(&p, 4), ZState::Hop { layer_z: 0.2, lift_z: 10.0 });
    }
}
