//! Synthetic multi-tool prints: a 20 mm square with a perimeter and a
//! stripe of infill per layer.

#![allow(dead_code)]

use std::fmt::Write;

use gcode_splicer_lib::gcode::Instruction;
use gcode_splicer_lib::tape::TapeState;
use gcode_splicer_lib::Tape;

pub const LAYER_HEIGHT: f32 = 0.2;
pub const RETRACT: f32 = 0.8;
/// Filament per mm of printed line.
pub const E_PER_MM: f32 = 0.05;

#[derive(Debug, Clone)]
pub struct Fixture {
    pub layers: usize,
    /// `(layer, tool)`: switch to `tool` after that layer's infill.
    pub changes: Vec<(usize, u8)>,
    pub absolute_e: bool,
    pub firmware_retraction: bool,
    pub hop: Option<f32>,
    /// Heights above the layer the nozzle visits after a tool change before
    /// it resumes printing one layer up. Takes the place of `hop`.
    pub lifted_change: Option<Vec<f32>>,
}

impl Fixture {
    pub fn new(layers: usize, changes: &[(usize, u8)]) -> Fixture {
        Fixture {
            layers,
            changes: changes.to_vec(),
            absolute_e: false,
            firmware_retraction: false,
            hop: None,
            lifted_change: None,
        }
    }

    pub fn program(&self) -> String {
        let mut w = ProgramWriter {
            out: String::new(),
            e: 0.0,
            absolute: self.absolute_e,
            firmware: self.firmware_retraction,
        };
        w.line("; synthetic two-material square");
        w.line("M104 S210");
        w.line("G90");
        w.line(if self.absolute_e { "M82" } else { "M83" });
        w.line("G92 E0");
        w.line("T0");
        for layer in 0..self.layers {
            let z = LAYER_HEIGHT * (layer + 1) as f32;
            w.line(&format!("G1 Z{:.3} F600", z));
            w.line(if layer == 0 { "G0 X100 Y90 F9000" } else { "G0 X100 Y90" });
            w.line(&format!(";LAYER:{}", layer));
            w.line(";TYPE:WALL-OUTER");
            w.extrude(120.0, 90.0, 20.0);
            w.extrude(120.0, 110.0, 20.0);
            w.extrude(100.0, 110.0, 20.0);
            w.extrude(100.0, 90.0, 20.0);
            w.line(";TYPE:FILL");
            w.stripes(92.0, 8);
            for (_, tool) in self.changes.iter().filter(|(l, _)| *l == layer) {
                w.retract();
                if let Some(path) = &self.lifted_change {
                    w.line(&format!("G1 Z{:.3} F600", z + path[0]));
                    w.line(&format!("T{}", tool));
                    w.line("G0 X100 Y90");
                    for height in &path[1..] {
                        w.line(&format!("G1 Z{:.3} F600", z + height));
                        w.line("G0 X101 Y91");
                    }
                    w.line(&format!("G1 Z{:.3} F600", z + LAYER_HEIGHT));
                } else {
                    if let Some(hop) = self.hop {
                        w.line(&format!("G1 Z{:.3} F600", z + hop));
                    }
                    w.line(&format!("T{}", tool));
                    w.line("G0 X100 Y90");
                    if self.hop.is_some() {
                        w.line(&format!("G1 Z{:.3} F600", z));
                    }
                }
                w.prime();
                w.line(";TYPE:FILL");
                w.stripes(100.0, 4);
            }
        }
        w.retract();
        w.line("M104 S0");
        w.out
    }

    pub fn tape(&self) -> Tape {
        Tape::parse(&self.program()).expect("fixture parses")
    }
}

struct ProgramWriter {
    out: String,
    e: f32,
    absolute: bool,
    firmware: bool,
}

impl ProgramWriter {
    fn line(&mut self, text: &str) {
        writeln!(self.out, "{}", text).unwrap();
    }

    fn e_word(&mut self, delta: f32) -> f32 {
        self.e += delta;
        if self.absolute {
            self.e
        } else {
            delta
        }
    }

    fn extrude(&mut self, x: f32, y: f32, length: f32) {
        let e = self.e_word(length * E_PER_MM);
        self.line(&format!("G1 X{:.3} Y{:.3} E{:.5} F1200", x, y, e));
    }

    /// `count` 18 mm stripes, 2 mm apart, starting at `y`.
    fn stripes(&mut self, y: f32, count: usize) {
        for k in 0..count {
            let y = y + 2.0 * k as f32;
            let (from, to) = if k % 2 == 0 { (101.0, 119.0) } else { (119.0, 101.0) };
            self.line(&format!("G0 X{:.3} Y{:.3}", from, y));
            self.extrude(to, y, 18.0);
        }
    }

    fn retract(&mut self) {
        if self.firmware {
            self.line("G10");
        } else {
            let e = self.e_word(-RETRACT);
            self.line(&format!("G1 E{:.5} F2400", e));
        }
    }

    fn prime(&mut self) {
        if self.firmware {
            self.line("G11");
        } else {
            let e = self.e_word(RETRACT);
            self.line(&format!("G1 E{:.5} F2400", e));
        }
    }
}

/// Printer state in front of every line that came from the input, in order.
pub fn states_before_original_lines(tape: &Tape) -> Vec<(String, TapeState)> {
    let mut states = vec![];
    tape.replay(|line, before, _| {
        if let Some(text) = &line.text {
            states.push((text.clone(), before.clone()));
        }
    });
    states
}

pub fn is_tool_change(text: &str) -> bool {
    text.starts_with('T') && text[1..].chars().all(|c| c.is_ascii_digit())
}

pub fn tool_changes(tape: &Tape) -> usize {
    tape.lines()
        .iter()
        .filter(|l| matches!(l.instruction, Instruction::ToolChange(_)))
        .count()
}
