//! Cursor-based replay over a mutable instruction list.
//!
//! The state after any prefix of the program is a pure function of that
//! prefix. States are cached as the cursor moves forward and the cache is cut
//! back whenever a line is inserted or deleted at the cursor, so edits only
//! ever invalidate what comes after them.

use std::fs;
use std::io::{self, BufRead, Write};
use std::ops::Deref;
use std::path::Path;

use crate::error::{Result, SpliceError};
use crate::gcode::{CoordinateMode, GcodeParser, Instruction, Line};
use crate::{Mm, DRIVE_COUNT};

/// What the most recently executed line did, as far as printing goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Motion {
    #[default]
    None,
    Travel,
    Extrude,
    Retract,
    Prime,
    ZOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TapeState {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
    pub feedrate: Mm,
    /// The E register as the firmware sees it.
    pub e_position: Mm,
    pub relative_xyz: bool,
    pub relative_e: bool,
    /// Net filament pushed through the nozzle so far, retractions excluded.
    pub total_extrusion: Mm,
    /// Filament currently pulled back and not yet primed again.
    pub retraction: Mm,
    pub firmware_retracted: bool,
    pub tool: u8,
    pub temperatures: [f32; DRIVE_COUNT],
    pub motion: Motion,
    /// Net extrusion contributed by the most recent line.
    pub extruded: Mm,
}

impl Default for TapeState {
    fn default() -> Self {
        TapeState {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            feedrate: 0.0,
            e_position: 0.0,
            relative_xyz: false,
            relative_e: false,
            total_extrusion: 0.0,
            retraction: 0.0,
            firmware_retracted: false,
            tool: 0,
            temperatures: [0.0; DRIVE_COUNT],
            motion: Motion::None,
            extruded: 0.0,
        }
    }
}

impl TapeState {
    pub fn is_retracted(&self) -> bool {
        self.firmware_retracted || self.retraction > 1e-4
    }

    /// State after executing `instruction` from this state.
    pub fn apply(&self, instruction: &Instruction) -> TapeState {
        let mut next = self.clone();
        next.motion = Motion::None;
        next.extruded = 0.0;
        match instruction {
            Instruction::Move { x, y, z, e, f, .. } => {
                let axis = |current: Mm, target: &Option<Mm>| match target {
                    Some(v) if self.relative_xyz => current + v,
                    Some(v) => *v,
                    None => current,
                };
                next.x = axis(self.x, x);
                next.y = axis(self.y, y);
                next.z = axis(self.z, z);
                if let Some(f) = f {
                    next.feedrate = *f;
                }
                let delta = match e {
                    Some(v) if self.relative_e => *v,
                    Some(v) => *v - self.e_position,
                    None => 0.0,
                };
                next.e_position = self.e_position + delta;
                let moved_xy = next.x != self.x || next.y != self.y;
                if delta < 0.0 {
                    next.retraction += -delta;
                    next.motion = Motion::Retract;
                } else if delta > 0.0 {
                    let recovered = delta.min(next.retraction);
                    next.retraction -= recovered;
                    next.extruded = delta - recovered;
                    next.total_extrusion += next.extruded;
                    next.motion = if next.extruded > 0.0 {
                        Motion::Extrude
                    } else {
                        Motion::Prime
                    };
                } else if moved_xy {
                    next.motion = Motion::Travel;
                } else if next.z != self.z {
                    next.motion = Motion::ZOnly;
                }
            }
            Instruction::SetPosition { x, y, z, e } => {
                next.x = x.unwrap_or(self.x);
                next.y = y.unwrap_or(self.y);
                next.z = z.unwrap_or(self.z);
                next.e_position = e.unwrap_or(self.e_position);
            }
            Instruction::Retract => {
                next.firmware_retracted = true;
                next.motion = Motion::Retract;
            }
            Instruction::Unretract => {
                next.firmware_retracted = false;
                next.motion = Motion::Prime;
            }
            Instruction::ToolChange(t) => next.tool = *t,
            Instruction::SetTemperature { tool, celsius, .. } => {
                let t = tool.unwrap_or(self.tool) as usize;
                if t < DRIVE_COUNT {
                    next.temperatures[t] = *celsius;
                }
            }
            Instruction::CoordinateMode(mode) => match mode {
                CoordinateMode::AbsoluteXyz => {
                    next.relative_xyz = false;
                    next.relative_e = false;
                }
                CoordinateMode::RelativeXyz => {
                    next.relative_xyz = true;
                    next.relative_e = true;
                }
                CoordinateMode::AbsoluteE => next.relative_e = false,
                CoordinateMode::RelativeE => next.relative_e = true,
            },
            Instruction::Dwell { .. }
            | Instruction::Comment(_)
            | Instruction::OutOfBand(_)
            | Instruction::Other(_) => {}
        }
        next
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tape {
    lines: Vec<Line>,
    /// `states[k]` is the state after the first `k` lines; always non-empty.
    states: Vec<TapeState>,
    /// Number of executed lines.
    position: usize,
}

impl Tape {
    pub fn new(lines: Vec<Line>) -> Tape {
        Tape {
            lines,
            states: vec![TapeState::default()],
            position: 0,
        }
    }

    pub fn from_instructions(instructions: impl IntoIterator<Item = Instruction>) -> Tape {
        Tape::new(instructions.into_iter().map(Line::generated).collect())
    }

    pub fn parse(text: &str) -> Result<Tape> {
        Ok(Tape::new(GcodeParser::new().parse_program(text)?))
    }

    pub fn read_file(path: &Path) -> Result<Tape> {
        let parser = GcodeParser::new();
        let reader = io::BufReader::with_capacity(64 * 1024, fs::File::open(path)?);
        let mut lines = vec![];
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let instruction = parser.parse_line(&line, i + 1)?;
            lines.push(Line { instruction, text: Some(line) });
        }
        Ok(Tape::new(lines))
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for line in &self.lines {
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// State after the executed prefix.
    pub fn state(&self) -> &TapeState {
        &self.states[self.position]
    }

    /// State before the most recently executed line.
    pub fn previous_state(&self) -> &TapeState {
        &self.states[self.position.saturating_sub(1)]
    }

    /// The most recently executed line.
    pub fn current(&self) -> Option<&Instruction> {
        self.position
            .checked_sub(1)
            .map(|i| &self.lines[i].instruction)
    }

    /// The line that the next `step_forward` would execute.
    pub fn peek(&self) -> Option<&Instruction> {
        self.lines.get(self.position).map(|l| &l.instruction)
    }

    pub fn at_end(&self) -> bool {
        self.position >= self.lines.len()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn step_forward(&mut self) -> bool {
        if self.at_end() {
            return false;
        }
        if self.states.len() == self.position + 1 {
            let next = self.states[self.position].apply(&self.lines[self.position].instruction);
            self.states.push(next);
        }
        self.position += 1;
        true
    }

    pub fn step_backward(&mut self) -> bool {
        if self.position == 0 {
            return false;
        }
        self.position -= 1;
        true
    }

    /// Insert a line after the cursor and execute it.
    pub fn insert(&mut self, line: impl Into<Line>) {
        self.lines.insert(self.position, line.into());
        self.states.truncate(self.position + 1);
        self.step_forward();
    }

    /// Remove the most recently executed line; the cursor moves back over it.
    pub fn delete_current(&mut self) -> Result<Line> {
        if self.position == 0 {
            return Err(SpliceError::inconsistency("delete with nothing executed"));
        }
        self.position -= 1;
        self.states.truncate(self.position + 1);
        Ok(self.lines.remove(self.position))
    }

    /// Call `f(line, before, after)` for every line, without moving the cursor.
    pub fn replay<F>(&self, mut f: F)
    where
        F: FnMut(&Line, &TapeState, &TapeState),
    {
        let mut state = TapeState::default();
        for line in &self.lines {
            let next = state.apply(&line.instruction);
            f(line, &state, &next);
            state = next;
        }
    }

    /// Borrow the tape for stepping around; the cursor goes back to where it
    /// is now when the guard is dropped, however the borrow ends.
    pub fn lookahead(&mut self) -> Lookahead<'_> {
        let saved = self.position;
        Lookahead { tape: self, saved }
    }
}

/// Cursor-only view of a tape that restores the cursor on drop.
pub struct Lookahead<'a> {
    tape: &'a mut Tape,
    saved: usize,
}

impl Lookahead<'_> {
    pub fn step_forward(&mut self) -> bool {
        self.tape.step_forward()
    }

    pub fn step_backward(&mut self) -> bool {
        self.tape.step_backward()
    }

    /// Lines stepped over since the guard was taken.
    pub fn distance(&self) -> usize {
        self.tape.position.saturating_sub(self.saved)
    }
}

impl Deref for Lookahead<'_> {
    type Target = Tape;

    fn deref(&self) -> &Tape {
        self.tape
    }
}

impl Drop for Lookahead<'_> {
    fn drop(&mut self) {
        self.tape.position = self.saved;
    }
}
