//! Instruction model plus parsing and formatting of G-code lines.

use regex::Regex;
use std::fmt;

use crate::error::{Result, SpliceError};
use crate::Mm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateMode {
    /// G90; also makes E absolute.
    AbsoluteXyz,
    /// G91; also makes E relative.
    RelativeXyz,
    /// M82
    AbsoluteE,
    /// M83
    RelativeE,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Move {
        rapid: bool,
        x: Option<Mm>,
        y: Option<Mm>,
        z: Option<Mm>,
        e: Option<Mm>,
        f: Option<Mm>,
    },
    SetPosition {
        x: Option<Mm>,
        y: Option<Mm>,
        z: Option<Mm>,
        e: Option<Mm>,
    },
    /// Firmware retraction, G10.
    Retract,
    /// Firmware unretraction, G11.
    Unretract,
    ToolChange(u8),
    Dwell {
        millis: u32,
    },
    SetTemperature {
        tool: Option<u8>,
        celsius: f32,
        wait: bool,
    },
    CoordinateMode(CoordinateMode),
    /// Comment text without the leading `;`. Empty lines are empty comments.
    Comment(String),
    /// Vendor out-of-band records, lines starting with `O`.
    OutOfBand(String),
    /// Anything else, passed through untouched.
    Other(String),
}

impl Instruction {
    pub fn travel(x: Mm, y: Mm, f: Option<Mm>) -> Instruction {
        Instruction::Move { rapid: true, x: Some(x), y: Some(y), z: None, e: None, f }
    }

    pub fn move_z(z: Mm, f: Option<Mm>) -> Instruction {
        Instruction::Move { rapid: true, x: None, y: None, z: Some(z), e: None, f }
    }

    pub fn extrude_e(e: Mm, f: Option<Mm>) -> Instruction {
        Instruction::Move { rapid: false, x: None, y: None, z: None, e: Some(e), f }
    }

    pub fn comment(text: impl Into<String>) -> Instruction {
        Instruction::Comment(text.into())
    }

    pub fn has_xy(&self) -> bool {
        matches!(self, Instruction::Move { x, y, .. } if x.is_some() || y.is_some())
    }
}

/// A line of the program. Parsed lines keep their text so they are written
/// back unchanged; generated lines are formatted from the instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub instruction: Instruction,
    pub text: Option<String>,
}

impl Line {
    pub fn generated(instruction: Instruction) -> Line {
        Line { instruction, text: None }
    }
}

impl From<Instruction> for Line {
    fn from(instruction: Instruction) -> Line {
        Line::generated(instruction)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => f.write_str(text),
            None => write!(f, "{}", self.instruction),
        }
    }
}

fn trim_number(value: f32, decimals: usize) -> String {
    let s = format!("{:.*}", decimals, value);
    if !s.contains('.') {
        return s;
    }
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".into()
    } else {
        s.into()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Move { rapid, x, y, z, e, f: feed } => {
                f.write_str(if *rapid { "G0" } else { "G1" })?;
                if let Some(x) = x {
                    write!(f, " X{}", trim_number(*x, 3))?;
                }
                if let Some(y) = y {
                    write!(f, " Y{}", trim_number(*y, 3))?;
                }
                if let Some(z) = z {
                    write!(f, " Z{}", trim_number(*z, 3))?;
                }
                if let Some(e) = e {
                    write!(f, " E{}", trim_number(*e, 5))?;
                }
                if let Some(feed) = feed {
                    write!(f, " F{}", trim_number(*feed, 0))?;
                }
                Ok(())
            }
            Instruction::SetPosition { x, y, z, e } => {
                f.write_str("G92")?;
                for (letter, value) in [('X', x), ('Y', y), ('Z', z)] {
                    if let Some(v) = value {
                        write!(f, " {}{}", letter, trim_number(*v, 3))?;
                    }
                }
                if let Some(e) = e {
                    write!(f, " E{}", trim_number(*e, 5))?;
                }
                Ok(())
            }
            Instruction::Retract => f.write_str("G10"),
            Instruction::Unretract => f.write_str("G11"),
            Instruction::ToolChange(t) => write!(f, "T{}", t),
            Instruction::Dwell { millis } => write!(f, "G4 P{}", millis),
            Instruction::SetTemperature { tool, celsius, wait } => {
                f.write_str(if *wait { "M109" } else { "M104" })?;
                write!(f, " S{}", trim_number(*celsius, 1))?;
                if let Some(t) = tool {
                    write!(f, " T{}", t)?;
                }
                Ok(())
            }
            Instruction::CoordinateMode(mode) => f.write_str(match mode {
                CoordinateMode::AbsoluteXyz => "G90",
                CoordinateMode::RelativeXyz => "G91",
                CoordinateMode::AbsoluteE => "M82",
                CoordinateMode::RelativeE => "M83",
            }),
            Instruction::Comment(text) if text.is_empty() => Ok(()),
            Instruction::Comment(text) => write!(f, ";{}", text),
            Instruction::OutOfBand(text) | Instruction::Other(text) => f.write_str(text),
        }
    }
}

pub struct GcodeParser {
    command: Regex,
    word: Regex,
}

impl Default for GcodeParser {
    fn default() -> Self {
        GcodeParser::new()
    }
}

impl GcodeParser {
    pub fn new() -> GcodeParser {
        GcodeParser {
            // strip off an optional line number; the comment is handled separately
            command: Regex::new(r"^(?:N\d+\s+)?(?<letter>[GMT])(?<number>\d+)(?:\.\d+)?(?<rest>.*)$")
                .expect("command pattern"),
            word: Regex::new(r"(?<letter>[A-Za-z])\s*(?<value>[-+]?(?:\d+\.?\d*|\.\d+))")
                .expect("word pattern"),
        }
    }

    fn words(&self, args: &str, line_number: usize) -> Result<Vec<(char, f32)>> {
        let mut words = vec![];
        for captures in self.word.captures_iter(args) {
            let letter = captures["letter"]
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_default();
            let value = captures["value"].parse::<f32>().map_err(|e| SpliceError::Parse {
                line: line_number,
                reason: format!("bad number in {:?}: {}", args, e),
            })?;
            words.push((letter, value));
        }
        Ok(words)
    }

    pub fn parse_line(&self, line: &str, line_number: usize) -> Result<Instruction> {
        let trimmed = line.trim();
        let (code, comment) = match trimmed.find(';') {
            Some(at) => (trimmed[..at].trim(), Some(&trimmed[at + 1..])),
            None => (trimmed, None),
        };
        if code.is_empty() {
            return Ok(Instruction::Comment(comment.unwrap_or("").to_string()));
        }
        if code.starts_with('O') {
            return Ok(Instruction::OutOfBand(trimmed.to_string()));
        }
        let Some(captures) = self.command.captures(code) else {
            return Ok(Instruction::Other(trimmed.to_string()));
        };
        let letter = &captures["letter"];
        let number: u32 = captures["number"].parse().map_err(|_| SpliceError::Parse {
            line: line_number,
            reason: format!("bad command number in {:?}", code),
        })?;
        let rest = &captures["rest"];
        let find = |words: &[(char, f32)], l: char| {
            words.iter().rev().find(|(c, _)| *c == l).map(|(_, v)| *v)
        };
        let instruction = match (letter, number) {
            ("G", 0) | ("G", 1) => {
                let w = self.words(rest, line_number)?;
                Instruction::Move {
                    rapid: number == 0,
                    x: find(&w, 'X'),
                    y: find(&w, 'Y'),
                    z: find(&w, 'Z'),
                    e: find(&w, 'E'),
                    f: find(&w, 'F'),
                }
            }
            ("G", 4) => {
                let w = self.words(rest, line_number)?;
                let millis = match (find(&w, 'P'), find(&w, 'S')) {
                    (Some(p), _) => p,
                    (None, Some(s)) => s * 1000.0,
                    (None, None) => 0.0,
                };
                Instruction::Dwell { millis: millis.max(0.0).round() as u32 }
            }
            ("G", 10) if rest.trim().is_empty() => Instruction::Retract,
            ("G", 11) => Instruction::Unretract,
            ("G", 90) => Instruction::CoordinateMode(CoordinateMode::AbsoluteXyz),
            ("G", 91) => Instruction::CoordinateMode(CoordinateMode::RelativeXyz),
            ("G", 92) => {
                let w = self.words(rest, line_number)?;
                let set = Instruction::SetPosition {
                    x: find(&w, 'X'),
                    y: find(&w, 'Y'),
                    z: find(&w, 'Z'),
                    e: find(&w, 'E'),
                };
                // bare G92 zeroes every axis
                if w.is_empty() {
                    Instruction::SetPosition { x: Some(0.0), y: Some(0.0), z: Some(0.0), e: Some(0.0) }
                } else {
                    set
                }
            }
            ("M", 82) => Instruction::CoordinateMode(CoordinateMode::AbsoluteE),
            ("M", 83) => Instruction::CoordinateMode(CoordinateMode::RelativeE),
            ("M", 104) | ("M", 109) => {
                let w = self.words(rest, line_number)?;
                match find(&w, 'S').or_else(|| find(&w, 'R')) {
                    Some(celsius) => Instruction::SetTemperature {
                        tool: find(&w, 'T').map(|t| t as u8),
                        celsius,
                        wait: number == 109,
                    },
                    None => Instruction::Other(trimmed.to_string()),
                }
            }
            ("T", n) => {
                let tool = u8::try_from(n).map_err(|_| SpliceError::Parse {
                    line: line_number,
                    reason: format!("tool number {} out of range", n),
                })?;
                Instruction::ToolChange(tool)
            }
            _ => Instruction::Other(trimmed.to_string()),
        };
        Ok(instruction)
    }

    pub fn parse_program(&self, text: &str) -> Result<Vec<Line>> {
        text.lines()
            .enumerate()
            .map(|(i, line)| {
                Ok(Line {
                    instruction: self.parse_line(line, i + 1)?,
                    text: Some(line.to_string()),
                })
            })
            .collect()
    }
}
