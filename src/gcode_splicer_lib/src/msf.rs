//! Splice schedule file: the model, its versioned text codec and a
//! human-readable rendering.
//!
//! Layout, one record per line:
//!
//! ```text
//! MSF1.4
//! cu:1PLA;2PETG;0;0;       drive slots, material index digit then name
//! ppm:41f00000             pulses per mm, f32 bits
//! lo:05dc                  loading offset
//! ns:0002                  splice count
//! np:0001                  ping count
//! na:0001                  algorithm count (1.4)
//! (01,4316a666)            splice: drive, cumulative length
//! (64,43af0000,43b90000)   ping: start, end (end from 1.3)
//! (0102,3f800000,3f800000,0)  algorithm: materials, heat, compression, reverse (1.4)
//! ```
//!
//! Integers are fixed-width lowercase hex, floats the big-endian hex of their
//! IEEE-754 single-precision bits.

use merging_iterator::MergeIter;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as fmt_Write};

use crate::error::{Result, SpliceError};
use crate::{Mm, DRIVE_COUNT};

/// Drive field value that marks a ping record.
const PING_MARKER: u8 = 0x64;
/// Material indices are written as a single hex digit.
pub const MAX_MATERIAL_INDEX: u8 = 0xf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum MsfVersion {
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "1.3")]
    V1_3,
    #[default]
    #[serde(rename = "1.4")]
    V1_4,
}

impl MsfVersion {
    pub fn tag(self) -> &'static str {
        match self {
            MsfVersion::V1_2 => "1.2",
            MsfVersion::V1_3 => "1.3",
            MsfVersion::V1_4 => "1.4",
        }
    }

    fn from_tag(tag: &str) -> Result<MsfVersion> {
        match tag {
            "1.2" => Ok(MsfVersion::V1_2),
            "1.3" => Ok(MsfVersion::V1_3),
            "1.4" => Ok(MsfVersion::V1_4),
            "1.0" | "1.1" => Err(SpliceError::ObsoleteSpliceVersion { version: tag.into() }),
            other => Err(malformed(1, format!("unknown version {:?}", other))),
        }
    }

    pub fn has_ping_ends(self) -> bool {
        self >= MsfVersion::V1_3
    }

    pub fn has_algorithms(self) -> bool {
        self >= MsfVersion::V1_4
    }
}

impl fmt::Display for MsfVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Splicer tuning for joining one material to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpliceAlgorithm {
    pub ingoing: u8,
    pub outgoing: u8,
    pub heat_factor: f32,
    pub compression_factor: f32,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MsfDrive {
    /// 0 for a drive with nothing loaded.
    pub material_index: u8,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpliceEntry {
    pub drive: u8,
    /// Cumulative filament length at which the next drive takes over.
    pub length: Mm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingEntry {
    pub start: Mm,
    pub end: Option<Mm>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpliceFile {
    pub version: MsfVersion,
    pub drives: [MsfDrive; DRIVE_COUNT],
    pub pulses_per_mm: f32,
    pub loading_offset: u32,
    pub splices: Vec<SpliceEntry>,
    pub pings: Vec<PingEntry>,
    pub algorithms: Vec<SpliceAlgorithm>,
}

impl SpliceFile {
    pub fn new(version: MsfVersion) -> SpliceFile {
        SpliceFile {
            version,
            drives: Default::default(),
            pulses_per_mm: 0.0,
            loading_offset: 0,
            splices: vec![],
            pings: vec![],
            algorithms: vec![],
        }
    }

    pub fn last_splice_length(&self) -> Mm {
        self.splices.last().map(|s| s.length).unwrap_or(0.0)
    }

    /// Check the piece length rules: strictly increasing, a long enough
    /// first piece and long enough pieces after it.
    pub fn validate_lengths(&self, first_piece_min: Mm, min_splice: Mm) -> Result<()> {
        const EPSILON: Mm = 1e-3;
        let mut previous: Option<Mm> = None;
        for (index, splice) in self.splices.iter().enumerate() {
            let invalid = |reason: String| {
                Err(SpliceError::InvalidSpliceLength {
                    index,
                    length: splice.length,
                    reason,
                })
            };
            match previous {
                None if splice.length < first_piece_min - EPSILON => {
                    return invalid(format!("first piece is shorter than {:.2} mm", first_piece_min));
                }
                Some(p) if splice.length <= p => {
                    return invalid("splice lengths must increase".into());
                }
                Some(p) if splice.length - p < min_splice - EPSILON => {
                    return invalid(format!("piece is shorter than {:.2} mm", min_splice));
                }
                _ => {}
            }
            previous = Some(splice.length);
        }
        Ok(())
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_records(&mut out);
        out
    }

    fn write_records(&self, out: &mut String) -> fmt::Result {
        let version = self.version;
        writeln!(out, "MSF{}", version.tag())?;
        out.push_str("cu:");
        for drive in &self.drives {
            write!(out, "{:x}{};", drive.material_index, drive.name)?;
        }
        out.push('\n');
        writeln!(out, "ppm:{}", float_hex(self.pulses_per_mm))?;
        writeln!(out, "lo:{:04x}", self.loading_offset)?;
        writeln!(out, "ns:{:04x}", self.splices.len())?;
        writeln!(out, "np:{:04x}", self.pings.len())?;
        if version.has_algorithms() {
            writeln!(out, "na:{:04x}", self.algorithms.len())?;
        }
        for s in &self.splices {
            writeln!(out, "({:02x},{})", s.drive, float_hex(s.length))?;
        }
        for p in &self.pings {
            match p.end {
                Some(end) if version.has_ping_ends() => writeln!(
                    out,
                    "({:02x},{},{})",
                    PING_MARKER,
                    float_hex(p.start),
                    float_hex(end)
                )?,
                _ => writeln!(out, "({:02x},{})", PING_MARKER, float_hex(p.start))?,
            }
        }
        if version.has_algorithms() {
            for a in &self.algorithms {
                writeln!(
                    out,
                    "({:x}{:x},{},{},{})",
                    a.ingoing,
                    a.outgoing,
                    float_hex(a.heat_factor),
                    float_hex(a.compression_factor),
                    u8::from(a.reverse)
                )?;
            }
        }
        Ok(())
    }

    pub fn decode(text: &str) -> Result<SpliceFile> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let (n, header) = lines.next().ok_or_else(|| malformed(1, "empty file".into()))?;
        let tag = header
            .strip_prefix("MSF")
            .ok_or_else(|| malformed(n, "missing MSF header".into()))?;
        let version = MsfVersion::from_tag(tag)?;
        let mut file = SpliceFile::new(version);

        let (n, cu) = field(lines.next(), "cu")?;
        let slots: Vec<&str> = cu.split(';').collect();
        if slots.len() != DRIVE_COUNT + 1 || !slots[DRIVE_COUNT].is_empty() {
            return Err(malformed(n, format!("expected {} drive slots", DRIVE_COUNT)));
        }
        for (drive, slot) in file.drives.iter_mut().zip(&slots) {
            let mut chars = slot.chars();
            let index = chars
                .next()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| malformed(n, format!("bad drive slot {:?}", slot)))?;
            drive.material_index = index as u8;
            drive.name = chars.as_str().to_string();
        }

        let (n, ppm) = field(lines.next(), "ppm")?;
        file.pulses_per_mm = parse_float(n, ppm)?;
        let (n, lo) = field(lines.next(), "lo")?;
        file.loading_offset = parse_int(n, lo)?;
        let (n, ns) = field(lines.next(), "ns")?;
        let splice_count = parse_int(n, ns)? as usize;
        let (n, np) = field(lines.next(), "np")?;
        let ping_count = parse_int(n, np)? as usize;
        let algorithm_count = if version.has_algorithms() {
            let (n, na) = field(lines.next(), "na")?;
            parse_int(n, na)? as usize
        } else {
            0
        };

        for _ in 0..splice_count {
            let (n, parts) = record(lines.next())?;
            match parts.as_slice() {
                [drive, length] => file.splices.push(SpliceEntry {
                    drive: parse_int(n, drive)? as u8,
                    length: parse_float(n, length)?,
                }),
                _ => return Err(malformed(n, "splice record needs 2 fields".into())),
            }
        }
        for _ in 0..ping_count {
            let (n, parts) = record(lines.next())?;
            let (marker, start, end) = match parts.as_slice() {
                [marker, start] => (marker, start, None),
                [marker, start, end] if version.has_ping_ends() => (marker, start, Some(end)),
                _ => return Err(malformed(n, "bad ping record".into())),
            };
            if parse_int(n, marker)? != PING_MARKER as u32 {
                return Err(malformed(n, "ping record without ping marker".into()));
            }
            file.pings.push(PingEntry {
                start: parse_float(n, start)?,
                end: end.map(|e| parse_float(n, e)).transpose()?,
            });
        }
        for _ in 0..algorithm_count {
            let (n, parts) = record(lines.next())?;
            match parts.as_slice() {
                [pair, heat, compression, reverse] if pair.len() == 2 => {
                    let pair = parse_int(n, pair)?;
                    file.algorithms.push(SpliceAlgorithm {
                        ingoing: (pair >> 4) as u8,
                        outgoing: (pair & 0xf) as u8,
                        heat_factor: parse_float(n, heat)?,
                        compression_factor: parse_float(n, compression)?,
                        reverse: match *reverse {
                            "0" => false,
                            "1" => true,
                            _ => return Err(malformed(n, "reverse flag must be 0 or 1".into())),
                        },
                    });
                }
                _ => return Err(malformed(n, "algorithm record needs 4 fields".into())),
            }
        }
        if let Some((n, extra)) = lines.next() {
            return Err(malformed(n, format!("unexpected trailing record {:?}", extra)));
        }
        Ok(file)
    }

    /// Display-only rendering; splices and pings share one timeline in
    /// length order.
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = self.write_human(&mut out);
        out
    }

    fn write_human(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "Splice file version {}", self.version)?;
        writeln!(out, "Drives:")?;
        for (i, d) in self.drives.iter().enumerate() {
            if d.material_index == 0 {
                writeln!(out, "  {}: unused", i + 1)?;
            } else {
                writeln!(out, "  {}: {} (material {})", i + 1, d.name, d.material_index)?;
            }
        }
        writeln!(out, "Pulses per mm: {:.4}", self.pulses_per_mm)?;
        writeln!(out, "Loading offset: {}", self.loading_offset)?;
        writeln!(out, "Splices: {}  Pings: {}", self.splices.len(), self.pings.len())?;
        let splices = self
            .splices
            .iter()
            .map(|s| (OrderedFloat(s.length), TimelineEvent::Splice { drive: s.drive }));
        let pings = self.pings.iter().map(|p| {
            (
                OrderedFloat(p.start),
                TimelineEvent::Ping { end: p.end.map(OrderedFloat) },
            )
        });
        for (at, event) in MergeIter::new(splices, pings) {
            match event {
                TimelineEvent::Splice { drive } => {
                    writeln!(out, "  {:>10.2} mm  splice  drive {}", at.into_inner(), drive + 1)?
                }
                TimelineEvent::Ping { end: Some(end) } => writeln!(
                    out,
                    "  {:>10.2} mm  ping    until {:.2} mm",
                    at.into_inner(),
                    end.into_inner()
                )?,
                TimelineEvent::Ping { end: None } => {
                    writeln!(out, "  {:>10.2} mm  ping", at.into_inner())?
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimelineEvent {
    Splice { drive: u8 },
    Ping { end: Option<OrderedFloat<f32>> },
}

fn float_hex(value: f32) -> String {
    format!("{:08x}", value.to_bits())
}

fn malformed(line: usize, reason: String) -> SpliceError {
    SpliceError::MalformedSpliceFile { line, reason }
}

fn parse_int(line: usize, text: &str) -> Result<u32> {
    u32::from_str_radix(text, 16).map_err(|_| malformed(line, format!("bad hex integer {:?}", text)))
}

fn parse_float(line: usize, text: &str) -> Result<f32> {
    if text.len() != 8 {
        return Err(malformed(line, format!("bad float {:?}", text)));
    }
    Ok(f32::from_bits(parse_int(line, text)?))
}

fn field<'a>(next: Option<(usize, &'a str)>, name: &str) -> Result<(usize, &'a str)> {
    let (n, line) = next.ok_or_else(|| malformed(0, format!("missing {} field", name)))?;
    line.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(|value| (n, value))
        .ok_or_else(|| malformed(n, format!("expected {} field", name)))
}

fn record(next: Option<(usize, &str)>) -> Result<(usize, Vec<&str>)> {
    let (n, line) = next.ok_or_else(|| malformed(0, "missing record".into()))?;
    let inner = line
        .strip_prefix('(')
        .and_then(|l| l.strip_suffix(')'))
        .ok_or_else(|| malformed(n, "record must be parenthesized".into()))?;
    Ok((n, inner.split(',').collect()))
}
