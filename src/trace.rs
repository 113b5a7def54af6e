//! # Capture Trace Ingestion
//!
//! Turns the text logs written by the serial sniffer into a [`ProtocolTrace`]:
//! ordered stages, each holding the bus operations observed while it ran.
//!
//! A capture line looks like one of:
//!
//! ```text
//! ===== Stage 2 store =====
//! [100] WRITE 0x49 'I'
//! [116] READ 0x49 [+16ms]
//! [140-188] READ 0x00 (x4)
//! [190] PURGE
//! ```
//!
//! The timing annotation on a line belongs to the operation on the *next* line.
//! Lines that are neither a stage marker nor an operation are ignored.

use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

static OPERATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[(\d+)(?:\s*-\s*(\d+))?\]\s+([A-Z_]+)\b(.*)$")
        .expect("operation line pattern")
});
static STAGE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[^\w\[]*stage\s+(\d+)\b[\s:\-]*([\w \-]*)").expect("stage marker pattern")
});
static TIMING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\+?(\d+)\s*ms\]").expect("timing pattern"));
static HEX_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0[xX]([0-9A-Fa-f]{1,2})\b").expect("hex value pattern"));
static CHAR_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(.)'").expect("char value pattern"));
static BARE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)([0-9A-Fa-f]{2})(?:\s|$)").expect("bare value pattern")
});

/// Errors raised while turning a capture file into a trace.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceParseError {
    /// The capture decodes neither as UTF-8 nor as UTF-16LE.
    #[error("capture is neither UTF-8 nor UTF-16LE text")]
    UnsupportedEncoding,
    /// A WRITE or READ line carries no byte value.
    #[error("line {line}: {action} has no byte value")]
    MissingValue { line: usize, action: Action },
    /// A tick does not fit the tick counter.
    #[error("line {line}: tick is out of range")]
    BadTick { line: usize },
    /// A consolidated range ends before it starts.
    #[error("line {line}: range end {end} precedes start {start}")]
    InvertedRange { line: usize, start: u64, end: u64 },
    /// A line's tick goes backwards relative to the previous operation.
    #[error("line {line}: tick {tick} precedes previous tick {previous}")]
    OutOfOrder { line: usize, tick: u64, previous: u64 },
}

/// Kind of bus transaction recorded by the sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Write,
    Read,
    /// Clear the link's buffers. Carries no byte.
    Purge,
    /// Reconfigure the link's read timeout. Carries no byte.
    SetTimeouts,
}

impl Action {
    /// WRITE and READ carry a byte; PURGE and SET_TIMEOUTS are link directives.
    pub fn carries_value(self) -> bool {
        matches!(self, Action::Write | Action::Read)
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "WRITE" => Some(Action::Write),
            "READ" => Some(Action::Read),
            "PURGE" => Some(Action::Purge),
            "SET_TIMEOUTS" => Some(Action::SetTimeouts),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Write => "WRITE",
            Action::Read => "READ",
            Action::Purge => "PURGE",
            Action::SetTimeouts => "SET_TIMEOUTS",
        })
    }
}

/// One bus transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
    pub start_tick: u64,
    pub end_tick: u64,
    /// Gap since the previous operation as reported by the capture tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_before_ms: Option<u32>,
    /// Set on operations synthesized by byte recovery.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
}

impl Operation {
    fn new(action: Action, value: Option<u8>) -> Self {
        Self {
            action,
            value,
            start_tick: 0,
            end_tick: 0,
            delay_before_ms: None,
            recovered: false,
        }
    }

    pub fn write(value: u8) -> Self {
        Self::new(Action::Write, Some(value))
    }

    pub fn read(value: u8) -> Self {
        Self::new(Action::Read, Some(value))
    }

    pub fn purge() -> Self {
        Self::new(Action::Purge, None)
    }

    pub fn set_timeouts() -> Self {
        Self::new(Action::SetTimeouts, None)
    }

    /// Places the operation on the trace's time axis.
    pub fn at(mut self, start_tick: u64, end_tick: u64) -> Self {
        self.start_tick = start_tick;
        self.end_tick = end_tick.max(start_tick);
        self
    }

    pub fn with_delay(mut self, delay_ms: u32) -> Self {
        self.delay_before_ms = Some(delay_ms);
        self
    }

    pub fn is_write(&self) -> bool {
        self.action == Action::Write
    }

    pub fn is_read(&self) -> bool {
        self.action == Action::Read
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(value) => write!(f, "{} 0x{:02X}", self.action, value),
            None => write!(f, "{}", self.action),
        }
    }
}

/// A contiguous phase of the capture delimited by stage markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub number: u32,
    pub name: String,
    pub operations: Vec<Operation>,
}

impl Stage {
    pub fn new(number: u32, name: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            number,
            name: name.into(),
            operations,
        }
    }

    // Operations seen before the first marker.
    fn unmarked() -> Self {
        Self::new(0, "unmarked", Vec::new())
    }
}

/// Ordered capture of serial bus activity, partitioned into stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTrace {
    pub stages: Vec<Stage>,
}

impl ProtocolTrace {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Looks a stage up by name, ignoring case.
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// All operations in trace order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.stages.iter().flat_map(|s| s.operations.iter())
    }

    pub fn len(&self) -> usize {
        self.stages.iter().map(|s| s.operations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decodes raw capture bytes, trying UTF-8 first and UTF-16LE second.
///
/// Text containing NUL characters is rejected as UTF-8: UTF-16LE logs of ASCII
/// content are byte-valid UTF-8 but interleaved with zero bytes.
pub fn decode_capture(raw: &[u8]) -> Result<String, TraceParseError> {
    if let Some(text) = decode_utf8(raw) {
        return Ok(text);
    }
    decode_utf16le(raw).ok_or(TraceParseError::UnsupportedEncoding)
}

fn decode_utf8(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(raw);
    let text = std::str::from_utf8(raw).ok()?;
    (!text.contains('\0')).then(|| text.to_owned())
}

fn decode_utf16le(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_prefix(&[0xFF, 0xFE]).unwrap_or(raw);
    if raw.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Decodes and parses a raw capture file.
pub fn parse_capture(raw: &[u8]) -> Result<ProtocolTrace, TraceParseError> {
    parse_trace(&decode_capture(raw)?)
}

/// Parses decoded capture text into a trace.
pub fn parse_trace(text: &str) -> Result<ProtocolTrace, TraceParseError> {
    let mut stages = Vec::new();
    let mut current = Stage::unmarked();
    let mut pending_delay: Option<u32> = None;
    let mut previous_tick: Option<u64> = None;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;

        let operation = OPERATION_LINE
            .captures(line)
            .and_then(|caps| Action::parse(&caps[3]).map(|action| (caps, action)));

        if let Some((caps, action)) = operation {
            let (mut op, next_delay) = parse_operation(&caps, action, line_no)?;
            if let Some(previous) = previous_tick {
                if op.start_tick < previous {
                    return Err(TraceParseError::OutOfOrder {
                        line: line_no,
                        tick: op.start_tick,
                        previous,
                    });
                }
            }
            previous_tick = Some(op.start_tick);
            op.delay_before_ms = pending_delay.take();
            pending_delay = next_delay;
            current.operations.push(op);
        } else if let Some(caps) = STAGE_MARKER.captures(line) {
            let number = caps[1].parse().unwrap_or(0);
            let name = caps
                .get(2)
                .map(|m| m.as_str().trim())
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| format!("stage{number}"));
            let finished = std::mem::replace(&mut current, Stage::new(number, name, Vec::new()));
            if finished.number != 0 || !finished.operations.is_empty() {
                stages.push(finished);
            }
        }
    }

    if current.number != 0 || !current.operations.is_empty() {
        stages.push(current);
    }
    Ok(ProtocolTrace::new(stages))
}

// Returns the operation and the delay its line announces for the next one.
fn parse_operation(
    caps: &Captures<'_>,
    action: Action,
    line: usize,
) -> Result<(Operation, Option<u32>), TraceParseError> {
    let parse_tick = |s: &str| s.parse::<u64>().map_err(|_| TraceParseError::BadTick { line });

    let start = parse_tick(&caps[1])?;
    let end = match caps.get(2) {
        Some(m) => parse_tick(m.as_str())?,
        None => start,
    };
    if end < start {
        return Err(TraceParseError::InvertedRange { line, start, end });
    }

    let details = caps.get(4).map_or("", |m| m.as_str());
    let next_delay = TIMING
        .captures(details)
        .and_then(|t| t[1].parse::<u32>().ok());
    let details = TIMING.replace_all(details, "");

    let value = if action.carries_value() {
        Some(parse_value(&details).ok_or(TraceParseError::MissingValue { line, action })?)
    } else {
        None
    };

    let op = Operation::new(action, value).at(start, end);
    Ok((op, next_delay))
}

fn parse_value(details: &str) -> Option<u8> {
    if let Some(caps) = HEX_VALUE.captures(details) {
        return u8::from_str_radix(&caps[1], 16).ok();
    }
    if let Some(caps) = CHAR_VALUE.captures(details) {
        let c = caps[1].chars().next()?;
        return c.is_ascii().then_some(c as u8);
    }
    BARE_VALUE
        .captures(details)
        .and_then(|caps| u8::from_str_radix(&caps[1], 16).ok())
}
