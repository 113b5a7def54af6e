//! # Protocol Executor
//!
//! Turns a stage template into the exact operation sequence the device should
//! see, then replays it over a [`Connection`], checking every echo.
//!
//! Execution stops at the first failure. Nothing is retried: after an
//! unexpected echo the device's state is unknown, and writing more bytes
//! could corrupt its memory.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::link::{Connection, LinkError};
use crate::registry::{CommandTable, Payload, PayloadLength, StageTemplate, Step};
use crate::trace::{Action, Operation};

/// One addressable unit of a treatment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub frequency_hz: f64,
    /// How long the device plays this row.
    pub duration_ms: u64,
}

impl Row {
    // ASCII "<hz>,<ms>", streamed as a raw 'W' payload.
    fn encode(&self) -> Vec<u8> {
        format!("{:.2},{}", self.frequency_hz, self.duration_ms).into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
    pub name: String,
    pub rows: Vec<Row>,
}

/// Fill byte for names shorter than the name field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamePadding {
    #[default]
    Space,
    Null,
}

impl NamePadding {
    pub fn byte(self) -> u8 {
        match self {
            NamePadding::Space => b' ',
            NamePadding::Null => 0x00,
        }
    }
}

/// Runtime arguments a template is instantiated with.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageArgs<'a> {
    pub treatment: Option<&'a Treatment>,
    pub padding: NamePadding,
}

impl<'a> StageArgs<'a> {
    pub fn for_treatment(treatment: &'a Treatment, padding: NamePadding) -> Self {
        Self {
            treatment: Some(treatment),
            padding,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("stage needs a treatment")]
    MissingTreatment,
    #[error("command 0x{0:02X} is not in the device's command table")]
    UnknownCommand(u8),
    #[error("row {row} is out of range for a treatment of {rows} rows")]
    RowOutOfRange { row: usize, rows: usize },
    #[error("treatment has {0} rows, more than a run argument can address")]
    TooManyRows(usize),
    #[error("payload for command 0x{command:02X} contains its terminator 0x{terminator:02X}")]
    TerminatorInPayload { command: u8, terminator: u8 },
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("echo mismatch at operation {index}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    EchoMismatch {
        index: usize,
        expected: u8,
        actual: u8,
    },
    #[error("connection lost at operation {index}: {source}")]
    ConnectionLost {
        index: usize,
        #[source]
        source: LinkError,
    },
}

impl ExecError {
    /// Operations that completed before the failure.
    pub fn completed(&self) -> usize {
        match self {
            ExecError::EchoMismatch { index, .. } | ExecError::ConnectionLost { index, .. } => {
                *index
            }
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ExecError::ConnectionLost { .. })
    }
}

/// Instantiates the whole stage: prologue, every row, epilogue.
pub fn instantiate(
    table: &CommandTable,
    template: &StageTemplate,
    args: &StageArgs<'_>,
) -> Result<Vec<Operation>, TemplateError> {
    instantiate_from(table, template, args, 0)
}

/// Instantiates the stage with rows starting at `start_row`.
///
/// Rows are independent of one another, so the result for `start_row = R` is
/// the prologue followed by the row section of a full instantiation from row R.
pub fn instantiate_from(
    table: &CommandTable,
    template: &StageTemplate,
    args: &StageArgs<'_>,
    start_row: usize,
) -> Result<Vec<Operation>, TemplateError> {
    let mut ops = emit_steps(table, template.prologue, args, None)?;
    if !template.per_row.is_empty() {
        let rows = args.treatment.ok_or(TemplateError::MissingTreatment)?.rows.len();
        if start_row > rows {
            return Err(TemplateError::RowOutOfRange {
                row: start_row,
                rows,
            });
        }
        for row in start_row..rows {
            ops.extend(emit_steps(table, template.per_row, args, Some(row))?);
        }
    }
    ops.extend(emit_steps(table, template.epilogue, args, None)?);
    Ok(ops)
}

/// Instantiates the per-row section for a single row.
pub fn instantiate_row(
    table: &CommandTable,
    template: &StageTemplate,
    args: &StageArgs<'_>,
    row: usize,
) -> Result<Vec<Operation>, TemplateError> {
    let rows = args.treatment.ok_or(TemplateError::MissingTreatment)?.rows.len();
    if row >= rows {
        return Err(TemplateError::RowOutOfRange { row, rows });
    }
    emit_steps(table, template.per_row, args, Some(row))
}

fn emit_steps(
    table: &CommandTable,
    steps: &[Step],
    args: &StageArgs<'_>,
    row: Option<usize>,
) -> Result<Vec<Operation>, TemplateError> {
    let mut ops = Vec::new();
    for step in steps {
        match *step {
            Step::Purge => ops.push(Operation::purge()),
            Step::SetTimeouts => ops.push(Operation::set_timeouts()),
            Step::Command { byte, payload } => {
                let spec = table.get(byte).ok_or(TemplateError::UnknownCommand(byte))?;
                let data = payload_bytes(payload, args, row)?;
                ops.extend(echoed(byte));
                match spec.payload {
                    PayloadLength::Fixed(len) => {
                        let field = match payload {
                            Payload::TreatmentName => pad_field(data, len, args.padding.byte()),
                            _ => right_align(data, len),
                        };
                        for b in field {
                            ops.extend(echoed(b));
                        }
                    }
                    PayloadLength::UntilTerminator(terminator) => {
                        if data.contains(&terminator) {
                            return Err(TemplateError::TerminatorInPayload {
                                command: byte,
                                terminator,
                            });
                        }
                        ops.extend(data.into_iter().map(Operation::write));
                        ops.extend(echoed(terminator));
                    }
                }
            }
        }
    }
    Ok(ops)
}

fn echoed(byte: u8) -> [Operation; 2] {
    [Operation::write(byte), Operation::read(byte)]
}

fn payload_bytes(
    payload: Payload,
    args: &StageArgs<'_>,
    row: Option<usize>,
) -> Result<Vec<u8>, TemplateError> {
    let treatment = || args.treatment.ok_or(TemplateError::MissingTreatment);
    let arg = |n: usize| {
        u32::try_from(n)
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|_| TemplateError::TooManyRows(n))
    };
    match payload {
        Payload::Empty => Ok(Vec::new()),
        // The device only displays ASCII.
        Payload::TreatmentName => Ok(treatment()?
            .name
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect()),
        Payload::RowCount => arg(treatment()?.rows.len()),
        Payload::RowIndex => arg(row.unwrap_or(0)),
        Payload::RowData => {
            let t = treatment()?;
            let row = row.unwrap_or(0);
            t.rows
                .get(row)
                .map(Row::encode)
                .ok_or(TemplateError::RowOutOfRange {
                    row,
                    rows: t.rows.len(),
                })
        }
    }
}

// Truncates or pads on the right to exactly `len` bytes.
fn pad_field(mut data: Vec<u8>, len: usize, fill: u8) -> Vec<u8> {
    data.resize(len, fill);
    data
}

// Keeps the low-order `len` bytes, zero-extending on the left.
fn right_align(data: Vec<u8>, len: usize) -> Vec<u8> {
    if data.len() >= len {
        data[data.len() - len..].to_vec()
    } else {
        let mut field = vec![0; len - data.len()];
        field.extend(data);
        field
    }
}

/// Replays `ops` over `conn`, validating each echo.
///
/// PURGE and SET_TIMEOUTS are link directives: they clear the link's buffers
/// and apply `read_timeout`. Returns the number of operations executed.
pub fn execute_stage(
    conn: &mut dyn Connection,
    ops: &[Operation],
    read_timeout: Duration,
) -> Result<usize, ExecError> {
    let lost = |index: usize| move |source: LinkError| ExecError::ConnectionLost { index, source };

    for (index, op) in ops.iter().enumerate() {
        match (op.action, op.value) {
            (Action::Write, Some(byte)) => conn.write_byte(byte).map_err(lost(index))?,
            (Action::Read, Some(expected)) => {
                let actual = conn.read_byte().map_err(lost(index))?;
                if actual != expected {
                    return Err(ExecError::EchoMismatch {
                        index,
                        expected,
                        actual,
                    });
                }
            }
            (Action::Purge, _) => conn.purge().map_err(lost(index))?,
            (Action::SetTimeouts, _) => conn.set_timeout(read_timeout).map_err(lost(index))?,
            (Action::Write | Action::Read, None) => {}
        }
        debug!(index, %op, "replayed");
    }
    Ok(ops.len())
}
