//! # Byte Recovery
//!
//! The sniffer occasionally drops a whole write/read cycle without saying so.
//! What remains in the capture is a READ that does not echo the WRITE before
//! it, arriving after roughly twice the usual echo delay. This module walks a
//! trace with the protocol context of the attached variant and splices the
//! missing cycle back in.
//!
//! Anything it cannot attribute to a dropped cycle is reported, never guessed.

use std::fmt;
use std::ops::RangeInclusive;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::registry::{CommandTable, PayloadLength};
use crate::trace::{Action, Operation, ProtocolTrace, Stage};

/// Echo latency of a healthy write/read cycle on current firmware.
///
/// Measured from captures; recapture against new firmware revisions before
/// trusting it.
pub const ECHO_BASELINE_MS: u32 = 16;

/// Echo delay band produced when the sniffer loses one full cycle
/// (about twice [`ECHO_BASELINE_MS`]). Firmware-sensitive like the baseline.
pub const DROPPED_CYCLE_BAND_MS: RangeInclusive<u32> = 31..=32;

// Operations shown either side of a failure.
const CONTEXT_WINDOW: usize = 3;

/// Why a stage could not be repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unrecoverable {
    /// Echo mismatch outside the dropped-cycle delay band.
    EchoMismatch,
    /// Dropped-cycle signature, but the active command is unknown.
    UnknownContext,
}

impl fmt::Display for Unrecoverable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Unrecoverable::EchoMismatch => "echo mismatch without dropped-cycle delay",
            Unrecoverable::UnknownContext => "no known command context",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error(
        "missing byte unrecoverable in stage '{stage}' at operation {index}: {reason} \
         (wrote 0x{expected:02X}, read 0x{observed:02X}); context: {context}"
    )]
    MissingByteUnrecoverable {
        stage: String,
        index: usize,
        reason: Unrecoverable,
        expected: u8,
        observed: u8,
        context: String,
    },
}

/// Audit record of one spliced cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fix {
    pub stage: String,
    /// Index of the anomalous READ in the stage as captured.
    pub index: usize,
    pub tick: u64,
    /// Byte restored by the synthesized cycle.
    pub restored: u8,
    /// Value the anomalous READ carried in the capture.
    pub observed: u8,
}

/// Corrected trace plus the fixes applied to produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub trace: ProtocolTrace,
    pub fixes: Vec<Fix>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Next WRITE should be a command byte.
    Command,
    /// Inside a fixed-length payload.
    Payload { remaining: usize },
    /// Inside a raw payload, waiting for the terminator.
    Scanning { terminator: u8 },
    /// Last command byte was not in the table.
    Unknown,
}

/// Protocol context carried across one left-to-right pass over a stage.
#[derive(Debug, Clone, Copy)]
struct Context<'t> {
    table: &'t CommandTable,
    current_command: Option<u8>,
    mode: Mode,
}

impl<'t> Context<'t> {
    fn new(table: &'t CommandTable) -> Self {
        Self {
            table,
            current_command: None,
            mode: Mode::Command,
        }
    }

    /// Feeds one written byte; returns whether the device echoes it.
    fn advance(&mut self, byte: u8) -> bool {
        match self.mode {
            Mode::Payload { remaining } => {
                self.mode = if remaining > 1 {
                    Mode::Payload {
                        remaining: remaining - 1,
                    }
                } else {
                    Mode::Command
                };
                true
            }
            Mode::Scanning { terminator } => {
                if byte == terminator {
                    self.mode = Mode::Command;
                    true
                } else {
                    false
                }
            }
            Mode::Command | Mode::Unknown => {
                match self.table.get(byte) {
                    Some(spec) => {
                        self.current_command = Some(byte);
                        self.mode = match spec.payload {
                            PayloadLength::Fixed(0) => Mode::Command,
                            PayloadLength::Fixed(n) => Mode::Payload { remaining: n },
                            PayloadLength::UntilTerminator(t) => Mode::Scanning { terminator: t },
                        };
                    }
                    None => {
                        self.current_command = None;
                        self.mode = Mode::Unknown;
                    }
                }
                true
            }
        }
    }

    fn is_known(&self) -> bool {
        self.mode != Mode::Unknown
    }
}

/// Runs byte recovery over every stage of `trace`.
///
/// The protocol context resets at each stage boundary. Synthesized operations
/// are flagged `recovered`; a recovered WRITE is a retransmission and does not
/// advance the context, so running this on its own output applies no fixes.
pub fn recover(trace: &ProtocolTrace, table: &CommandTable) -> Result<Recovery, RecoveryError> {
    let mut fixes = Vec::new();
    let mut stages = Vec::with_capacity(trace.stages.len());
    for stage in &trace.stages {
        stages.push(recover_stage(stage, table, &mut fixes)?);
    }
    if !fixes.is_empty() {
        info!(fixes = fixes.len(), "byte recovery spliced dropped cycles");
    }
    Ok(Recovery {
        trace: ProtocolTrace::new(stages),
        fixes,
    })
}

fn recover_stage(
    stage: &Stage,
    table: &CommandTable,
    fixes: &mut Vec<Fix>,
) -> Result<Stage, RecoveryError> {
    let ops = &stage.operations;
    let mut ctx = Context::new(table);
    let mut out = Vec::with_capacity(ops.len());
    // Last echoed WRITE still waiting for its READ: (value, end_tick).
    let mut pending: Option<(u8, u64)> = None;

    for (index, op) in ops.iter().enumerate() {
        let Some(value) = op.value.filter(|_| op.action.carries_value()) else {
            out.push(op.clone());
            continue;
        };

        if op.action == Action::Write {
            let echoed = op.recovered || ctx.advance(value);
            pending = echoed.then_some((value, op.end_tick));
            out.push(op.clone());
            continue;
        }

        match pending.take() {
            Some((expected, _)) if expected == value => out.push(op.clone()),
            Some((expected, written_at)) => {
                let in_band = op
                    .delay_before_ms
                    .is_some_and(|d| DROPPED_CYCLE_BAND_MS.contains(&d));
                let reason = if !in_band {
                    Some(Unrecoverable::EchoMismatch)
                } else if !ctx.is_known() {
                    Some(Unrecoverable::UnknownContext)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(RecoveryError::MissingByteUnrecoverable {
                        stage: stage.name.clone(),
                        index,
                        reason,
                        expected,
                        observed: value,
                        context: describe_context(ops, index),
                    });
                }

                // Assumes the host retransmitted the byte whose echo went
                // missing. The command table only bounds the context; it does
                // not pick the restored value.
                let restored = expected;
                out.extend(dropped_cycle(expected, restored, written_at, op.start_tick));
                let mut realigned = op.clone();
                realigned.value = Some(restored);
                realigned.recovered = true;
                out.push(realigned);

                debug!(
                    stage = %stage.name,
                    index,
                    command = ?ctx.current_command,
                    "spliced dropped cycle"
                );
                fixes.push(Fix {
                    stage: stage.name.clone(),
                    index,
                    tick: op.start_tick,
                    restored,
                    observed: value,
                });
            }
            None => out.push(op.clone()),
        }
    }

    Ok(Stage::new(stage.number, stage.name.clone(), out))
}

/// `READ(prior) → PURGE → WRITE(restored) → SET_TIMEOUTS → READ(restored)`,
/// in the order the firmware performs it, spread over the gap `from..=to`.
fn dropped_cycle(prior: u8, restored: u8, from: u64, to: u64) -> Vec<Operation> {
    let steps = [
        Operation::read(prior).with_delay(ECHO_BASELINE_MS),
        Operation::purge(),
        Operation::write(restored),
        Operation::set_timeouts(),
        Operation::read(restored).with_delay(ECHO_BASELINE_MS),
    ];
    let gap = to.saturating_sub(from);
    let count = steps.len() as u64 + 1;
    steps
        .into_iter()
        .enumerate()
        .map(|(k, op)| {
            let tick = from + gap * (k as u64 + 1) / count;
            let mut op = op.at(tick, tick);
            op.recovered = true;
            op
        })
        .collect()
}

fn describe_context(ops: &[Operation], index: usize) -> String {
    let start = index.saturating_sub(CONTEXT_WINDOW);
    let end = (index + CONTEXT_WINDOW + 1).min(ops.len());
    ops[start..end]
        .iter()
        .enumerate()
        .map(|(offset, op)| {
            if start + offset == index {
                format!("[{op}]")
            } else {
                op.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Location of an echoed WRITE whose next data operation is not its echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoViolation {
    pub stage: String,
    pub index: usize,
}

/// Lists every WRITE outside raw payload regions that is not followed by a
/// READ of the same value. PURGE and SET_TIMEOUTS in between are skipped.
pub fn echo_violations(trace: &ProtocolTrace, table: &CommandTable) -> Vec<EchoViolation> {
    let mut violations = Vec::new();
    for stage in &trace.stages {
        let mut ctx = Context::new(table);
        let ops = &stage.operations;
        for (index, op) in ops.iter().enumerate() {
            let (Action::Write, Some(value)) = (op.action, op.value) else {
                continue;
            };
            if !(op.recovered || ctx.advance(value)) {
                continue;
            }
            let echo = ops[index + 1..]
                .iter()
                .find(|next| next.action.carries_value());
            if !echo.is_some_and(|e| e.is_read() && e.value == Some(value)) {
                violations.push(EchoViolation {
                    stage: stage.name.clone(),
                    index,
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceType;
    use proptest::prelude::*;

    fn table() -> &'static CommandTable {
        &DeviceType::Mr72.profile().commands
    }

    fn single_stage(ops: Vec<Operation>) -> ProtocolTrace {
        ProtocolTrace::new(vec![Stage::new(2, "store", ops)])
    }

    // Echoed write/read pair at `tick`.
    fn cycle(value: u8, tick: u64) -> [Operation; 2] {
        [
            Operation::write(value).at(tick, tick),
            Operation::read(value).at(tick + 16, tick + 16).with_delay(ECHO_BASELINE_MS),
        ]
    }

    #[test]
    fn splices_dropped_cycle_before_anomalous_read() {
        let trace = single_stage(vec![
            Operation::write(0x49).at(100, 100),
            Operation::read(0x20).at(116, 116).with_delay(32),
        ]);

        let recovery = recover(&trace, table()).unwrap();
        let ops = &recovery.trace.stages[0].operations;
        let shape: Vec<_> = ops.iter().map(|o| (o.action, o.value)).collect();
        assert_eq!(
            shape,
            vec![
                (Action::Write, Some(0x49)),
                (Action::Read, Some(0x49)),
                (Action::Purge, None),
                (Action::Write, Some(0x49)),
                (Action::SetTimeouts, None),
                (Action::Read, Some(0x49)),
                (Action::Read, Some(0x49)),
            ]
        );
        assert!(ops[1..].iter().all(|o| o.recovered));
        assert_eq!(ops.iter().filter(|o| o.is_read()).last().unwrap().value, Some(0x49));
        assert_eq!(ops[6].start_tick, 116);
        assert!(ops.windows(2).all(|w| w[0].start_tick <= w[1].start_tick));

        assert_eq!(
            recovery.fixes,
            vec![Fix {
                stage: "store".into(),
                index: 1,
                tick: 116,
                restored: 0x49,
                observed: 0x20,
            }]
        );
    }

    #[test]
    fn recovery_is_a_fixed_point() {
        let trace = single_stage(vec![
            Operation::write(0x49).at(100, 100),
            Operation::read(0x20).at(116, 116).with_delay(31),
            Operation::write(b'A').at(150, 150),
            Operation::read(b'A').at(166, 166).with_delay(16),
        ]);
        let once = recover(&trace, table()).unwrap();
        assert_eq!(once.fixes.len(), 1);

        let twice = recover(&once.trace, table()).unwrap();
        assert!(twice.fixes.is_empty());
        assert_eq!(twice.trace, once.trace);
        assert!(echo_violations(&twice.trace, table()).is_empty());
    }

    #[test]
    fn mismatch_at_baseline_delay_is_unrecoverable() {
        let mut ops = cycle(b'R', 0).to_vec();
        ops.push(Operation::write(0x00).at(40, 40));
        ops.push(Operation::read(0x01).at(56, 56).with_delay(16));

        let err = recover(&single_stage(ops), table()).unwrap_err();
        let RecoveryError::MissingByteUnrecoverable {
            index,
            reason,
            expected,
            observed,
            context,
            ..
        } = err;
        assert_eq!(index, 3);
        assert_eq!(reason, Unrecoverable::EchoMismatch);
        assert_eq!((expected, observed), (0x00, 0x01));
        assert!(context.contains("[READ 0x01]"));
    }

    #[test]
    fn anomaly_after_unknown_command_is_unrecoverable() {
        let trace = single_stage(vec![
            Operation::write(b'Q').at(0, 0),
            Operation::read(b'X').at(32, 32).with_delay(32),
        ]);
        let err = recover(&trace, table()).unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::MissingByteUnrecoverable {
                reason: Unrecoverable::UnknownContext,
                ..
            }
        ));
    }

    #[test]
    fn raw_payload_is_not_echo_checked() {
        let trace = single_stage(vec![
            Operation::write(b'W'),
            Operation::read(b'W'),
            Operation::write(b'1'),
            Operation::read(b'?').with_delay(16),
            Operation::write(b'2'),
            Operation::write(b'V'),
            Operation::read(b'V'),
        ]);
        let recovery = recover(&trace, table()).unwrap();
        assert!(recovery.fixes.is_empty());
        assert!(echo_violations(&recovery.trace, table()).is_empty());
    }

    #[test]
    fn control_directives_do_not_break_echo_pairing() {
        let trace = single_stage(vec![
            Operation::write(b'i'),
            Operation::purge(),
            Operation::read(b'i'),
        ]);
        assert!(recover(&trace, table()).unwrap().fixes.is_empty());
        assert!(echo_violations(&trace, table()).is_empty());
    }

    #[test]
    fn context_resets_per_stage() {
        // 'I' opens a 54-byte payload in stage one; stage two starts fresh,
        // so its first byte is read as a command again.
        let stage_one = Stage::new(1, "one", cycle(b'I', 0).to_vec());
        let stage_two = Stage::new(
            2,
            "two",
            vec![
                Operation::write(b'Q'),
                Operation::read(b'Z').with_delay(32),
            ],
        );
        let err = recover(&ProtocolTrace::new(vec![stage_one, stage_two]), table()).unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::MissingByteUnrecoverable {
                reason: Unrecoverable::UnknownContext,
                ..
            }
        ));
    }

    #[test]
    fn reports_missing_echo_as_violation() {
        let trace = single_stage(vec![Operation::write(b'R'), Operation::write(0x00)]);
        assert_eq!(
            echo_violations(&trace, table()),
            vec![
                EchoViolation {
                    stage: "store".into(),
                    index: 0
                },
                EchoViolation {
                    stage: "store".into(),
                    index: 1
                },
            ]
        );
    }

    // ── Properties ─────────────────────────────────────────────

    fn arb_command_bytes() -> impl Strategy<Value = Vec<u8>> {
        let command = prop_oneof![
            prop::collection::vec(any::<u8>(), 54).prop_map(|p| [vec![b'I'], p].concat()),
            prop::collection::vec(any::<u8>(), 4).prop_map(|p| [vec![b'R'], p].concat()),
            prop::collection::vec(b'0'..=b'9', 0..6).prop_map(|p| [vec![b'W'], p, vec![b'V']].concat()),
        ];
        prop::collection::vec(command, 1..6).prop_map(|cmds| cmds.concat())
    }

    // Renders bytes as a clean capture: echoed bytes get a READ, raw payload does not.
    fn clean_trace(bytes: &[u8]) -> ProtocolTrace {
        let mut ctx = Context::new(table());
        let mut ops = Vec::new();
        let mut tick = 0;
        for &byte in bytes {
            ops.push(Operation::write(byte).at(tick, tick));
            tick += 16;
            if ctx.advance(byte) {
                ops.push(Operation::read(byte).at(tick, tick).with_delay(ECHO_BASELINE_MS));
                tick += 16;
            }
        }
        single_stage(ops)
    }

    proptest! {
        #[test]
        fn clean_traces_need_no_fixes(bytes in arb_command_bytes()) {
            let trace = clean_trace(&bytes);
            let recovery = recover(&trace, table()).unwrap();
            prop_assert!(recovery.fixes.is_empty());
            prop_assert_eq!(recovery.trace, trace);
        }

        #[test]
        fn corrupted_echo_is_repaired_once(bytes in arb_command_bytes(), pick in any::<prop::sample::Index>(), noise in 1u8..=255) {
            let mut trace = clean_trace(&bytes);
            let ops = &mut trace.stages[0].operations;
            let reads: Vec<usize> = ops.iter().enumerate().filter(|(_, o)| o.is_read()).map(|(i, _)| i).collect();
            let target = reads[pick.index(reads.len())];
            let read = &mut ops[target];
            read.value = read.value.map(|v| v ^ noise);
            read.delay_before_ms = Some(32);

            let once = recover(&trace, table()).unwrap();
            prop_assert_eq!(once.fixes.len(), 1);
            prop_assert!(echo_violations(&once.trace, table()).is_empty());

            let twice = recover(&once.trace, table()).unwrap();
            prop_assert!(twice.fixes.is_empty());
        }
    }
}
