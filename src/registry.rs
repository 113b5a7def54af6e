//! # Device Signature Registry
//!
//! Static protocol knowledge reconstructed from captured traffic: which
//! handshake byte identifies which device variant, how long each variant's
//! serial number is, the closed set of command bytes each variant accepts, and
//! the stage templates the executor instantiates.
//!
//! Adding a device variant means adding a [`DeviceType`] entry and its
//! [`DeviceProfile`]; nothing else changes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Writes the 54-byte treatment name field.
pub const CMD_NAME: u8 = b'I';
/// Starts playback at the row given by the 4-byte argument.
pub const CMD_RUN: u8 = b'R';
/// Announces the program size (row count) as a 4-byte argument.
pub const CMD_PROGRAM: u8 = b'P';
/// Streams one row of treatment data, terminated by [`ROW_TERMINATOR`].
pub const CMD_WRITE_ROW: u8 = b'W';
/// Identify request, terminated by [`IDENTIFY_TERMINATOR`].
pub const CMD_IDENTIFY: u8 = b'i';

pub const NAME_FIELD_LEN: usize = 54;
pub const ARG_LEN: usize = 4;
pub const ROW_TERMINATOR: u8 = b'V';
pub const IDENTIFY_TERMINATOR: u8 = 0x7F;

/// Payload shape following a command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLength {
    /// Exactly `n` payload bytes, each echoed by the device.
    Fixed(usize),
    /// Raw bytes up to and including the terminator. Only the terminator is echoed.
    UntilTerminator(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub byte: u8,
    pub payload: PayloadLength,
}

impl CommandSpec {
    const fn fixed(byte: u8, len: usize) -> Self {
        Self {
            byte,
            payload: PayloadLength::Fixed(len),
        }
    }

    const fn terminated(byte: u8, terminator: u8) -> Self {
        Self {
            byte,
            payload: PayloadLength::UntilTerminator(terminator),
        }
    }
}

/// Closed set of command bytes understood by one device variant.
#[derive(Debug, Clone, Copy)]
pub struct CommandTable {
    commands: &'static [CommandSpec],
}

impl CommandTable {
    pub const fn new(commands: &'static [CommandSpec]) -> Self {
        Self { commands }
    }

    pub fn get(&self, byte: u8) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.byte == byte)
    }

    pub fn contains(&self, byte: u8) -> bool {
        self.get(byte).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.iter()
    }
}

/// Runtime value a command payload is filled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Empty,
    TreatmentName,
    RowCount,
    RowIndex,
    RowData,
}

/// One element of a stage template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Purge,
    SetTimeouts,
    Command { byte: u8, payload: Payload },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Init,
    Store,
    Playback,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Init => "init",
            StageName::Store => "store",
            StageName::Playback => "playback",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation template for one stage. `per_row` repeats once for every
/// treatment row between `prologue` and `epilogue`.
#[derive(Debug, Clone, Copy)]
pub struct StageTemplate {
    pub name: StageName,
    pub prologue: &'static [Step],
    pub per_row: &'static [Step],
    pub epilogue: &'static [Step],
}

/// Everything the bridge knows about one device variant.
#[derive(Debug)]
pub struct DeviceProfile {
    pub device_type: DeviceType,
    /// Handshake response byte identifying the variant.
    pub signature: u8,
    pub serial_len: usize,
    pub read_timeout: Duration,
    pub commands: CommandTable,
    pub init: StageTemplate,
    pub store: StageTemplate,
    pub playback: StageTemplate,
}

impl DeviceProfile {
    pub fn stage(&self, name: StageName) -> &StageTemplate {
        match name {
            StageName::Init => &self.init,
            StageName::Store => &self.store,
            StageName::Playback => &self.playback,
        }
    }
}

// --- Reconstructed tables ---

const FULL_COMMANDS: &[CommandSpec] = &[
    CommandSpec::fixed(CMD_NAME, NAME_FIELD_LEN),
    CommandSpec::fixed(CMD_RUN, ARG_LEN),
    CommandSpec::fixed(CMD_PROGRAM, ARG_LEN),
    CommandSpec::terminated(CMD_WRITE_ROW, ROW_TERMINATOR),
    CommandSpec::terminated(CMD_IDENTIFY, IDENTIFY_TERMINATOR),
];

// The EM27 firmware predates the program-size command.
const EM27_COMMANDS: &[CommandSpec] = &[
    CommandSpec::fixed(CMD_NAME, NAME_FIELD_LEN),
    CommandSpec::fixed(CMD_RUN, ARG_LEN),
    CommandSpec::terminated(CMD_WRITE_ROW, ROW_TERMINATOR),
    CommandSpec::terminated(CMD_IDENTIFY, IDENTIFY_TERMINATOR),
];

/// Commands the handshake uses before the variant is known. Every variant's
/// table includes them.
pub const HANDSHAKE_COMMANDS: CommandTable = CommandTable::new(IDENTIFY_COMMANDS);

const IDENTIFY_COMMANDS: &[CommandSpec] =
    &[CommandSpec::terminated(CMD_IDENTIFY, IDENTIFY_TERMINATOR)];

/// Stage 1 is identical on every variant; the handshake depends on it.
pub const INIT_STAGE: StageTemplate = StageTemplate {
    name: StageName::Init,
    prologue: &[
        Step::Purge,
        Step::SetTimeouts,
        Step::Command {
            byte: CMD_IDENTIFY,
            payload: Payload::Empty,
        },
    ],
    per_row: &[],
    epilogue: &[],
};

const STORE_STAGE: StageTemplate = StageTemplate {
    name: StageName::Store,
    prologue: &[
        Step::Purge,
        Step::SetTimeouts,
        Step::Command {
            byte: CMD_NAME,
            payload: Payload::TreatmentName,
        },
        Step::Command {
            byte: CMD_PROGRAM,
            payload: Payload::RowCount,
        },
    ],
    per_row: &[Step::Command {
        byte: CMD_WRITE_ROW,
        payload: Payload::RowData,
    }],
    epilogue: &[],
};

const EM27_STORE_STAGE: StageTemplate = StageTemplate {
    name: StageName::Store,
    prologue: &[
        Step::Purge,
        Step::SetTimeouts,
        Step::Command {
            byte: CMD_NAME,
            payload: Payload::TreatmentName,
        },
    ],
    per_row: &[Step::Command {
        byte: CMD_WRITE_ROW,
        payload: Payload::RowData,
    }],
    epilogue: &[],
};

// Every row is self-contained so playback can resume at any row boundary.
const PLAYBACK_STAGE: StageTemplate = StageTemplate {
    name: StageName::Playback,
    prologue: &[],
    per_row: &[
        Step::Purge,
        Step::Command {
            byte: CMD_RUN,
            payload: Payload::RowIndex,
        },
        Step::SetTimeouts,
    ],
    epilogue: &[],
};

static MR72: DeviceProfile = DeviceProfile {
    device_type: DeviceType::Mr72,
    signature: b'K',
    serial_len: 8,
    read_timeout: Duration::from_millis(500),
    commands: CommandTable::new(FULL_COMMANDS),
    init: INIT_STAGE,
    store: STORE_STAGE,
    playback: PLAYBACK_STAGE,
};

static EM272B: DeviceProfile = DeviceProfile {
    device_type: DeviceType::Em272b,
    signature: b'H',
    serial_len: 8,
    read_timeout: Duration::from_millis(800),
    commands: CommandTable::new(FULL_COMMANDS),
    init: INIT_STAGE,
    store: STORE_STAGE,
    playback: PLAYBACK_STAGE,
};

static EM27: DeviceProfile = DeviceProfile {
    device_type: DeviceType::Em27,
    signature: b'E',
    serial_len: 6,
    read_timeout: Duration::from_millis(800),
    commands: CommandTable::new(EM27_COMMANDS),
    init: INIT_STAGE,
    store: EM27_STORE_STAGE,
    playback: PLAYBACK_STAGE,
};

static MR772: DeviceProfile = DeviceProfile {
    device_type: DeviceType::Mr772,
    signature: b'G',
    serial_len: 10,
    read_timeout: Duration::from_millis(500),
    commands: CommandTable::new(FULL_COMMANDS),
    init: INIT_STAGE,
    store: STORE_STAGE,
    playback: PLAYBACK_STAGE,
};

/// Supported device variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "MR72")]
    Mr72,
    #[serde(rename = "EM272B")]
    Em272b,
    #[serde(rename = "EM27")]
    Em27,
    #[serde(rename = "MR772")]
    Mr772,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Mr72,
        DeviceType::Em272b,
        DeviceType::Em27,
        DeviceType::Mr772,
    ];

    pub fn profile(self) -> &'static DeviceProfile {
        match self {
            DeviceType::Mr72 => &MR72,
            DeviceType::Em272b => &EM272B,
            DeviceType::Em27 => &EM27,
            DeviceType::Mr772 => &MR772,
        }
    }

    /// Resolves a handshake response byte.
    pub fn from_signature(byte: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.profile().signature == byte)
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Mr72 => "MR72",
            DeviceType::Em272b => "EM272B",
            DeviceType::Em27 => "EM27",
            DeviceType::Mr772 => "MR772",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown device type '{s}'"))
    }
}

/// A resolved device: its variant plus the serial number read at handshake.
/// This is the identity handed to external clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVariant {
    pub device_type: DeviceType,
    pub serial_number: String,
}

impl DeviceVariant {
    pub fn profile(&self) -> &'static DeviceProfile {
        self.device_type.profile()
    }
}

impl fmt::Display for DeviceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.device_type, self.serial_number)
    }
}
