use std::fmt;

/// Failures the core can report. Load-time variants come back from
/// `Nes::new`/`load_state`; runtime variants become a sticky fault that
/// `step` keeps returning until the machine is reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmuError {
    InvalidHeader(String),
    Truncated {
        section: &'static str,
        expected: usize,
        available: usize,
    },
    UnsupportedMapper(u16),
    Mapping {
        space: &'static str,
        target: usize,
        len: usize,
        reason: &'static str,
    },
    CpuJam {
        opcode: u8,
        pc: u16,
    },
    IncompatibleState(String),
}

impl fmt::Display for EmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader(reason) => write!(f, "invalid cartridge header: {reason}"),
            Self::Truncated {
                section,
                expected,
                available,
            } => write!(
                f,
                "cartridge truncated: {section} needs {expected} bytes, {available} available"
            ),
            Self::UnsupportedMapper(id) => write!(f, "mapper {id} is not supported"),
            Self::Mapping {
                space,
                target,
                len,
                reason,
            } => write!(
                f,
                "{space} mapping of {len:#X} bytes at ${target:04X} rejected: {reason}"
            ),
            Self::CpuJam { opcode, pc } => {
                write!(f, "CPU jammed on opcode ${opcode:02X} at ${pc:04X}")
            }
            Self::IncompatibleState(reason) => write!(f, "save state rejected: {reason}"),
        }
    }
}

impl std::error::Error for EmuError {}
