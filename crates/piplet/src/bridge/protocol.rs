//! Frame and record types for worker communication.
//!
//! Commands are reserved negative length prefixes, so control markers and
//! data records share a single framing layer. The command set is host→worker
//! only; a command opcode on the worker's stdout is a protocol violation.

use bytes::Bytes;

/// Stderr line prefix by which a worker signals an unrecoverable failure.
///
/// Everything after the prefix is the failure reason. The host's stderr
/// drain converts such a line into a latched worker fault.
pub const FATAL_MARKER: &str = "PIPLET-FATAL:";

/// Control markers written onto the worker's input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SetupMap,
    SetupReduce,
    CleanupMap,
    CleanupReduce,
    Flush,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::SetupMap,
        Command::SetupReduce,
        Command::CleanupMap,
        Command::CleanupReduce,
        Command::Flush,
    ];

    /// Reserved wire value. Data frames use non-negative prefixes, so every
    /// opcode is negative.
    pub const fn opcode(self) -> i32 {
        match self {
            Command::SetupMap => -1,
            Command::SetupReduce => -2,
            Command::CleanupMap => -3,
            Command::CleanupReduce => -4,
            Command::Flush => -5,
        }
    }

    pub fn from_opcode(opcode: i32) -> Option<Command> {
        match opcode {
            -1 => Some(Command::SetupMap),
            -2 => Some(Command::SetupReduce),
            -3 => Some(Command::CleanupMap),
            -4 => Some(Command::CleanupReduce),
            -5 => Some(Command::Flush),
            _ => None,
        }
    }
}

/// One self-delimiting unit on the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command(Command),
    Data(Bytes),
}

/// An opaque record handed over by the host framework.
///
/// The key is optional; values-only tasks never carry one. Both halves are
/// immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Record {
    pub fn keyed(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
        }
    }

    pub fn unkeyed(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_negative_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for cmd in Command::ALL {
            assert!(cmd.opcode() < 0);
            assert!(seen.insert(cmd.opcode()));
        }
    }

    #[test]
    fn opcode_round_trips() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_opcode(cmd.opcode()), Some(cmd));
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(Command::from_opcode(-6), None);
        assert_eq!(Command::from_opcode(-128), None);
        assert_eq!(Command::from_opcode(i32::MIN), None);
    }

    #[test]
    fn record_constructors() {
        let keyed = Record::keyed("k", "v");
        assert_eq!(keyed.key, Some(Bytes::from("k")));
        assert_eq!(keyed.value, Bytes::from("v"));

        let unkeyed = Record::unkeyed("v");
        assert_eq!(unkeyed.key, None);
    }
}
