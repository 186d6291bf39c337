use core::fmt;

use bytecode::DecodeError;

use crate::{BlockId, VerifyError};

/// Why a method could not be translated into a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    Decode(DecodeError),
    EmptyMethod,
    /// A jump at `offset` lands between instructions or outside the method.
    InvalidJumpTarget { offset: u32, target: i64 },
    /// The method runs off its end without a return, throw or jump.
    FallThroughEnd { offset: u32 },
    InvalidRegister { offset: u32, reg: u16 },
    InvalidTryBlock { start: u32, end: u32 },
    /// A value definition could not be found; `reg` is `None` for the
    /// accumulator.
    UnresolvedValue { block: BlockId, reg: Option<u16> },
    InvalidCircuit(VerifyError),
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "malformed bytecode: {err}"),
            Self::EmptyMethod => write!(f, "method has no instructions"),
            Self::InvalidJumpTarget { offset, target } => {
                write!(f, "jump at {offset} targets {target}, which is not an instruction")
            }
            Self::FallThroughEnd { offset } => {
                write!(f, "control falls off the end of the method after {offset}")
            }
            Self::InvalidRegister { offset, reg } => {
                write!(f, "instruction at {offset} uses undeclared register r{reg}")
            }
            Self::InvalidTryBlock { start, end } => {
                write!(f, "try block [{start}, {end}) does not cover whole instructions")
            }
            Self::UnresolvedValue { block, reg: Some(reg) } => {
                write!(f, "no definition of r{reg} reaches block {block}")
            }
            Self::UnresolvedValue { block, reg: None } => {
                write!(f, "no definition of the accumulator reaches block {block}")
            }
            Self::InvalidCircuit(err) => write!(f, "invalid circuit: {err}"),
        }
    }
}

impl std::error::Error for TranslateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            Self::InvalidCircuit(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for TranslateError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<VerifyError> for TranslateError {
    fn from(err: VerifyError) -> Self {
        Self::InvalidCircuit(err)
    }
}
