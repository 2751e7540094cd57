use thiserror::Error;

/// Errors produced while decoding bencoded payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at offset {0}")]
    InvalidStringLength(usize),

    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("dictionary key is not a byte string at offset {0}")]
    NonStringKey(usize),

    #[error("{0} trailing bytes after value")]
    TrailingData(usize),

    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),
}
