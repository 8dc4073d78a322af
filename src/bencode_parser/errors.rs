use std::num::ParseIntError;

use nom::error::{ErrorKind, ParseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BencodeError<I> {
    #[error("invalid integer encoding")]
    InvalidInteger(I),

    #[error("integer out of range: {1}")]
    ParseIntError(I, ParseIntError),

    #[error("invalid byte string length")]
    InvalidBytesLength(I),

    #[error("trailing data after the last value")]
    TrailingData(I),

    #[error("expected exactly one top-level value, found {0}")]
    ValueCount(usize),

    #[error("parser error: {1:?}")]
    Nom(I, ErrorKind),
}

impl<I> ParseError<I> for BencodeError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        BencodeError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}
