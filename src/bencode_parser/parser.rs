use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::{consumed, opt, recognize},
    multi::{many_till, many0},
    sequence::{delimited, pair, preceded},
};
use std::collections::BTreeMap;

pub use nom::Err;

use crate::bencode_parser::errors::BencodeError;
type BErr<'a> = BencodeError<&'a [u8]>;
type BenResult<'a> = IResult<&'a [u8], Value<'a>, BErr<'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Bytes(&'a [u8]),
    Integer(i64),
    List(Vec<Self>),
    /// `raw` is the exact encoded span of the dictionary, used for info hashes.
    Dictionary {
        entries: BTreeMap<&'a [u8], Self>,
        raw: &'a [u8],
    },
}

impl<'a> Value<'a> {
    fn parse_integer(start_inp: &'a [u8]) -> BenResult<'a> {
        let (inp, value) = delimited(
            char::<_, BErr<'a>>('i'),
            recognize(pair(opt(char('-')), digit1)),
            char('e'),
        )
        .parse(start_inp)?;

        let value_str = std::str::from_utf8(value)
            .map_err(|_| nom::Err::Failure(BencodeError::InvalidInteger(start_inp)))?;

        if value_str.starts_with("-0") || (value_str.starts_with('0') && value_str.len() > 1) {
            Err(nom::Err::Failure(BencodeError::InvalidInteger(start_inp)))
        } else {
            let value_integer: i64 = value_str
                .parse()
                .map_err(|e| nom::Err::Failure(BencodeError::ParseIntError(start_inp, e)))?;
            Ok((inp, Value::Integer(value_integer)))
        }
    }

    fn parse_bytes(start_inp: &'a [u8]) -> BenResult<'a> {
        let (inp, length) = digit1::<_, BErr<'a>>(start_inp)?;

        let (inp, _) = char::<_, BErr<'a>>(':').parse(inp)?;

        let length = std::str::from_utf8(length)
            .map_err(|_| nom::Err::Failure(BencodeError::InvalidBytesLength(start_inp)))?;

        if length.len() > 1 && length.starts_with('0') {
            return Err(nom::Err::Failure(BencodeError::InvalidBytesLength(start_inp)));
        }

        let length: usize = length
            .parse()
            .map_err(|e| nom::Err::Failure(BencodeError::ParseIntError(start_inp, e)))?;

        let (inp, characters) = take::<usize, &'a [u8], BErr<'a>>(length).parse(inp)?;

        Ok((inp, Value::Bytes(characters)))
    }

    fn parse_list(start_inp: &'a [u8]) -> BenResult<'a> {
        let (inp, value) = preceded(
            char('l'),
            many_till(
                alt((
                    Self::parse_bytes,
                    Self::parse_integer,
                    Self::parse_list,
                    Self::parse_dict,
                )),
                char('e'),
            ),
        )
        .parse(start_inp)?;

        Ok((inp, Value::List(value.0)))
    }

    fn parse_dict(start_inp: &'a [u8]) -> BenResult<'a> {
        let (inp, (raw, value)) = consumed(preceded(
            char('d'),
            many_till(
                pair(
                    Self::parse_bytes,
                    alt((
                        Self::parse_bytes,
                        Self::parse_integer,
                        Self::parse_list,
                        Self::parse_dict,
                    )),
                ),
                char('e'),
            ),
        ))
        .parse(start_inp)?;

        let entries = value
            .0
            .into_iter()
            .filter_map(|(key, value)| match key {
                // parse_bytes only ever yields Bytes
                Value::Bytes(key) => Some((key, value)),
                _ => None,
            })
            .collect();

        Ok((inp, Value::Dictionary { entries, raw }))
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<&'a [u8], Value<'a>>> {
        match self {
            Value::Dictionary { entries, .. } => Some(entries),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for missing keys and non-dictionaries.
    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// The encoded bytes of a dictionary value.
    pub fn raw(&self) -> Option<&'a [u8]> {
        match self {
            Value::Dictionary { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Parses the provided bencode `source`.
///
/// # Errors
/// Returns `Err` if there was an error parsing `source`.
pub fn parse(source: &[u8]) -> Result<Vec<Value<'_>>, Err<BencodeError<&[u8]>>> {
    let (rest, items) = many0(alt((
        Value::parse_bytes,
        Value::parse_integer,
        Value::parse_list,
        Value::parse_dict,
    )))
    .parse(source)?;

    if !rest.is_empty() {
        return Err(Err::Error(BencodeError::TrailingData(rest)));
    }

    Ok(items)
}

/// Parses a document holding exactly one top-level value.
pub fn parse_single(source: &[u8]) -> Result<Value<'_>, Err<BencodeError<&[u8]>>> {
    let mut items = parse(source)?;
    if items.len() != 1 {
        return Err(Err::Error(BencodeError::ValueCount(items.len())));
    }
    Ok(items.remove(0))
}
