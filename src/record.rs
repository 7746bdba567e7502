//! Sortable record and its line codec.

use std::error::Error;
use std::fmt;
use std::num;
use std::str::FromStr;

use deepsize;

/// Record decoding error.
#[derive(Debug)]
pub enum DecodeError {
    /// Line has fewer than three delimited fields.
    MissingField,
    /// Key field is not a valid signed integer.
    InvalidKey(num::ParseIntError),
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            DecodeError::MissingField => None,
            DecodeError::InvalidKey(err) => Some(err),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            DecodeError::MissingField => write!(f, "record line has fewer than three fields"),
            DecodeError::InvalidKey(err) => write!(f, "record key is not a valid integer: {}", err),
        }
    }
}

/// A sortable record: a signed integer key and two text fields.
///
/// The line form is `<key>,<name>,<value>`. The name field contains no comma;
/// the value field is the unparsed remainder of the line and may contain
/// further commas. Encoding a decoded record reproduces the original line.
#[derive(Debug, Clone, PartialEq, Eq, deepsize::DeepSizeOf)]
pub struct Record {
    /// Sort key. Ordering of records is total on this field alone.
    pub key: i64,
    /// First text field.
    pub name: String,
    /// Second text field, takes the rest of the line.
    pub value: String,
}

impl Record {
    pub fn new(key: i64, name: impl Into<String>, value: impl Into<String>) -> Self {
        Record {
            key,
            name: name.into(),
            value: value.into(),
        }
    }
}

impl FromStr for Record {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (key, rest) = line.split_once(',').ok_or(DecodeError::MissingField)?;
        let (name, value) = rest.split_once(',').ok_or(DecodeError::MissingField)?;

        let key = key.parse::<i64>().map_err(|err| DecodeError::InvalidKey(err))?;

        return Ok(Record {
            key,
            name: name.to_owned(),
            value: value.to_owned(),
        });
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.key, self.name, self.value)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{DecodeError, Record};

    #[rstest]
    #[case("5,alice,f", Record::new(5, "alice", "f"))]
    #[case("-17,bob,m", Record::new(-17, "bob", "m"))]
    #[case("0,,", Record::new(0, "", ""))]
    #[case("3,carol,x,y,z", Record::new(3, "carol", "x,y,z"))]
    fn test_decode(#[case] line: &str, #[case] expected: Record) {
        let record: Record = line.parse().unwrap();
        assert_eq!(record, expected);
    }

    #[rstest]
    #[case("5,alice,f")]
    #[case("3,carol,x,y,z")]
    #[case("-9223372036854775808,min,key")]
    #[case("0,,")]
    fn test_round_trip(#[case] line: &str) {
        let record: Record = line.parse().unwrap();
        assert_eq!(record.to_string(), line);
    }

    #[rstest]
    #[case("")]
    #[case("12")]
    #[case("12,no second delimiter")]
    fn test_decode_missing_field(#[case] line: &str) {
        assert!(matches!(line.parse::<Record>(), Err(DecodeError::MissingField)));
    }

    #[rstest]
    #[case("abc,alice,f")]
    #[case("12.5,bob,m")]
    #[case(",alice,f")]
    #[case("99999999999999999999999999,big,key")]
    fn test_decode_invalid_key(#[case] line: &str) {
        assert!(matches!(line.parse::<Record>(), Err(DecodeError::InvalidKey(_))));
    }
}
