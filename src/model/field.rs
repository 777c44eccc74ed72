use std::cmp::Ordering;
use std::fmt::Display;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::errdata;
use crate::error::Result;
use crate::model::varint::{read_varint, write_varint};

/// Resolution of the timestamps in a time series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimeUnit {
    /// Number of ticks per second at this resolution.
    pub fn ticks_per_second(&self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Milliseconds => 1_000,
            TimeUnit::Microseconds => 1_000_000,
            TimeUnit::Nanoseconds => 1_000_000_000,
        }
    }

    /// Converts a timestamp at this resolution into milliseconds, with
    /// sub-millisecond resolutions truncating towards negative infinity.
    pub fn to_millis(&self, timestamp: i64) -> i64 {
        match self {
            TimeUnit::Seconds => timestamp.saturating_mul(1_000),
            TimeUnit::Milliseconds => timestamp,
            TimeUnit::Microseconds => timestamp.div_euclid(1_000),
            TimeUnit::Nanoseconds => timestamp.div_euclid(1_000_000),
        }
    }
}

/// The type of a field, as declared by a record type definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Timestamp,
    Int,
    Decimal,
    Byte,
}

/// A single typed value inside a record.
///
/// Decimals are kept as mantissa and exponent so that deltas stay exact;
/// `2.5` is `{mantissa: 25, exponent: -1}`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Field {
    Timestamp(i64),
    Int(i64),
    Decimal { mantissa: i64, exponent: i8 },
    Byte(u8),
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Timestamp(_) => FieldType::Timestamp,
            Field::Int(_) => FieldType::Int,
            Field::Decimal { .. } => FieldType::Decimal,
            Field::Byte(_) => FieldType::Byte,
        }
    }

    /// The zero value a delta chain starts from at the head of a block.
    pub fn zero(field_type: FieldType) -> Field {
        match field_type {
            FieldType::Timestamp => Field::Timestamp(0),
            FieldType::Int => Field::Int(0),
            FieldType::Decimal => Field::Decimal {
                mantissa: 0,
                exponent: 0,
            },
            FieldType::Byte => Field::Byte(0),
        }
    }

    /// Builds a decimal field from an f64, normalised to at most three
    /// fractional digits. Convenience for callers and tests.
    pub fn decimal(value: f64) -> Field {
        let mantissa = (value * 1000.0).round() as i64;
        Field::Decimal {
            mantissa,
            exponent: -3,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Field::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Writes the absolute value of this field. Used by the commit log
    /// payload codec, where deltas would not survive re-batching.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Field::Timestamp(value) | Field::Int(value) => {
                write_varint(writer, *value)?;
            }
            Field::Decimal { mantissa, exponent } => {
                write_varint(writer, *mantissa)?;
                write_varint(writer, *exponent as i64)?;
            }
            Field::Byte(value) => {
                writer.write_all(&[*value])?;
            }
        }
        Ok(())
    }

    /// Reads an absolute field value of the given type.
    pub fn read_from<R: Read>(field_type: FieldType, reader: &mut R) -> Result<Field> {
        match field_type {
            FieldType::Timestamp => Ok(Field::Timestamp(read_varint(reader)?)),
            FieldType::Int => Ok(Field::Int(read_varint(reader)?)),
            FieldType::Decimal => {
                let mantissa = read_varint(reader)?;
                let exponent = read_varint(reader)?;
                let exponent = i8::try_from(exponent)
                    .map_err(|_| errdata!("decimal exponent {exponent} out of range"))?;
                Ok(Field::Decimal { mantissa, exponent })
            }
            FieldType::Byte => {
                let mut byte = [0u8; 1];
                reader.read_exact(&mut byte)?;
                Ok(Field::Byte(byte[0]))
            }
        }
    }

    /// Writes this field as a delta against the previous value of the same
    /// field in the same record type. Bytes carry no useful delta and are
    /// written raw.
    pub fn write_delta<W: Write>(&self, previous: &Field, writer: &mut W) -> Result<()> {
        match (self, previous) {
            (Field::Timestamp(new), Field::Timestamp(old))
            | (Field::Int(new), Field::Int(old)) => {
                write_varint(writer, new.wrapping_sub(*old))?;
            }
            (
                Field::Decimal { mantissa, exponent },
                Field::Decimal {
                    mantissa: old_mantissa,
                    exponent: old_exponent,
                },
            ) => {
                write_varint(writer, mantissa.wrapping_sub(*old_mantissa))?;
                write_varint(writer, (*exponent as i64) - (*old_exponent as i64))?;
            }
            (Field::Byte(value), Field::Byte(_)) => {
                writer.write_all(&[*value])?;
            }
            (new, old) => {
                return Err(errdata!(
                    "field type mismatch: {:?} delta against {:?}",
                    new.field_type(),
                    old.field_type()
                ))
            }
        }
        Ok(())
    }

    /// Reads a delta and applies it to the previous value of the same field.
    pub fn read_delta<R: Read>(previous: &Field, reader: &mut R) -> Result<Field> {
        match previous {
            Field::Timestamp(old) => Ok(Field::Timestamp(old.wrapping_add(read_varint(reader)?))),
            Field::Int(old) => Ok(Field::Int(old.wrapping_add(read_varint(reader)?))),
            Field::Decimal { mantissa, exponent } => {
                let mantissa = mantissa.wrapping_add(read_varint(reader)?);
                let exponent = (*exponent as i64) + read_varint(reader)?;
                let exponent = i8::try_from(exponent)
                    .map_err(|_| errdata!("decimal exponent {exponent} out of range"))?;
                Ok(Field::Decimal { mantissa, exponent })
            }
            Field::Byte(_) => {
                let mut byte = [0u8; 1];
                reader.read_exact(&mut byte)?;
                Ok(Field::Byte(byte[0]))
            }
        }
    }
}

/// Fields compare within their own type only; comparing across types
/// yields `None`, which predicate evaluation treats as no match.
impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Field) -> Option<Ordering> {
        match (self, other) {
            (Field::Timestamp(a), Field::Timestamp(b)) | (Field::Int(a), Field::Int(b)) => {
                Some(a.cmp(b))
            }
            (Field::Byte(a), Field::Byte(b)) => Some(a.cmp(b)),
            (
                Field::Decimal { mantissa, exponent },
                Field::Decimal {
                    mantissa: other_mantissa,
                    exponent: other_exponent,
                },
            ) => {
                let a = (*mantissa as f64) * 10f64.powi(*exponent as i32);
                let b = (*other_mantissa as f64) * 10f64.powi(*other_exponent as i32);
                a.partial_cmp(&b)
            }
            _ => None,
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Field::Timestamp(value) => write!(f, "{value}"),
            Field::Int(value) => write!(f, "{value}"),
            Field::Decimal { mantissa, exponent } => {
                write!(f, "{}", (*mantissa as f64) * 10f64.powi(*exponent as i32))
            }
            Field::Byte(value) => write!(f, "{value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_roundtrip() {
        let fields = [
            Field::Timestamp(1_385_424_000_000_000_000),
            Field::Int(-42),
            Field::Decimal {
                mantissa: 15,
                exponent: -1,
            },
            Field::Byte(7),
        ];
        for field in fields {
            let mut buf = Vec::new();
            field.write_to(&mut buf).unwrap();
            let decoded = Field::read_from(field.field_type(), &mut buf.as_slice()).unwrap();
            assert_eq!(decoded, field);
        }
    }

    #[test]
    fn test_delta_roundtrip() {
        let old = Field::Timestamp(1_000_000);
        let new = Field::Timestamp(1_000_250);
        let mut buf = Vec::new();
        new.write_delta(&old, &mut buf).unwrap();
        // A 250 tick delta should take two bytes, not a full varint.
        assert!(buf.len() <= 2);
        assert_eq!(Field::read_delta(&old, &mut buf.as_slice()).unwrap(), new);
    }

    #[test]
    fn test_decimal_delta_roundtrip() {
        let old = Field::Decimal {
            mantissa: 15,
            exponent: -1,
        };
        let new = Field::Decimal {
            mantissa: 16,
            exponent: -1,
        };
        let mut buf = Vec::new();
        new.write_delta(&old, &mut buf).unwrap();
        assert_eq!(Field::read_delta(&old, &mut buf.as_slice()).unwrap(), new);
    }

    #[test]
    fn test_delta_type_mismatch() {
        let mut buf = Vec::new();
        assert!(Field::Int(1)
            .write_delta(&Field::Byte(0), &mut buf)
            .is_err());
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(TimeUnit::Nanoseconds.to_millis(1_500_000), 1);
        assert_eq!(TimeUnit::Microseconds.to_millis(1_500), 1);
        assert_eq!(TimeUnit::Milliseconds.to_millis(1_500), 1_500);
        assert_eq!(TimeUnit::Seconds.to_millis(2), 2_000);
        assert_eq!(TimeUnit::Seconds.to_millis(-2), -2_000);
        assert_eq!(TimeUnit::Nanoseconds.to_millis(-1), -1);
    }

    #[test]
    fn test_cross_type_comparison_is_none() {
        assert_eq!(Field::Int(1).partial_cmp(&Field::Byte(1)), None);
        assert!(Field::Int(1) < Field::Int(2));
    }
}
