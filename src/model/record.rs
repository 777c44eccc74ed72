use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::model::field::{Field, FieldType};
use crate::model::varint::{read_uvarint, write_uvarint};

/// A fixed schema tuple of fields. The first field is always the
/// timestamp; the remaining fields follow the record type definition the
/// record was validated against.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    record_type: usize,
    fields: Vec<Field>,
}

impl Record {
    pub fn new(record_type: usize, fields: Vec<Field>) -> Record {
        Record {
            record_type,
            fields,
        }
    }

    pub fn record_type(&self) -> usize {
        self.record_type
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// The record timestamp. Every record admitted into the engine has a
    /// timestamp as its first field; records that do not are rejected by
    /// [`Record::validate`] before reaching any stateful path.
    pub fn timestamp(&self) -> i64 {
        match self.fields.first() {
            Some(Field::Timestamp(ts)) => *ts,
            _ => i64::MIN,
        }
    }

    /// Checks this record against the declared field types.
    pub fn validate(&self, field_types: &[FieldType]) -> Result<()> {
        if self.fields.len() != field_types.len() {
            return Err(Error::InvalidRecord(format!(
                "expected {} fields, got {}",
                field_types.len(),
                self.fields.len()
            )));
        }
        if !matches!(self.fields.first(), Some(Field::Timestamp(_))) {
            return Err(Error::InvalidRecord(
                "first field must be the timestamp".to_string(),
            ));
        }
        for (index, (field, expected)) in self.fields.iter().zip(field_types).enumerate() {
            if field.field_type() != *expected {
                return Err(Error::InvalidRecord(format!(
                    "field {index} has type {:?}, expected {expected:?}",
                    field.field_type()
                )));
            }
        }
        Ok(())
    }

    /// The zero record a block's delta chain starts from for a type.
    pub fn zero(record_type: usize, field_types: &[FieldType]) -> Record {
        Record {
            record_type,
            fields: field_types.iter().map(|t| Field::zero(*t)).collect(),
        }
    }

    /// Writes the record with absolute field values, prefixed by its
    /// record type. Used by the commit log payload codec.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_uvarint(writer, self.record_type as u64)?;
        for field in &self.fields {
            field.write_to(writer)?;
        }
        Ok(())
    }

    /// Reads a record written by [`Record::write_to`]. The caller resolves
    /// the field types for the decoded record type index.
    pub fn read_from<R: Read>(
        reader: &mut R,
        field_types_of: impl Fn(usize) -> Result<Vec<FieldType>>,
    ) -> Result<Record> {
        let record_type = read_uvarint(reader)? as usize;
        let field_types = field_types_of(record_type)?;
        let mut fields = Vec::with_capacity(field_types.len());
        for field_type in field_types {
            fields.push(Field::read_from(field_type, reader)?);
        }
        Ok(Record {
            record_type,
            fields,
        })
    }
}
