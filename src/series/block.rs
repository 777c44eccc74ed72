//! Data block codec.
//!
//! A block is the smallest unit of serialised record storage: a header
//! describing the records it holds followed by a delta encoded, optionally
//! compressed payload. Blocks are self describing and CRC protected so a
//! torn write or flipped bit is caught before any record is yielded.
//!
//! ## Block layout (big-endian)
//!
//! ```text
//! +------------------+-------------------+-----------------+
//! |recordCount:varint|uncompSize:varint  |compSize:varint  |
//! +---------------+--+--------+----------+--+--------------+
//! |compression:u8 | range.lower:i64      | range.upper:i64 |
//! +---------------+------+---------------+-----------------+
//! | crc32(payload):u32   | payload: compSize bytes         |
//! +----------------------+---------------------------------+
//! ```
//!
//! The CRC covers the uncompressed payload and is computed before
//! compression. Inside the payload each record is written as its record
//! type index followed by one marker byte per field: `0x00` when the field
//! matches the previous record of the same type, `0x01` followed by the
//! field delta otherwise. Every block restarts the last-record-per-type
//! state, so blocks decode independently of each other.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::field::{Field, FieldType};
use crate::model::range::TimeRange;
use crate::model::record::Record;
use crate::model::varint::{read_uvarint, write_uvarint};
use crate::{errcrc, errdata};

pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FIELD_UNCHANGED: u8 = 0x00;
const FIELD_DELTA: u8 = 0x01;

/// Payload compression applied when a block is written to a data file.
/// Mem series blocks are always uncompressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    pub fn as_u8(&self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<CompressionType> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            other => Err(errdata!("unknown compression type {other}")),
        }
    }
}

/// The header stamped onto every serialised block.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockHeader {
    pub record_count: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression: CompressionType,
    /// Closed interval of the timestamps in the payload.
    pub range: TimeRange,
    pub crc32: u32,
}

impl BlockHeader {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_uvarint(writer, self.record_count)?;
        write_uvarint(writer, self.uncompressed_size)?;
        write_uvarint(writer, self.compressed_size)?;
        writer.write_u8(self.compression.as_u8())?;
        writer.write_i64::<BigEndian>(self.range.lower)?;
        writer.write_i64::<BigEndian>(self.range.upper)?;
        writer.write_u32::<BigEndian>(self.crc32)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<BlockHeader> {
        let record_count = read_uvarint(reader)?;
        let uncompressed_size = read_uvarint(reader)?;
        let compressed_size = read_uvarint(reader)?;
        let compression = CompressionType::from_u8(reader.read_u8()?)?;
        let lower = reader.read_i64::<BigEndian>()?;
        let upper = reader.read_i64::<BigEndian>()?;
        let crc32 = reader.read_u32::<BigEndian>()?;
        Ok(BlockHeader {
            record_count,
            uncompressed_size,
            compressed_size,
            compression,
            range: TimeRange::new(lower, upper),
            crc32,
        })
    }
}

/// Encodes one record against the previous record of the same type,
/// appending to `buf`. `previous` is the delta base; the caller updates
/// its last-record state afterwards.
pub fn encode_record(record: &Record, previous: &Record, buf: &mut Vec<u8>) -> Result<()> {
    write_uvarint(buf, record.record_type() as u64)?;
    for (field, prev_field) in record.fields().iter().zip(previous.fields()) {
        if field == prev_field {
            buf.push(FIELD_UNCHANGED);
        } else {
            buf.push(FIELD_DELTA);
            field.write_delta(prev_field, buf)?;
        }
    }
    Ok(())
}

/// Writes a block to `writer` from its uncompressed payload chunks,
/// compressing under `compression`. Returns the total number of bytes
/// written, header included.
pub fn write_block<W: Write>(
    writer: &mut W,
    range: TimeRange,
    record_count: u64,
    chunks: &[Bytes],
    compression: CompressionType,
) -> Result<u64> {
    let uncompressed_size: usize = chunks.iter().map(|c| c.len()).sum();

    let mut digest = CRC32.digest();
    for chunk in chunks {
        digest.update(chunk);
    }
    let crc32 = digest.finalize();

    let payload: Vec<u8> = match compression {
        CompressionType::None => {
            let mut payload = Vec::with_capacity(uncompressed_size);
            for chunk in chunks {
                payload.extend_from_slice(chunk);
            }
            payload
        }
        CompressionType::Lz4 => {
            let mut raw = Vec::with_capacity(uncompressed_size);
            for chunk in chunks {
                raw.extend_from_slice(chunk);
            }
            lz4_flex::compress(&raw)
        }
    };

    let header = BlockHeader {
        record_count,
        uncompressed_size: uncompressed_size as u64,
        compressed_size: payload.len() as u64,
        compression,
        range,
        crc32,
    };

    let mut out = Vec::with_capacity(payload.len() + 32);
    header.write_to(&mut out)?;
    out.extend_from_slice(&payload);
    writer.write_all(&out)?;
    Ok(out.len() as u64)
}

/// Reads one block, decompresses it and verifies the payload CRC before
/// returning. A mismatch fails with [`Error::ChecksumMismatch`] and no
/// record from the block is ever surfaced.
pub fn read_block<R: Read>(reader: &mut R) -> Result<(BlockHeader, Vec<u8>)> {
    let header = BlockHeader::read_from(reader)?;
    let mut payload = vec![0u8; header.compressed_size as usize];
    reader.read_exact(&mut payload)?;

    let payload = match header.compression {
        CompressionType::None => payload,
        CompressionType::Lz4 => {
            lz4_flex::decompress(&payload, header.uncompressed_size as usize)
                .map_err(|e| errcrc!("block payload does not decompress: {e}"))?
        }
    };

    if payload.len() as u64 != header.uncompressed_size {
        return Err(errcrc!(
            "block payload is {} bytes, header says {}",
            payload.len(),
            header.uncompressed_size
        ));
    }
    let actual = CRC32.checksum(&payload);
    if actual != header.crc32 {
        return Err(errcrc!(
            "block payload crc {actual:#010x} does not match header {:#010x}",
            header.crc32
        ));
    }
    Ok((header, payload))
}

/// Streaming decoder over one block's uncompressed payload.
///
/// Delta decoding is stateful across the block, so a decode failure
/// poisons the rest of the iterator; it yields the error once and stops.
pub struct RecordIter {
    payload: Cursor<Vec<u8>>,
    remaining: u64,
    last_records: Vec<Record>,
    failed: bool,
}

impl RecordIter {
    /// Builds a decoder for a verified payload. `field_types` holds the
    /// field layout of every record type in the series.
    pub fn new(payload: Vec<u8>, record_count: u64, field_types: &[Vec<FieldType>]) -> RecordIter {
        let last_records = field_types
            .iter()
            .enumerate()
            .map(|(index, types)| Record::zero(index, types))
            .collect();
        RecordIter {
            payload: Cursor::new(payload),
            remaining: record_count,
            last_records,
            failed: false,
        }
    }

    fn decode_next(&mut self) -> Result<Record> {
        let record_type = read_uvarint(&mut self.payload)? as usize;
        let previous = self
            .last_records
            .get(record_type)
            .ok_or_else(|| errdata!("record type {record_type} out of range"))?
            .clone();

        let mut fields = Vec::with_capacity(previous.fields().len());
        for prev_field in previous.fields() {
            let marker = self.payload.read_u8()?;
            match marker {
                FIELD_UNCHANGED => fields.push(*prev_field),
                FIELD_DELTA => fields.push(Field::read_delta(prev_field, &mut self.payload)?),
                other => return Err(errdata!("invalid field marker {other:#04x}")),
            }
        }
        let record = Record::new(record_type, fields);
        self.last_records[record_type] = record.clone();
        Ok(record)
    }
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.decode_next() {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::field::Field;

    fn field_types() -> Vec<Vec<FieldType>> {
        vec![
            vec![FieldType::Timestamp, FieldType::Decimal, FieldType::Decimal],
            vec![FieldType::Timestamp, FieldType::Int],
        ]
    }

    fn quote(ts: i64, bid: f64, ask: f64) -> Record {
        Record::new(0, vec![
            Field::Timestamp(ts),
            Field::decimal(bid),
            Field::decimal(ask),
        ])
    }

    fn trade(ts: i64, volume: i64) -> Record {
        Record::new(1, vec![Field::Timestamp(ts), Field::Int(volume)])
    }

    fn encode_all(records: &[Record]) -> (Vec<u8>, TimeRange) {
        let types = field_types();
        let mut last: Vec<Record> = types
            .iter()
            .enumerate()
            .map(|(i, t)| Record::zero(i, t))
            .collect();
        let mut buf = Vec::new();
        let mut range = TimeRange::new(records[0].timestamp(), records[0].timestamp());
        for record in records {
            encode_record(record, &last[record.record_type()], &mut buf).unwrap();
            last[record.record_type()] = record.clone();
            range = range.extend(record.timestamp());
        }
        (buf, range)
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let records = vec![
            quote(1000, 1.5, 1.6),
            trade(1001, 250),
            quote(1002, 1.5, 1.7),
            trade(1003, 250),
        ];
        let (payload, range) = encode_all(&records);

        let mut file = Vec::new();
        let written = write_block(
            &mut file,
            range,
            records.len() as u64,
            &[Bytes::from(payload)],
            CompressionType::None,
        )
        .unwrap();
        assert_eq!(written as usize, file.len());

        let (header, payload) = read_block(&mut file.as_slice()).unwrap();
        assert_eq!(header.record_count, 4);
        assert_eq!(header.range, TimeRange::new(1000, 1003));

        let decoded: Vec<_> = RecordIter::new(payload, header.record_count, &field_types())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_roundtrip_lz4() {
        let records: Vec<_> = (0..500).map(|i| quote(1000 + i, 1.5, 1.6)).collect();
        let (payload, range) = encode_all(&records);
        let uncompressed_len = payload.len();

        let mut file = Vec::new();
        write_block(
            &mut file,
            range,
            records.len() as u64,
            &[Bytes::from(payload)],
            CompressionType::Lz4,
        )
        .unwrap();
        // Repetitive quotes should compress well.
        assert!(file.len() < uncompressed_len);

        let (header, payload) = read_block(&mut file.as_slice()).unwrap();
        assert_eq!(header.compression, CompressionType::Lz4);
        let decoded: Vec<_> = RecordIter::new(payload, header.record_count, &field_types())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_tampered_payload_fails_before_yielding() {
        let records = vec![quote(1000, 1.5, 1.6), quote(1001, 1.4, 1.7)];
        let (payload, range) = encode_all(&records);

        let mut file = Vec::new();
        write_block(
            &mut file,
            range,
            2,
            &[Bytes::from(payload)],
            CompressionType::None,
        )
        .unwrap();

        // Flip a byte in the payload, which sits at the end of the frame.
        let last = file.len() - 1;
        file[last] ^= 0xff;

        assert!(matches!(
            read_block(&mut file.as_slice()),
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_unchanged_fields_encode_as_single_marker() {
        let types = field_types();
        let first = quote(1000, 1.5, 1.6);
        let second = quote(1001, 1.5, 1.6);

        let mut buf = Vec::new();
        encode_record(&first, &Record::zero(0, &types[0]), &mut buf).unwrap();
        let first_len = buf.len();
        encode_record(&second, &first, &mut buf).unwrap();

        // Type byte + changed timestamp (marker + 1 byte delta) + two
        // unchanged markers.
        assert_eq!(buf.len() - first_len, 5);
    }

    #[test]
    fn test_chunked_payload_matches_contiguous() {
        let records = vec![quote(1000, 1.5, 1.6), quote(1001, 1.6, 1.7)];
        let (payload, range) = encode_all(&records);
        let (head, tail) = payload.split_at(payload.len() / 2);

        let mut contiguous = Vec::new();
        write_block(
            &mut contiguous,
            range,
            2,
            &[Bytes::from(payload.clone())],
            CompressionType::None,
        )
        .unwrap();

        let mut chunked = Vec::new();
        write_block(
            &mut chunked,
            range,
            2,
            &[Bytes::copy_from_slice(head), Bytes::copy_from_slice(tail)],
            CompressionType::None,
        )
        .unwrap();

        assert_eq!(contiguous, chunked);
    }
}
