//! RecordBatch (magic v2) encoding and decoding.
//!
//! Layout of the 61-byte batch header:
//!
//! | offset | field                  | type |
//! |--------|------------------------|------|
//! | 0      | baseOffset             | i64  |
//! | 8      | batchLength            | i32  |
//! | 12     | partitionLeaderEpoch   | i32  |
//! | 16     | magic                  | i8   |
//! | 17     | crc                    | u32  |
//! | 21     | attributes             | i16  |
//! | 23     | lastOffsetDelta        | i32  |
//! | 27     | baseTimestamp          | i64  |
//! | 35     | maxTimestamp           | i64  |
//! | 43     | producerId             | i64  |
//! | 51     | producerEpoch          | i16  |
//! | 53     | baseSequence           | i32  |
//! | 57     | recordsCount           | i32  |
//!
//! The CRC-32C covers everything from `attributes` to the end of the batch.

use super::compression;
use crate::{Compression, Error, Header, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const BATCH_HEADER_SIZE: usize = 61;
const CRC_OFFSET: usize = 17;
const ATTRIBUTES_OFFSET: usize = 21;
const MAGIC: i8 = 2;

const COMPRESSION_MASK: i16 = 0x07;
const TRANSACTIONAL_FLAG: i16 = 0x10;
const CONTROL_FLAG: i16 = 0x20;

/// Marker carried by the single record of a control batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMarker {
    Abort,
    Commit,
}

/// Builds a single RecordBatch from appended records.
#[derive(Debug)]
pub struct RecordBatchBuilder {
    compression: Compression,
    batch_size: usize,
    records: BytesMut,
    count: i32,
    base_timestamp: Option<i64>,
    max_timestamp: i64,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    transactional: bool,
    control: bool,
    estimated_size: usize,
}

impl RecordBatchBuilder {
    /// Start a batch which accepts records until `batch_size` bytes would be exceeded.
    pub fn new(compression: Compression, batch_size: usize) -> Self {
        Self {
            compression,
            batch_size,
            records: BytesMut::new(),
            count: 0,
            base_timestamp: None,
            max_timestamp: -1,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            transactional: false,
            control: false,
            estimated_size: BATCH_HEADER_SIZE,
        }
    }

    /// Build a control batch holding a single transaction marker.
    pub fn control(marker: ControlMarker, producer_id: i64, producer_epoch: i16, timestamp: i64) -> Self {
        let mut builder = Self::new(Compression::None, usize::MAX);
        builder.control = true;
        builder.transactional = true;
        builder.set_producer_state(producer_id, producer_epoch, -1);

        let mut key = BytesMut::new();
        key.put_i16(0); // Version.
        key.put_i16(match marker {
            ControlMarker::Abort => 0,
            ControlMarker::Commit => 1,
        });
        let mut value = BytesMut::new();
        value.put_i16(0); // Version.
        value.put_i32(0); // Coordinator epoch.

        builder.append(timestamp, Some(&key), Some(&value), &[]);
        builder
    }

    /// Upper bound on the encoded size of a record with the given parts.
    pub fn estimate_record_size(key: Option<&[u8]>, value: Option<&[u8]>, headers: &[Header]) -> usize {
        // Length, attributes, timestamp delta, offset delta, key and value lengths,
        // and header count, each at its maximum varint width.
        5 + 1 + 10 + 5 + 5 + 5 + 5
            + key.map_or(0, <[u8]>::len)
            + value.map_or(0, <[u8]>::len)
            + headers
                .iter()
                .map(|h| 10 + h.key.len() + h.value.as_ref().map_or(0, |v| v.len()))
                .sum::<usize>()
    }

    /// Append a record, returning its offset delta within the batch,
    /// or None if the record does not fit. The first record always fits.
    pub fn append(
        &mut self,
        timestamp: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        headers: &[Header],
    ) -> Option<i32> {
        let estimate = Self::estimate_record_size(key, value, headers);
        if self.count != 0 && self.estimated_size + estimate > self.batch_size {
            return None;
        }

        let base_timestamp = *self.base_timestamp.get_or_insert(timestamp);
        let offset_delta = self.count;

        let mut body = BytesMut::with_capacity(estimate);
        body.put_i8(0); // Record attributes are unused.
        put_varlong(&mut body, timestamp - base_timestamp);
        put_varint(&mut body, offset_delta);
        put_nullable_bytes(&mut body, key);
        put_nullable_bytes(&mut body, value);
        put_varint(&mut body, headers.len() as i32);
        for header in headers {
            put_nullable_bytes(&mut body, Some(header.key.as_bytes()));
            put_nullable_bytes(&mut body, header.value.as_deref());
        }

        put_varint(&mut self.records, body.len() as i32);
        self.records.extend_from_slice(&body);

        self.count += 1;
        self.max_timestamp = self.max_timestamp.max(timestamp);
        self.estimated_size += estimate;

        Some(offset_delta)
    }

    pub fn set_producer_state(&mut self, producer_id: i64, producer_epoch: i16, base_sequence: i32) {
        self.producer_id = producer_id;
        self.producer_epoch = producer_epoch;
        self.base_sequence = base_sequence;
    }

    pub fn set_transactional(&mut self, transactional: bool) {
        self.transactional = transactional;
    }

    pub fn record_count(&self) -> i32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Upper bound on the size of the uncompressed batch.
    pub fn size_in_bytes(&self) -> usize {
        self.estimated_size
    }

    /// Encode the batch. An empty builder produces an empty buffer.
    pub fn build(&self) -> Result<Bytes> {
        if self.count == 0 {
            return Ok(Bytes::new());
        }

        let payload = match self.compression {
            Compression::None => self.records.to_vec(),
            codec => compression::compress(codec, &self.records)?,
        };

        let mut attributes = self.compression.attribute();
        if self.transactional {
            attributes |= TRANSACTIONAL_FLAG;
        }
        if self.control {
            attributes |= CONTROL_FLAG;
        }
        let base_timestamp = self.base_timestamp.unwrap_or(-1);

        let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE + payload.len());
        buf.put_i64(0); // Base offset, assigned by the broker.
        buf.put_i32((BATCH_HEADER_SIZE - 12 + payload.len()) as i32);
        buf.put_i32(-1); // Partition leader epoch.
        buf.put_i8(MAGIC);
        buf.put_u32(0); // CRC placeholder.
        buf.put_i16(attributes);
        buf.put_i32(self.count - 1);
        buf.put_i64(base_timestamp);
        buf.put_i64(self.max_timestamp);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_i32(self.base_sequence);
        buf.put_i32(self.count);
        buf.extend_from_slice(&payload);

        let crc = crc32c::crc32c(&buf[ATTRIBUTES_OFFSET..]);
        buf[CRC_OFFSET..ATTRIBUTES_OFFSET].copy_from_slice(&crc.to_be_bytes());

        Ok(buf.freeze())
    }
}

/// A decoded record of a RecordBatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

/// A RecordBatch whose header has been decoded and CRC verified.
/// Records are decoded (and decompressed) only when requested.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records_count: i32,
    payload: Bytes,
}

impl RecordBatch {
    /// Offset following the last record of this batch.
    /// Decoding verifies that it doesn't overflow.
    pub fn next_offset(&self) -> i64 {
        self.base_offset + self.last_offset_delta as i64 + 1
    }

    pub fn compression(&self) -> Result<Compression> {
        Compression::from_attribute(self.attributes & COMPRESSION_MASK)
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes & TRANSACTIONAL_FLAG != 0
    }

    pub fn is_control(&self) -> bool {
        self.attributes & CONTROL_FLAG != 0
    }

    /// Decode the records of this batch, decompressing its payload if required.
    pub fn records(&self) -> Result<Vec<Record>> {
        let mut buf = match self.compression()? {
            Compression::None => self.payload.clone(),
            codec => Bytes::from(compression::decompress(codec, &self.payload)?),
        };

        let mut records = Vec::with_capacity(self.records_count.max(0) as usize);
        for _ in 0..self.records_count {
            let len = get_varint(&mut buf)?;
            let mut body = take(&mut buf, len)?;
            records.push(self.decode_record(&mut body)?);

            if body.has_remaining() {
                return Err(corrupt("record has trailing bytes"));
            }
        }
        if buf.has_remaining() {
            return Err(corrupt("record batch has trailing bytes"));
        }
        Ok(records)
    }

    /// The marker of a control batch, or None if this isn't one.
    pub fn control_marker(&self) -> Result<Option<ControlMarker>> {
        if !self.is_control() {
            return Ok(None);
        }
        let records = self.records()?;
        let Some(mut key) = records.into_iter().next().and_then(|r| r.key) else {
            return Err(corrupt("control batch without a key"));
        };
        if key.remaining() < 4 {
            return Err(corrupt("short control record key"));
        }
        let _version = key.get_i16();

        match key.get_i16() {
            0 => Ok(Some(ControlMarker::Abort)),
            1 => Ok(Some(ControlMarker::Commit)),
            other => Err(corrupt(&format!("unknown control record type {other}"))),
        }
    }

    fn decode_record(&self, buf: &mut Bytes) -> Result<Record> {
        if !buf.has_remaining() {
            return Err(corrupt("empty record"));
        }
        let _attributes = buf.get_i8();
        let timestamp_delta = get_varlong(buf)?;
        let offset_delta = get_varint(buf)?;
        let key = get_nullable_bytes(buf)?;
        let value = get_nullable_bytes(buf)?;

        let header_count = get_varint(buf)?;
        if header_count < 0 {
            return Err(corrupt("negative header count"));
        }
        let mut headers = Vec::with_capacity(header_count.min(64) as usize);
        for _ in 0..header_count {
            let key = get_nullable_bytes(buf)?.ok_or_else(|| corrupt("null header key"))?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| corrupt("header key is not UTF-8"))?;
            let value = get_nullable_bytes(buf)?;
            headers.push(Header { key, value });
        }

        let offset = self
            .base_offset
            .checked_add(offset_delta as i64)
            .ok_or_else(|| corrupt("record offset overflows i64"))?;
        let timestamp = self
            .base_timestamp
            .checked_add(timestamp_delta)
            .ok_or_else(|| corrupt("record timestamp overflows i64"))?;

        Ok(Record {
            offset,
            timestamp,
            key,
            value,
            headers,
        })
    }
}

/// Decode the RecordBatches of a fetched record set.
/// A trailing partial batch, which brokers may return when a
/// response is size-limited, is ignored.
pub fn decode_batches(mut buf: Bytes) -> Result<Vec<RecordBatch>> {
    let mut batches = Vec::new();

    while buf.remaining() >= BATCH_HEADER_SIZE {
        let batch_length = i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if batch_length < (BATCH_HEADER_SIZE - 12) as i32 {
            return Err(corrupt(&format!("invalid batch length {batch_length}")));
        }
        let total = batch_length as usize + 12;
        if buf.remaining() < total {
            break;
        }
        let magic = buf[16] as i8;
        if magic != MAGIC {
            return Err(corrupt(&format!("unsupported record batch magic {magic}")));
        }

        let mut batch = buf.split_to(total);
        let expect_crc = u32::from_be_bytes([batch[17], batch[18], batch[19], batch[20]]);
        let actual_crc = crc32c::crc32c(&batch[ATTRIBUTES_OFFSET..]);
        if expect_crc != actual_crc {
            return Err(corrupt(&format!(
                "record batch CRC mismatch (expected {expect_crc:#010x}, computed {actual_crc:#010x})"
            )));
        }

        let base_offset = batch.get_i64();
        let _batch_length = batch.get_i32();
        let partition_leader_epoch = batch.get_i32();
        let _magic = batch.get_i8();
        let _crc = batch.get_u32();

        let attributes = batch.get_i16();
        let last_offset_delta = batch.get_i32();
        if base_offset.checked_add(last_offset_delta as i64 + 1).is_none() {
            return Err(corrupt(&format!(
                "last offset delta {last_offset_delta} overflows base offset {base_offset}"
            )));
        }

        batches.push(RecordBatch {
            base_offset,
            partition_leader_epoch,
            attributes,
            last_offset_delta,
            base_timestamp: batch.get_i64(),
            max_timestamp: batch.get_i64(),
            producer_id: batch.get_i64(),
            producer_epoch: batch.get_i16(),
            base_sequence: batch.get_i32(),
            records_count: batch.get_i32(),
            payload: batch,
        });
    }

    Ok(batches)
}

fn corrupt(msg: &str) -> Error {
    Error::CorruptMessage(msg.to_string())
}

fn take(buf: &mut Bytes, len: i32) -> Result<Bytes> {
    if len < 0 || len as usize > buf.remaining() {
        return Err(corrupt(&format!(
            "length {len} exceeds {} remaining bytes",
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len as usize))
}

fn put_varint(buf: &mut BytesMut, value: i32) {
    put_varlong(buf, value as i64)
}

fn put_varlong(buf: &mut BytesMut, value: i64) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    while zigzag >= 0x80 {
        buf.put_u8(zigzag as u8 | 0x80);
        zigzag >>= 7;
    }
    buf.put_u8(zigzag as u8);
}

fn put_nullable_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            put_varint(buf, value.len() as i32);
            buf.extend_from_slice(value);
        }
        None => put_varint(buf, -1),
    }
}

fn get_varlong(buf: &mut Bytes) -> Result<i64> {
    let mut zigzag = 0u64;
    for shift in (0..70).step_by(7) {
        if !buf.has_remaining() {
            return Err(corrupt("truncated varint"));
        }
        let byte = buf.get_u8();
        zigzag |= ((byte & 0x7f) as u64) << shift;

        if byte & 0x80 == 0 {
            return Ok((zigzag >> 1) as i64 ^ -((zigzag & 1) as i64));
        }
    }
    Err(corrupt("varint is too long"))
}

fn get_varint(buf: &mut Bytes) -> Result<i32> {
    i32::try_from(get_varlong(buf)?).map_err(|_| corrupt("varint overflows i32"))
}

fn get_nullable_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    match get_varint(buf)? {
        -1 => Ok(None),
        len => take(buf, len).map(Some),
    }
}
