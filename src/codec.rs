// src/codec.rs
//
// Columnar event codec. Events travel as JSON on the edges and as a
// column-oriented batch inside the engine and on the ingestion wire. The
// wire encoding is a versioned, deterministic byte layout: schema block
// first, then row count, then one validity-prefixed column per field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CODEC_VERSION: u8 = 1;
pub const DOM_BATCH: &[u8] = b"EVB";

const TAG_STR: u8 = 0;
const TAG_F64: u8 = 1;
const TAG_MAP: u8 = 2;
const TAG_BIN: u8 = 3;

/// Ordered field list. Decoding verifies this exactly; any divergence is a
/// schema mismatch naming the first field that differs.
pub const SCHEMA: [(&str, u8); 5] = [
    ("entity_id", TAG_STR),
    ("event", TAG_STR),
    ("timestamp", TAG_F64),
    ("details", TAG_MAP),
    ("data", TAG_BIN),
];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty input")]
    EmptyInput,
    #[error("schema mismatch at field {field}")]
    SchemaMismatch { field: String },
    #[error("malformed batch: {0}")]
    Malformed(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One event row. Every field is nullable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRecord {
    pub entity_id: Option<String>,
    pub event: Option<String>,
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// Column-oriented storage for a batch of event records, one validity-aware
/// vector per schema field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventBatch {
    pub entity_id: Vec<Option<String>>,
    pub event: Vec<Option<String>>,
    pub timestamp: Vec<Option<f64>>,
    pub details: Vec<Option<BTreeMap<String, String>>>,
    pub data: Vec<Option<Vec<u8>>>,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.entity_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_id.is_empty()
    }
}

/// Pivot rows into columns.
pub fn records_to_batch(records: &[EventRecord]) -> Result<EventBatch, CodecError> {
    if records.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    let mut batch = EventBatch::default();
    for rec in records {
        batch.entity_id.push(rec.entity_id.clone());
        batch.event.push(rec.event.clone());
        batch.timestamp.push(rec.timestamp);
        batch.details.push(rec.details.clone());
        batch.data.push(rec.data.clone());
    }
    Ok(batch)
}

/// Pivot columns back into rows. Inverse of `records_to_batch` up to map
/// iteration order.
pub fn batch_to_records(batch: &EventBatch) -> Vec<EventRecord> {
    let mut out = Vec::with_capacity(batch.len());
    for i in 0..batch.len() {
        out.push(EventRecord {
            entity_id: batch.entity_id[i].clone(),
            event: batch.event[i].clone(),
            timestamp: batch.timestamp[i],
            details: batch.details[i].clone(),
            data: batch.data[i].clone(),
        });
    }
    out
}

// --- helpers: write primitives deterministically ---

fn put_u32(dst: &mut Vec<u8>, x: u32) {
    dst.extend_from_slice(&x.to_le_bytes());
}

fn put_f64(dst: &mut Vec<u8>, x: f64) {
    dst.extend_from_slice(&x.to_le_bytes());
}

// append a string as length (u32 LE) + UTF-8 bytes.
fn put_str(dst: &mut Vec<u8>, s: &str) {
    put_u32(dst, s.len() as u32);
    dst.extend_from_slice(s.as_bytes());
}

fn put_bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(dst, bytes.len() as u32);
    dst.extend_from_slice(bytes);
}

/// Encode a batch into the wire layout.
pub fn encode_batch(batch: &EventBatch) -> Result<Vec<u8>, CodecError> {
    if batch.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    let rows = batch.len() as u32;

    let mut v = vec![CODEC_VERSION];
    v.extend_from_slice(DOM_BATCH);

    // schema block
    put_u32(&mut v, SCHEMA.len() as u32);
    for (name, tag) in SCHEMA {
        put_str(&mut v, name);
        v.push(tag);
    }
    put_u32(&mut v, rows);

    // entity_id column
    for cell in &batch.entity_id {
        v.push(cell.is_some() as u8);
    }
    for cell in batch.entity_id.iter().flatten() {
        put_str(&mut v, cell);
    }

    // event column
    for cell in &batch.event {
        v.push(cell.is_some() as u8);
    }
    for cell in batch.event.iter().flatten() {
        put_str(&mut v, cell);
    }

    // timestamp column
    for cell in &batch.timestamp {
        v.push(cell.is_some() as u8);
    }
    for cell in batch.timestamp.iter().flatten() {
        put_f64(&mut v, *cell);
    }

    // details column: pair count then sorted (key, value) pairs
    for cell in &batch.details {
        v.push(cell.is_some() as u8);
    }
    for cell in batch.details.iter().flatten() {
        put_u32(&mut v, cell.len() as u32);
        for (k, val) in cell {
            put_str(&mut v, k);
            put_str(&mut v, val);
        }
    }

    // data column
    for cell in &batch.data {
        v.push(cell.is_some() as u8);
    }
    for cell in batch.data.iter().flatten() {
        put_bytes(&mut v, cell);
    }

    Ok(v)
}

// --- helpers: bounds-checked reads ---

struct Cur<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Malformed("unexpected end of input".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_f64(&mut self) -> Result<f64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    fn take_str(&mut self) -> Result<String, CodecError> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::Malformed("invalid utf-8 in string column".into()))
    }

    fn take_validity(&mut self, rows: usize) -> Result<Vec<bool>, CodecError> {
        let raw = self.take(rows)?;
        Ok(raw.iter().map(|b| *b != 0).collect())
    }
}

/// Decode a wire batch, verifying version, domain tag and schema.
pub fn decode_batch(input: &[u8]) -> Result<EventBatch, CodecError> {
    if input.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    let mut cur = Cur::new(input);

    let version = cur.take_u8()?;
    if version != CODEC_VERSION {
        return Err(CodecError::Malformed(format!("unsupported version {version}")));
    }
    let dom = cur.take(DOM_BATCH.len())?;
    if dom != DOM_BATCH {
        return Err(CodecError::Malformed("bad domain tag".into()));
    }

    let field_count = cur.take_u32()? as usize;
    if field_count != SCHEMA.len() {
        return Err(CodecError::SchemaMismatch {
            field: format!("field count {field_count}"),
        });
    }
    for (name, tag) in SCHEMA {
        let got_name = cur.take_str()?;
        let got_tag = cur.take_u8()?;
        if got_name != name || got_tag != tag {
            return Err(CodecError::SchemaMismatch { field: got_name });
        }
    }

    let rows = cur.take_u32()? as usize;
    if rows == 0 {
        return Err(CodecError::EmptyInput);
    }
    // A row count implying more bytes than the input holds is malformed.
    if rows > input.len() {
        return Err(CodecError::Malformed("row count exceeds input".into()));
    }

    let mut batch = EventBatch::default();

    let validity = cur.take_validity(rows)?;
    for valid in validity {
        batch
            .entity_id
            .push(if valid { Some(cur.take_str()?) } else { None });
    }
    // Values follow the whole validity run, so collect flags first.
    let flags = cur.take_validity(rows)?;
    for valid in flags {
        batch.event.push(if valid { Some(cur.take_str()?) } else { None });
    }
    let flags = cur.take_validity(rows)?;
    for valid in flags {
        batch
            .timestamp
            .push(if valid { Some(cur.take_f64()?) } else { None });
    }
    let flags = cur.take_validity(rows)?;
    for valid in flags {
        if valid {
            let pairs = cur.take_u32()? as usize;
            let mut map = BTreeMap::new();
            for _ in 0..pairs {
                let k = cur.take_str()?;
                let val = cur.take_str()?;
                map.insert(k, val);
            }
            batch.details.push(Some(map));
        } else {
            batch.details.push(None);
        }
    }
    let flags = cur.take_validity(rows)?;
    for valid in flags {
        if valid {
            let len = cur.take_u32()? as usize;
            batch.data.push(Some(cur.take(len)?.to_vec()));
        } else {
            batch.data.push(None);
        }
    }

    Ok(batch)
}

/// Parse a JSON array of event records into a columnar batch.
pub fn json_to_batch(json: &[u8]) -> Result<EventBatch, CodecError> {
    if json.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    let records: Vec<EventRecord> = serde_json::from_slice(json)?;
    records_to_batch(&records)
}

/// Render a columnar batch as a JSON array of event records.
pub fn batch_to_json(batch: &EventBatch) -> Result<Vec<u8>, CodecError> {
    let records = batch_to_records(batch);
    Ok(serde_json::to_vec(&records)?)
}
