//! Deterministic, type-tagged binary encoding of JSON values.
//!
//! Digest inputs must be byte-identical across runs, processes and languages,
//! so this encoder does not go through a JSON text serialiser. Objects are
//! emitted in byte-wise key order; every length is a big-endian `u64`.
//!
//! ```text
//! canonical(label, value) = "sealer-c14n-v1" ‖ str(label) ‖ enc(value)
//! enc(null)   = 0x00            enc(false) = 0x01       enc(true) = 0x02
//! enc(int)    = 0x03 ‖ str(decimal)
//! enc(float)  = 0x04 ‖ str(decimal)
//! enc(string) = 0x05 ‖ str(s)
//! enc(array)  = 0x06 ‖ u64(len) ‖ enc(item)*
//! enc(object) = 0x07 ‖ u64(len) ‖ (str(key) ‖ enc(value))*   keys sorted
//! str(s)      = u64(len(s)) ‖ utf8(s)
//! ```

use serde_json::Value;

use common::Record;

const VERSION_LABEL: &str = "sealer-c14n-v1";

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_OBJECT: u8 = 0x07;

/// Incremental canonical encoder.
#[derive(Debug)]
pub struct Canonical {
    buf: Vec<u8>,
}

impl Canonical {
    /// Start an encoding under a domain-separation `label`.
    pub fn new(label: &str) -> Self {
        let mut c = Self { buf: Vec::new() };
        c.put_str(VERSION_LABEL);
        c.put_str(label);
        c
    }

    /// Append a length-prefixed string.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_len(s.len());
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Append a big-endian `u64`.
    pub fn put_u64(&mut self, n: u64) -> &mut Self {
        self.buf.extend_from_slice(&n.to_be_bytes());
        self
    }

    /// Append a tagged JSON value.
    pub fn put_value(&mut self, value: &Value) -> &mut Self {
        match value {
            Value::Null => self.buf.push(TAG_NULL),
            Value::Bool(false) => self.buf.push(TAG_FALSE),
            Value::Bool(true) => self.buf.push(TAG_TRUE),
            Value::Number(n) => {
                let tag = if n.is_f64() { TAG_FLOAT } else { TAG_INT };
                self.buf.push(tag);
                self.put_str(&n.to_string());
            }
            Value::String(s) => {
                self.buf.push(TAG_STRING);
                self.put_str(s);
            }
            Value::Array(items) => {
                self.buf.push(TAG_ARRAY);
                self.put_len(items.len());
                for item in items {
                    self.put_value(item);
                }
            }
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
                self.buf.push(TAG_OBJECT);
                self.put_len(entries.len());
                for (k, v) in entries {
                    self.put_str(k);
                    self.put_value(v);
                }
            }
        }
        self
    }

    /// Append a record, skipping every field named in `exclude`.
    pub fn put_record(&mut self, record: &Record, exclude: &[&str]) -> &mut Self {
        let kept: Vec<(&String, &Value)> = record
            .iter()
            .filter(|(k, _)| !exclude.contains(&k.as_str()))
            .collect();
        // BTreeMap<String, _> already iterates in byte-wise key order.
        self.buf.push(TAG_OBJECT);
        self.put_len(kept.len());
        for (k, v) in kept {
            self.put_str(k);
            self.put_value(v);
        }
        self
    }

    /// Finish and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn put_len(&mut self, len: usize) {
        self.put_u64(len as u64);
    }
}

/// Canonical bytes of `record` under `label`, without the `exclude`d fields.
pub fn encode_record(label: &str, record: &Record, exclude: &[&str]) -> Vec<u8> {
    let mut c = Canonical::new(label);
    c.put_record(record, exclude);
    c.into_bytes()
}
