//! HPACK header compression (RFC 7541).
//!
//! [`Encoder`] and [`Decoder`] each own a dynamic table; the two directions
//! of a connection are fully independent. String literals are
//! Huffman-coded whenever that is shorter than the raw octets.

mod huffman;
mod table;

use crate::error::Error;

use table::{DynamicTable, Lookup};

/// One header field as it crosses the compression boundary. Names are kept
/// as raw octets; HTTP/2 requires them lowercase before they get here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Field {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

// Representation patterns, RFC 7541 Section 6.
const INDEXED: u8 = 0x80; // 1xxxxxxx, 7-bit prefix
const WITH_INDEXING: u8 = 0x40; // 01xxxxxx, 6-bit prefix
const TABLE_RESIZE: u8 = 0x20; // 001xxxxx, 5-bit prefix
const NEVER_INDEXED: u8 = 0x10; // 0001xxxx, 4-bit prefix

/// HPACK encoder for one direction of a connection.
pub struct Encoder {
    dynamic: DynamicTable,
    /// Pending table-size update to emit at the head of the next block.
    resize_to: Option<usize>,
}

impl Encoder {
    pub fn new(table_capacity: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(table_capacity),
            resize_to: None,
        }
    }

    /// Schedule a dynamic-table resize (from a SETTINGS change). Emitted as
    /// a size-update instruction at the start of the next header block.
    pub fn resize(&mut self, capacity: usize) {
        self.dynamic.resize(capacity);
        self.resize_to = Some(capacity);
    }

    /// Encode a full header block.
    pub fn encode(&mut self, fields: &[Field], out: &mut Vec<u8>) {
        if let Some(capacity) = self.resize_to.take() {
            put_int(out, capacity as u64, 5, TABLE_RESIZE);
        }
        for field in fields {
            self.encode_field(field, out);
        }
    }

    fn encode_field(&mut self, field: &Field, out: &mut Vec<u8>) {
        match table::lookup(&self.dynamic, field) {
            Lookup::Full(index) => put_int(out, index as u64, 7, INDEXED),
            Lookup::Name(index) => {
                put_int(out, index as u64, 6, WITH_INDEXING);
                put_str(out, &field.value);
                self.dynamic.insert(field.clone());
            }
            Lookup::Miss => {
                out.push(WITH_INDEXING);
                put_str(out, &field.name);
                put_str(out, &field.value);
                self.dynamic.insert(field.clone());
            }
        }
    }
}

/// HPACK decoder for one direction of a connection.
pub struct Decoder {
    dynamic: DynamicTable,
    /// Ceiling for table-resize instructions, set by our SETTINGS.
    max_capacity: usize,
}

impl Decoder {
    pub fn new(table_capacity: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(table_capacity),
            max_capacity: table_capacity,
        }
    }

    /// Raise or lower the resize ceiling after a SETTINGS round-trip.
    pub fn set_max_capacity(&mut self, capacity: usize) {
        self.max_capacity = capacity;
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, mut buf: &[u8]) -> Result<Vec<Field>, Error> {
        let mut fields = Vec::new();
        while let Some(&first) = buf.first() {
            if first & INDEXED != 0 {
                let (index, n) = get_int(buf, 7)?;
                buf = &buf[n..];
                let field =
                    table::field_at(&self.dynamic, index as usize).ok_or(Error::Compression)?;
                fields.push(field);
            } else if first & WITH_INDEXING != 0 {
                let (field, n) = self.read_literal(buf, 6)?;
                buf = &buf[n..];
                self.dynamic.insert(field.clone());
                fields.push(field);
            } else if first & TABLE_RESIZE != 0 {
                let (capacity, n) = get_int(buf, 5)?;
                buf = &buf[n..];
                if capacity as usize > self.max_capacity {
                    return Err(Error::Compression);
                }
                self.dynamic.resize(capacity as usize);
            } else {
                // Without-indexing (0000) and never-indexed (0001) decode the
                // same way; neither touches the dynamic table.
                let _never = first & NEVER_INDEXED != 0;
                let (field, n) = self.read_literal(buf, 4)?;
                buf = &buf[n..];
                fields.push(field);
            }
        }
        Ok(fields)
    }

    /// Read a literal representation: name (indexed or literal) then value.
    fn read_literal(&self, buf: &[u8], prefix: u8) -> Result<(Field, usize), Error> {
        let (name_index, mut used) = get_int(buf, prefix)?;
        let name = if name_index == 0 {
            let (name, n) = get_str(&buf[used..])?;
            used += n;
            name
        } else {
            table::field_at(&self.dynamic, name_index as usize)
                .ok_or(Error::Compression)?
                .name
        };
        let (value, n) = get_str(&buf[used..])?;
        used += n;
        Ok((Field { name, value }, used))
    }
}

/// Prefix-integer encode (RFC 7541 Section 5.1). `pattern` carries the
/// representation bits above the prefix.
fn put_int(out: &mut Vec<u8>, value: u64, prefix: u8, pattern: u8) {
    let cap = (1u64 << prefix) - 1;
    if value < cap {
        out.push(pattern | value as u8);
        return;
    }
    out.push(pattern | cap as u8);
    let mut rest = value - cap;
    while rest >= 0x80 {
        out.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    out.push(rest as u8);
}

/// Prefix-integer decode. Returns (value, octets consumed).
fn get_int(buf: &[u8], prefix: u8) -> Result<(u64, usize), Error> {
    let first = *buf.first().ok_or(Error::Compression)?;
    let cap = (1u64 << prefix) - 1;
    let mut value = u64::from(first) & cap;
    if value < cap {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        value = value
            .checked_add(u64::from(b & 0x7f) << shift)
            .ok_or(Error::Compression)?;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
        if shift > 56 {
            return Err(Error::Compression);
        }
    }
    Err(Error::Compression)
}

/// String literal encode: Huffman when it wins, raw otherwise.
fn put_str(out: &mut Vec<u8>, data: &[u8]) {
    let coded = huffman::encoded_len(data);
    if coded < data.len() {
        put_int(out, coded as u64, 7, 0x80);
        huffman::encode(data, out);
    } else {
        put_int(out, data.len() as u64, 7, 0x00);
        out.extend_from_slice(data);
    }
}

/// String literal decode. Returns (octets, consumed).
fn get_str(buf: &[u8]) -> Result<(Vec<u8>, usize), Error> {
    let coded = *buf.first().ok_or(Error::Compression)? & 0x80 != 0;
    let (len, n) = get_int(buf, 7)?;
    let len = len as usize;
    let end = n.checked_add(len).ok_or(Error::Compression)?;
    if buf.len() < end {
        return Err(Error::Compression);
    }
    let raw = &buf[n..end];
    let data = if coded {
        huffman::decode(raw)?
    } else {
        raw.to_vec()
    };
    Ok((data, end))
}
