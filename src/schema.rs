// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::MAGIC_BYTES,
    Slice, UserKey,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::Path;

/// Type of a schema field
///
/// The `Rev` variants sort descending.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldType {
    /// Variable-length bytes, lexicographic compare
    Bytes,
    /// Unsigned 32-bit, numeric compare
    U32,
    /// Unsigned 64-bit, numeric compare
    U64,
    /// Unsigned 32-bit, descending
    U32Rev,
    /// Unsigned 64-bit, descending
    U64Rev,
    /// Signed 64-bit, numeric compare
    I64,
}

impl FieldType {
    /// Encoded width of a fixed-size field, `None` for variable-length.
    #[must_use]
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bytes => None,
            Self::U32 | Self::U32Rev => Some(4),
            Self::U64 | Self::U64Rev | Self::I64 => Some(8),
        }
    }
}

impl From<FieldType> for u8 {
    fn from(value: FieldType) -> Self {
        match value {
            FieldType::Bytes => 0,
            FieldType::U32 => 1,
            FieldType::U64 => 2,
            FieldType::U32Rev => 3,
            FieldType::U64Rev => 4,
            FieldType::I64 => 5,
        }
    }
}

impl TryFrom<u8> for FieldType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bytes),
            1 => Ok(Self::U32),
            2 => Ok(Self::U64),
            3 => Ok(Self::U32Rev),
            4 => Ok(Self::U64Rev),
            5 => Ok(Self::I64),
            _ => Err(()),
        }
    }
}

/// A single declared field
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    /// Field name
    pub name: String,

    /// Field type, selecting the comparator
    pub field_type: FieldType,

    /// Position among the key fields, or `None` for a value-only field
    ///
    /// Key positions must form a contiguous prefix `0..K`; declaration
    /// order is independent of key order.
    pub key_position: Option<u8>,
}

/// A typed field value, used when marshalling records
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldValue {
    /// Bytes payload
    Bytes(Slice),
    /// Unsigned 32-bit
    U32(u32),
    /// Unsigned 64-bit
    U64(u64),
    /// Signed 64-bit
    I64(i64),
}

impl FieldValue {
    fn matches(&self, t: FieldType) -> bool {
        matches!(
            (self, t),
            (Self::Bytes(_), FieldType::Bytes)
                | (Self::U32(_), FieldType::U32 | FieldType::U32Rev)
                | (Self::U64(_), FieldType::U64 | FieldType::U64Rev)
                | (Self::I64(_), FieldType::I64)
        )
    }
}

/// Ordered list of fields of one database
///
/// Validated once at declare time and immutable once the database opens.
/// Key fields are encoded order-preservingly, so the engine's single byte
/// comparator realizes the composite compare: big-endian for unsigned
/// fields, bitwise complement for the descending variants, sign-bit flip
/// for `I64`, and escaped length-framing for non-terminal `Bytes` fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Schema {
    name: String,
    fields: Vec<Field>,

    /// Field indices in key-position order
    key_parts: Vec<usize>,

    /// Byte offset into the fixed region, per field (`None` = variable)
    fixed_offsets: Vec<Option<usize>>,

    /// Field indices of variable-length fields, in declaration order
    var_fields: Vec<usize>,

    fixed_size: usize,
}

/// Builder for a [`Schema`]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    /// Adds a value-only field.
    #[must_use]
    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            key_position: None,
        });
        self
    }

    /// Adds a key field at the given key position.
    #[must_use]
    pub fn key_field(mut self, name: &str, field_type: FieldType, position: u8) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            key_position: Some(position),
        });
        self
    }

    /// Validates the declaration and builds the schema.
    pub fn build(self) -> crate::Result<Schema> {
        Schema::validate(self.name, self.fields)
    }
}

impl Schema {
    /// Starts declaring a schema.
    #[must_use]
    pub fn builder(name: &str) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: vec![],
        }
    }

    /// Validates a field list: assigns fixed offsets, groups
    /// variable-width fields behind the offset table, and populates the
    /// key-parts array in key-position order.
    pub fn validate(name: String, fields: Vec<Field>) -> crate::Result<Self> {
        if fields.is_empty() {
            return Err(crate::Error::BadRequest("schema has no fields"));
        }

        let mut key_parts = fields
            .iter()
            .enumerate()
            .filter_map(|(idx, f)| f.key_position.map(|pos| (pos, idx)))
            .collect::<Vec<_>>();

        key_parts.sort();

        if key_parts.is_empty() {
            return Err(crate::Error::BadRequest("schema has no key fields"));
        }

        for (expected, (pos, _)) in key_parts.iter().enumerate() {
            if usize::from(*pos) != expected {
                return Err(crate::Error::BadRequest(
                    "key positions must form a contiguous prefix",
                ));
            }
        }

        let mut fixed_offsets = Vec::with_capacity(fields.len());
        let mut var_fields = vec![];
        let mut fixed_size = 0;

        for (idx, field) in fields.iter().enumerate() {
            match field.field_type.fixed_width() {
                Some(width) => {
                    fixed_offsets.push(Some(fixed_size));
                    fixed_size += width;
                }
                None => {
                    fixed_offsets.push(None);
                    var_fields.push(idx);
                }
            }
        }

        Ok(Self {
            name,
            fields,
            key_parts: key_parts.into_iter().map(|(_, idx)| idx).collect(),
            fixed_offsets,
            var_fields,
            fixed_size,
        })
    }

    /// Database name this schema belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of key fields.
    #[must_use]
    pub fn key_field_count(&self) -> usize {
        self.key_parts.len()
    }

    fn offset_table_pos(&self) -> usize {
        self.fixed_size
    }

    fn payload_data_pos(&self) -> usize {
        // (offset, size) per variable field
        self.fixed_size + self.var_fields.len() * 8
    }

    /// Marshals field values (in declaration order) into a record payload.
    ///
    /// Layout: fixed-width fields at their assigned offsets, then an
    /// offset table `(offset: u32, size: u32)` per variable field, then
    /// the variable payloads. Comparison never touches this payload; keys
    /// are extracted and compared in their encoded form.
    pub fn encode_record(&self, values: &[FieldValue]) -> crate::Result<Slice> {
        if values.len() != self.fields.len() {
            return Err(crate::Error::BadRequest("field count mismatch"));
        }

        for (value, field) in values.iter().zip(&self.fields) {
            if !value.matches(field.field_type) {
                return Err(crate::Error::BadRequest("field type mismatch"));
            }
        }

        let var_len = values
            .iter()
            .filter_map(|v| match v {
                FieldValue::Bytes(b) => Some(b.len()),
                _ => None,
            })
            .sum::<usize>();

        let mut out = Vec::with_capacity(self.payload_data_pos() + var_len);
        out.resize(self.payload_data_pos(), 0);

        let mut table_pos = self.offset_table_pos();

        for (idx, value) in values.iter().enumerate() {
            match value {
                FieldValue::Bytes(bytes) => {
                    let offset = out.len();

                    #[allow(clippy::cast_possible_truncation)]
                    {
                        out[table_pos..table_pos + 4]
                            .copy_from_slice(&(offset as u32).to_be_bytes());
                        out[table_pos + 4..table_pos + 8]
                            .copy_from_slice(&(bytes.len() as u32).to_be_bytes());
                    }
                    table_pos += 8;

                    out.extend_from_slice(bytes);
                }
                fixed => {
                    #[allow(clippy::expect_used)]
                    let offset = self.fixed_offsets[idx].expect("fixed field has an offset");

                    match (fixed, self.fields[idx].field_type) {
                        (FieldValue::U32(v), FieldType::U32) => {
                            out[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
                        }
                        (FieldValue::U32(v), FieldType::U32Rev) => {
                            out[offset..offset + 4].copy_from_slice(&(!v).to_be_bytes());
                        }
                        (FieldValue::U64(v), FieldType::U64) => {
                            out[offset..offset + 8].copy_from_slice(&v.to_be_bytes());
                        }
                        (FieldValue::U64(v), FieldType::U64Rev) => {
                            out[offset..offset + 8].copy_from_slice(&(!v).to_be_bytes());
                        }
                        (FieldValue::I64(v), FieldType::I64) => {
                            #[allow(clippy::cast_sign_loss)]
                            out[offset..offset + 8]
                                .copy_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
                        }
                        _ => unreachable!("validated above"),
                    }
                }
            }
        }

        Ok(out.into())
    }

    /// Reads one field back out of a record payload.
    pub fn decode_field(&self, payload: &[u8], idx: usize) -> crate::Result<FieldValue> {
        let field = self
            .fields
            .get(idx)
            .ok_or(crate::Error::BadRequest("no such field"))?;

        let get = |range: std::ops::Range<usize>| {
            payload
                .get(range)
                .ok_or(crate::Error::BadRequest("payload too short for schema"))
        };

        match field.field_type {
            FieldType::Bytes => {
                #[allow(clippy::expect_used)]
                let table_idx = self
                    .var_fields
                    .iter()
                    .position(|f| *f == idx)
                    .expect("bytes field is registered as variable");

                let entry = self.offset_table_pos() + table_idx * 8;

                let offset = u32::from_be_bytes(get(entry..entry + 4)?.try_into().unwrap_or([0; 4]))
                    as usize;
                let size = u32::from_be_bytes(
                    get(entry + 4..entry + 8)?.try_into().unwrap_or([0; 4]),
                ) as usize;

                Ok(FieldValue::Bytes(Slice::new(get(offset..offset + size)?)))
            }
            FieldType::U32 | FieldType::U32Rev => {
                #[allow(clippy::expect_used)]
                let offset = self.fixed_offsets[idx].expect("fixed field has an offset");
                let raw =
                    u32::from_be_bytes(get(offset..offset + 4)?.try_into().unwrap_or([0; 4]));

                Ok(FieldValue::U32(if field.field_type == FieldType::U32 {
                    raw
                } else {
                    !raw
                }))
            }
            FieldType::U64 | FieldType::U64Rev => {
                #[allow(clippy::expect_used)]
                let offset = self.fixed_offsets[idx].expect("fixed field has an offset");
                let raw =
                    u64::from_be_bytes(get(offset..offset + 8)?.try_into().unwrap_or([0; 8]));

                Ok(FieldValue::U64(if field.field_type == FieldType::U64 {
                    raw
                } else {
                    !raw
                }))
            }
            FieldType::I64 => {
                #[allow(clippy::expect_used)]
                let offset = self.fixed_offsets[idx].expect("fixed field has an offset");
                let raw =
                    u64::from_be_bytes(get(offset..offset + 8)?.try_into().unwrap_or([0; 8]));

                #[allow(clippy::cast_possible_wrap)]
                Ok(FieldValue::I64((raw ^ (1 << 63)) as i64))
            }
        }
    }

    /// Reads a field back by name.
    pub fn decode_field_by_name(&self, payload: &[u8], name: &str) -> crate::Result<FieldValue> {
        let idx = self
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or(crate::Error::BadRequest("no such field"))?;

        self.decode_field(payload, idx)
    }

    fn encode_key_part(&self, out: &mut Vec<u8>, part: usize, value: &FieldValue, last: bool) {
        match value {
            FieldValue::Bytes(bytes) => {
                if last {
                    out.extend_from_slice(bytes);
                } else {
                    // Escaped framing keeps the byte comparator
                    // order-preserving for non-terminal bytes fields:
                    // 0x00 -> 0x00 0xFF, terminated by 0x00 0x00
                    for b in bytes.iter() {
                        out.push(*b);
                        if *b == 0 {
                            out.push(0xFF);
                        }
                    }
                    out.push(0);
                    out.push(0);
                }
            }
            FieldValue::U32(v) => {
                let raw = if self.fields[part].field_type == FieldType::U32Rev {
                    !*v
                } else {
                    *v
                };
                out.extend_from_slice(&raw.to_be_bytes());
            }
            FieldValue::U64(v) => {
                let raw = if self.fields[part].field_type == FieldType::U64Rev {
                    !*v
                } else {
                    *v
                };
                out.extend_from_slice(&raw.to_be_bytes());
            }
            FieldValue::I64(v) => {
                #[allow(clippy::cast_sign_loss)]
                out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
            }
        }
    }

    /// Builds the composite key from key field values (in key-position
    /// order).
    pub fn encode_key(&self, values: &[FieldValue]) -> crate::Result<UserKey> {
        if values.len() != self.key_parts.len() {
            return Err(crate::Error::BadRequest("key field count mismatch"));
        }

        let mut out = vec![];

        for (pos, (field_idx, value)) in self.key_parts.iter().zip(values).enumerate() {
            if !value.matches(self.fields[*field_idx].field_type) {
                return Err(crate::Error::BadRequest("key field type mismatch"));
            }

            let last = pos + 1 == self.key_parts.len();
            self.encode_key_part(&mut out, *field_idx, value, last);
        }

        Ok(out.into())
    }

    /// Extracts the composite key from a record payload.
    pub fn extract_key(&self, payload: &[u8]) -> crate::Result<UserKey> {
        let mut out = vec![];

        for (pos, field_idx) in self.key_parts.iter().enumerate() {
            let value = self.decode_field(payload, *field_idx)?;
            let last = pos + 1 == self.key_parts.len();
            self.encode_key_part(&mut out, *field_idx, &value, last);
        }

        Ok(out.into())
    }

    /// Builds an encoded key prefix from a prefix of the *first* key
    /// field's bytes (prefix scans are defined on the leading bytes of
    /// the first key field).
    pub fn encode_prefix(&self, prefix: &[u8]) -> crate::Result<Slice> {
        #[allow(clippy::expect_used)]
        let first = *self.key_parts.first().expect("validated: at least one key");

        if self.fields[first].field_type != FieldType::Bytes {
            return Err(crate::Error::BadRequest(
                "prefix scans require a leading bytes key field",
            ));
        }

        if self.key_parts.len() == 1 {
            return Ok(Slice::new(prefix));
        }

        // Escaped form, without the terminator so the prefix stays open
        let mut out = vec![];
        for b in prefix {
            out.push(*b);
            if *b == 0 {
                out.push(0xFF);
            }
        }
        Ok(out.into())
    }

    /// Saves the schema file at `<db.path>/scheme`.
    pub fn save(&self, folder: &Path, db_id: u32) -> crate::Result<()> {
        let mut bytes = self.encode_into_vec();

        #[allow(clippy::expect_used)]
        write_tlv(&mut bytes, TLV_DBID, &db_id.to_be_bytes()).expect("vec write cannot fail");

        crate::file::rewrite_atomic(&folder.join(crate::file::SCHEME_FILE), &bytes)?;
        Ok(())
    }

    /// Loads the schema file from `<db.path>/scheme`, returning the
    /// schema and the database's stable id.
    pub fn load(folder: &Path) -> crate::Result<(Self, u32)> {
        let bytes = std::fs::read(folder.join(crate::file::SCHEME_FILE))?;

        let schema = Self::decode_from(&mut &bytes[..])?;
        let db_id = decode_db_id(&bytes)?;

        Ok((schema, db_id))
    }
}

// Schema file entry ids (TLV-style: id, size, bytes)
const TLV_VERSION: u8 = 0;
const TLV_NAME: u8 = 1;
const TLV_FIELD: u8 = 2;
const TLV_DBID: u8 = 3;

fn decode_db_id(bytes: &[u8]) -> crate::Result<u32> {
    let mut reader = bytes
        .get(MAGIC_BYTES.len()..)
        .ok_or(crate::Error::Decode(DecodeError::InvalidHeader("Schema")))?;

    loop {
        let id = match reader.read_u8() {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(crate::Error::Decode(DecodeError::InvalidHeader("Schema")));
            }
            Err(e) => return Err(e.into()),
        };

        let size = reader.read_u32::<BigEndian>()? as usize;
        let mut entry = vec![0; size];
        reader.read_exact(&mut entry)?;

        if id == TLV_DBID && entry.len() == 4 {
            #[allow(clippy::expect_used)]
            return Ok(u32::from_be_bytes(entry.try_into().expect("sized")));
        }
    }
}

fn write_tlv<W: Write>(writer: &mut W, id: u8, bytes: &[u8]) -> Result<(), EncodeError> {
    writer.write_u8(id)?;

    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32::<BigEndian>(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

impl Encode for Schema {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;

        write_tlv(writer, TLV_VERSION, &[u8::from(crate::FormatVersion::V1)])?;
        write_tlv(writer, TLV_NAME, self.name.as_bytes())?;

        for field in &self.fields {
            let mut entry = vec![];
            entry.push(u8::from(field.field_type));
            entry.push(field.key_position.map_or(u8::MAX, |pos| pos));
            entry.extend_from_slice(field.name.as_bytes());

            write_tlv(writer, TLV_FIELD, &entry)?;
        }

        Ok(())
    }
}

impl Decode for Schema {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Schema"));
        }

        let mut name = String::new();
        let mut fields = vec![];

        loop {
            let id = match reader.read_u8() {
                Ok(id) => id,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            let size = reader.read_u32::<BigEndian>()? as usize;
            let mut bytes = vec![0; size];
            reader.read_exact(&mut bytes)?;

            match id {
                TLV_VERSION => {
                    let version = *bytes.first().unwrap_or(&0);
                    crate::FormatVersion::try_from(version)
                        .map_err(|()| DecodeError::InvalidTag(("FormatVersion", version)))?;
                }
                TLV_NAME => {
                    name = std::str::from_utf8(&bytes)?.to_owned();
                }
                TLV_FIELD => {
                    if bytes.len() < 2 {
                        return Err(DecodeError::InvalidHeader("SchemaField"));
                    }

                    let field_type = FieldType::try_from(bytes[0])
                        .map_err(|()| DecodeError::InvalidTag(("FieldType", bytes[0])))?;
                    let key_position = if bytes[1] == u8::MAX {
                        None
                    } else {
                        Some(bytes[1])
                    };
                    let field_name = std::str::from_utf8(&bytes[2..])?.to_owned();

                    fields.push(Field {
                        name: field_name,
                        field_type,
                        key_position,
                    });
                }
                // Unknown entries are skippable by construction
                _ => {}
            }
        }

        Schema::validate(name, fields).map_err(|_| DecodeError::InvalidHeader("Schema"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn two_field_schema() -> Schema {
        Schema::builder("test")
            .key_field("id", FieldType::Bytes, 0)
            .field("v", FieldType::Bytes)
            .build()
            .unwrap()
    }

    #[test]
    fn schema_record_roundtrip() {
        let schema = Schema::builder("t")
            .field("count", FieldType::U64)
            .key_field("id", FieldType::Bytes, 0)
            .key_field("seq", FieldType::U32, 1)
            .build()
            .unwrap();

        let payload = schema
            .encode_record(&[
                FieldValue::U64(42),
                FieldValue::Bytes(Slice::from("alpha")),
                FieldValue::U32(7),
            ])
            .unwrap();

        assert_eq!(
            FieldValue::U64(42),
            schema.decode_field(&payload, 0).unwrap()
        );
        assert_eq!(
            FieldValue::Bytes(Slice::from("alpha")),
            schema.decode_field_by_name(&payload, "id").unwrap()
        );
        assert_eq!(FieldValue::U32(7), schema.decode_field(&payload, 2).unwrap());
    }

    #[test]
    fn schema_key_order_is_composite_order() {
        // declaration order differs from key order on purpose
        let schema = Schema::builder("t")
            .key_field("b", FieldType::U32, 1)
            .key_field("a", FieldType::Bytes, 0)
            .build()
            .unwrap();

        let k = |a: &str, b: u32| {
            schema
                .encode_key(&[FieldValue::Bytes(Slice::from(a)), FieldValue::U32(b)])
                .unwrap()
        };

        assert!(k("a", 2) < k("b", 1));
        assert!(k("a", 1) < k("a", 2));
        assert!(k("ab", 0) > k("a", u32::MAX));
    }

    #[test]
    fn schema_reverse_field_sorts_descending() {
        let schema = Schema::builder("t")
            .key_field("n", FieldType::U64Rev, 0)
            .build()
            .unwrap();

        let k = |n: u64| schema.encode_key(&[FieldValue::U64(n)]).unwrap();

        assert!(k(10) < k(2));
        assert!(k(2) < k(1));
    }

    #[test]
    fn schema_i64_sign_order() {
        let schema = Schema::builder("t")
            .key_field("n", FieldType::I64, 0)
            .build()
            .unwrap();

        let k = |n: i64| schema.encode_key(&[FieldValue::I64(n)]).unwrap();

        assert!(k(-5) < k(-1));
        assert!(k(-1) < k(0));
        assert!(k(0) < k(7));
    }

    #[test]
    fn schema_extract_key_matches_encode_key() {
        let schema = two_field_schema();

        let payload = schema
            .encode_record(&[
                FieldValue::Bytes(Slice::from("k1")),
                FieldValue::Bytes(Slice::from("v1")),
            ])
            .unwrap();

        assert_eq!(
            schema.encode_key(&[FieldValue::Bytes(Slice::from("k1"))]).unwrap(),
            schema.extract_key(&payload).unwrap(),
        );
    }

    #[test]
    fn schema_rejects_gap_in_key_positions() {
        let result = Schema::builder("t")
            .key_field("a", FieldType::Bytes, 0)
            .key_field("b", FieldType::U32, 2)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn schema_file_roundtrip() {
        let schema = Schema::builder("db1")
            .key_field("id", FieldType::Bytes, 0)
            .field("v", FieldType::U64)
            .build()
            .unwrap();

        let bytes = schema.encode_into_vec();
        let decoded = Schema::decode_from(&mut &bytes[..]).unwrap();

        assert_eq!(schema, decoded);
    }

    #[test]
    fn schema_escaped_middle_bytes_field() {
        let schema = Schema::builder("t")
            .key_field("a", FieldType::Bytes, 0)
            .key_field("b", FieldType::Bytes, 1)
            .build()
            .unwrap();

        let k = |a: &[u8], b: &[u8]| {
            schema
                .encode_key(&[
                    FieldValue::Bytes(Slice::new(a)),
                    FieldValue::Bytes(Slice::new(b)),
                ])
                .unwrap()
        };

        // "a" < "a\0" < "ab" must hold for the leading field even with
        // embedded zero bytes
        assert!(k(b"a", b"z") < k(b"a\0", b"a"));
        assert!(k(b"a\0", b"z") < k(b"ab", b"a"));
    }
}
