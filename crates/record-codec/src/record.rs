//! Records: typed views over contiguous byte buffers.
//!
//! A record is `(shape, buffer)`. Field access reads and writes the buffer
//! in place with no heap indirection; copying a record means copying its
//! bytes. Three flavors exist:
//!
//! - [`Record`] owns its buffer and supports every operation, including
//!   variable-field writes that grow or shrink it.
//! - [`RecordRef`] borrows bytes read-only (zero-copy adoption of a slice).
//! - [`RecordMut`] borrows bytes mutably for fixed-width writes; resizing
//!   needs ownership, so variable setters live on [`Record`] alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CodecError, CodecResult};
use crate::primitive::{Primitive, Value};
use crate::schema::{FieldId, Shape};

/// An owned record over a resizable buffer.
#[derive(Debug, Clone)]
pub struct Record {
    shape: Arc<Shape>,
    buf: Vec<u8>,
}

/// A read-only record view over borrowed bytes.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    shape: &'a Arc<Shape>,
    buf: &'a [u8],
}

/// A mutable record view over borrowed bytes (fixed-width writes only).
#[derive(Debug)]
pub struct RecordMut<'a> {
    shape: &'a Arc<Shape>,
    buf: &'a mut [u8],
}

/// Index view over a fixed-length array field.
///
/// Element access always goes through the per-type codec; a byte buffer
/// carries no alignment guarantee, so the record never aliases its memory as
/// a wider typed slice.
#[derive(Debug, Clone, Copy)]
pub struct ArrayRef<'a> {
    buf: &'a [u8],
    ty: Primitive,
    offset: usize,
    len: usize,
}

impl<'a> ArrayRef<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    pub fn elem_width(&self) -> usize {
        self.ty.width().unwrap_or(0)
    }

    pub fn byte_len(&self) -> usize {
        self.len * self.elem_width()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        if index >= self.len {
            return None;
        }
        Some(self.ty.read(self.buf, self.offset + index * self.elem_width()))
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len).map(|i| self.get(i).expect("index in range"))
    }
}

// Shared accessor logic over (shape, bytes).

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4-byte slot"))
}

fn write_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

/// Payload range of a variable field: `[own_slot, next_var_slot_or_end)`,
/// clamped to the buffer so torn slots never cause out-of-bounds access.
fn var_range(shape: &Shape, buf: &[u8], field_index: usize) -> (usize, usize) {
    let start = read_u32(buf, shape.fields()[field_index].offset) as usize;
    let order = shape.var_order();
    let pos = order
        .iter()
        .position(|&v| v == field_index)
        .expect("variable field is in var order");
    let end = match order.get(pos + 1) {
        Some(&next) => read_u32(buf, shape.fields()[next].offset) as usize,
        None => buf.len(),
    };
    let start = start.min(buf.len());
    (start, end.clamp(start, buf.len()))
}

fn get_value(shape: &Shape, buf: &[u8], id: FieldId) -> Value {
    let def = shape.def(id);
    if def.is_variable() {
        let (start, end) = var_range(shape, buf, id.0);
        return def.spec.ty.read(&buf[start..end], 0);
    }
    if def.spec.len > 1 {
        let width = def.spec.ty.width().expect("fixed array element");
        return Value::Array(
            (0..def.spec.len)
                .map(|i| def.spec.ty.read(buf, def.offset + i * width))
                .collect(),
        );
    }
    def.spec.ty.read(buf, def.offset)
}

fn named_mismatch(err: CodecError, field: &str) -> CodecError {
    match err {
        CodecError::TypeMismatch { expected, .. } => CodecError::TypeMismatch {
            field: field.to_string(),
            expected,
        },
        other => other,
    }
}

/// Write a fixed-width (scalar or array) field in place.
fn set_fixed(shape: &Shape, buf: &mut [u8], id: FieldId, value: &Value) -> CodecResult<()> {
    let def = shape.def(id);
    debug_assert!(!def.is_variable());
    if def.spec.len > 1 {
        let width = def.spec.ty.width().expect("fixed array element");
        let items = match value {
            Value::Array(items) => items,
            _ => {
                return Err(CodecError::TypeMismatch {
                    field: def.spec.name.clone(),
                    expected: "array",
                })
            }
        };
        // Elements beyond the field's declared length are ignored
        for (i, item) in items.iter().take(def.spec.len).enumerate() {
            def.spec
                .ty
                .write(buf, def.offset + i * width, item)
                .map_err(|e| named_mismatch(e, &def.spec.name))?;
        }
        return Ok(());
    }
    def.spec
        .ty
        .write(buf, def.offset, value)
        .map_err(|e| named_mismatch(e, &def.spec.name))
}

fn resolve(shape: &Shape, name: &str) -> CodecResult<FieldId> {
    shape
        .field(name)
        .ok_or_else(|| CodecError::UnknownField(name.to_string()))
}

fn to_map(shape: &Shape, buf: &[u8]) -> BTreeMap<String, Value> {
    shape
        .fields()
        .iter()
        .enumerate()
        .map(|(i, def)| (def.spec.name.clone(), get_value(shape, buf, FieldId(i))))
        .collect()
}

macro_rules! typed_getter {
    ($fn_name:ident, $variant:ident, $out:ty, $expected:literal) => {
        pub fn $fn_name(&self, id: FieldId) -> CodecResult<$out> {
            match get_value(&self.shape, self.buf(), id) {
                Value::$variant(v) => Ok(v),
                _ => Err(CodecError::TypeMismatch {
                    field: self.shape.def(id).spec.name.clone(),
                    expected: $expected,
                }),
            }
        }
    };
}

macro_rules! read_side {
    () => {
        /// The compiled schema behind this record.
        pub fn shape(&self) -> &Arc<Shape> {
            &self.shape
        }

        /// The live byte view. Re-read after any variable-field write; a
        /// grow or shrink reallocates.
        pub fn bytes(&self) -> &[u8] {
            self.buf()
        }

        /// Resolve a field by name and read it.
        pub fn get(&self, name: &str) -> CodecResult<Value> {
            let id = resolve(&self.shape, name)?;
            Ok(get_value(&self.shape, self.buf(), id))
        }

        /// Read a field through a pre-resolved handle.
        pub fn get_at(&self, id: FieldId) -> Value {
            get_value(&self.shape, self.buf(), id)
        }

        /// Index view over a fixed-length array field.
        pub fn array_at(&self, id: FieldId) -> CodecResult<ArrayRef<'_>> {
            let def = self.shape.def(id);
            match def.spec.ty.width() {
                Some(_) => Ok(ArrayRef {
                    buf: self.buf(),
                    ty: def.spec.ty,
                    offset: def.offset,
                    len: def.spec.len,
                }),
                None => Err(CodecError::TypeMismatch {
                    field: def.spec.name.clone(),
                    expected: "fixed-width array",
                }),
            }
        }

        /// Materialize every field into a plain map.
        pub fn to_map(&self) -> BTreeMap<String, Value> {
            to_map(&self.shape, self.buf())
        }

        typed_getter!(i64_at, I64, i64, "integer");
        typed_getter!(u64_at, U64, u64, "unsigned integer");
        typed_getter!(f64_at, F64, f64, "number");
        typed_getter!(bool_at, Bool, bool, "boolean");
        typed_getter!(str_at, Str, String, "string");
        typed_getter!(bytes_at, Bytes, Vec<u8>, "bytes");
    };
}

impl Record {
    /// Allocate a default record: fixed area zeroed, every variable field's
    /// offset slot pointing at the record's end (empty payloads).
    pub fn new(shape: Arc<Shape>) -> Record {
        let min = shape.min_bytes();
        let mut buf = vec![0u8; min];
        for &vi in shape.var_order() {
            write_u32(&mut buf, shape.fields()[vi].offset, min as u32);
        }
        Record { shape, buf }
    }

    /// Adopt an existing buffer without copying.
    pub fn from_vec(shape: Arc<Shape>, buf: Vec<u8>) -> CodecResult<Record> {
        if buf.len() < shape.min_bytes() {
            return Err(CodecError::BufferTooSmall {
                needed: shape.min_bytes(),
                got: buf.len(),
            });
        }
        Ok(Record { shape, buf })
    }

    /// Allocate a default record and assign each provided field.
    pub fn with_values<'v>(
        shape: Arc<Shape>,
        init: impl IntoIterator<Item = (&'v str, Value)>,
    ) -> CodecResult<Record> {
        let mut record = Record::new(shape);
        for (name, value) in init {
            record.set(name, &value)?;
        }
        Ok(record)
    }

    fn buf(&self) -> &[u8] {
        &self.buf
    }

    read_side!();

    /// Consume the record, keeping its buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Borrow as a read-only view.
    pub fn as_ref(&self) -> RecordRef<'_> {
        RecordRef {
            shape: &self.shape,
            buf: &self.buf,
        }
    }

    /// Resolve a field by name and write it.
    pub fn set(&mut self, name: &str, value: &Value) -> CodecResult<()> {
        let id = resolve(&self.shape, name)?;
        self.set_at(id, value)
    }

    /// Write a field through a pre-resolved handle.
    ///
    /// Writing a variable field whose encoded size changed moves the bytes
    /// of every later payload and rewrites their offset slots; the buffer
    /// may reallocate on growth. Errors leave the buffer untouched.
    pub fn set_at(&mut self, id: FieldId, value: &Value) -> CodecResult<()> {
        let def = self.shape.def(id);
        if !def.is_variable() {
            return set_fixed(&self.shape, &mut self.buf, id, value);
        }

        let new_len = def
            .spec
            .ty
            .byte_length_of(value)
            .map_err(|e| named_mismatch(e, &def.spec.name))?;
        let (start, end) = var_range(&self.shape, &self.buf, id.0);
        let delta = new_len as isize - (end - start) as isize;

        if delta != 0 {
            let old_total = self.buf.len();
            if delta > 0 {
                self.buf.resize(old_total + delta as usize, 0);
                self.buf.copy_within(end..old_total, end + delta as usize);
            } else {
                self.buf
                    .copy_within(end..old_total, (end as isize + delta) as usize);
                self.buf.truncate((old_total as isize + delta) as usize);
            }
            // Later payloads moved; shift their offset slots by the delta
            let order = self.shape.var_order();
            let pos = order
                .iter()
                .position(|&v| v == id.0)
                .expect("variable field is in var order");
            for &vi in &order[pos + 1..] {
                let slot = self.shape.fields()[vi].offset;
                let cur = read_u32(&self.buf, slot);
                write_u32(&mut self.buf, slot, (cur as isize + delta) as u32);
            }
        }

        let def = self.shape.def(id);
        def.spec
            .ty
            .write(&mut self.buf, start, value)
            .map_err(|e| named_mismatch(e, &def.spec.name))
    }

    /// Write a single element of a fixed-length array field.
    pub fn set_element(&mut self, id: FieldId, index: usize, value: &Value) -> CodecResult<()> {
        set_element(&self.shape, &mut self.buf, id, index, value)
    }
}

fn set_element(
    shape: &Shape,
    buf: &mut [u8],
    id: FieldId,
    index: usize,
    value: &Value,
) -> CodecResult<()> {
    let def = shape.def(id);
    let width = def.spec.ty.width().ok_or_else(|| CodecError::TypeMismatch {
        field: def.spec.name.clone(),
        expected: "fixed-width array",
    })?;
    if index >= def.spec.len {
        return Err(CodecError::InvalidLength {
            field: def.spec.name.clone(),
            len: index,
        });
    }
    def.spec
        .ty
        .write(buf, def.offset + index * width, value)
        .map_err(|e| named_mismatch(e, &def.spec.name))
}

impl<'a> RecordRef<'a> {
    /// Adopt a byte slice as a read-only record view.
    pub fn new(shape: &'a Arc<Shape>, buf: &'a [u8]) -> CodecResult<RecordRef<'a>> {
        if buf.len() < shape.min_bytes() {
            return Err(CodecError::BufferTooSmall {
                needed: shape.min_bytes(),
                got: buf.len(),
            });
        }
        Ok(RecordRef { shape, buf })
    }

    fn buf(&self) -> &[u8] {
        self.buf
    }

    read_side!();

    /// Copy into an owned record.
    pub fn to_record(&self) -> Record {
        Record {
            shape: self.shape.clone(),
            buf: self.buf.to_vec(),
        }
    }
}

impl<'a> RecordMut<'a> {
    /// Adopt a byte slice as a mutable record view.
    ///
    /// The view writes fixed-width fields in place; variable fields would
    /// need to resize the buffer and are rejected with `TypeMismatch`.
    pub fn new(shape: &'a Arc<Shape>, buf: &'a mut [u8]) -> CodecResult<RecordMut<'a>> {
        if buf.len() < shape.min_bytes() {
            return Err(CodecError::BufferTooSmall {
                needed: shape.min_bytes(),
                got: buf.len(),
            });
        }
        Ok(RecordMut { shape, buf })
    }

    fn buf(&self) -> &[u8] {
        self.buf
    }

    read_side!();

    pub fn set(&mut self, name: &str, value: &Value) -> CodecResult<()> {
        let id = resolve(self.shape, name)?;
        self.set_at(id, value)
    }

    pub fn set_at(&mut self, id: FieldId, value: &Value) -> CodecResult<()> {
        let def = self.shape.def(id);
        if def.is_variable() {
            return Err(CodecError::TypeMismatch {
                field: def.spec.name.clone(),
                expected: "fixed-width field",
            });
        }
        set_fixed(self.shape, self.buf, id, value)
    }

    pub fn set_element(&mut self, id: FieldId, index: usize, value: &Value) -> CodecResult<()> {
        set_element(self.shape, self.buf, id, index, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::intern;
    use crate::schema::FieldSpec;

    fn point_shape() -> Arc<Shape> {
        intern(
            Some("point"),
            vec![
                FieldSpec::new("x", Primitive::Int32),
                FieldSpec::new("y", Primitive::Int32),
            ],
        )
        .unwrap()
    }

    fn named_shape() -> Arc<Shape> {
        intern(
            Some("named"),
            vec![
                FieldSpec::new("i32", Primitive::Int32),
                FieldSpec::new("name", Primitive::Utf8),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_default_buffer_has_empty_payloads() {
        let record = Record::new(named_shape());
        assert_eq!(record.bytes().len(), 8);
        assert_eq!(record.get("name").unwrap(), Value::Str(String::new()));
        assert_eq!(record.get("i32").unwrap(), Value::I64(0));
    }

    #[test]
    fn test_variable_field_grow_and_shrink() {
        let shape = named_shape();
        let mut record = Record::with_values(
            shape.clone(),
            [("i32", Value::from(-7)), ("name", Value::from("hi"))],
        )
        .unwrap();

        // 4 (i32) + 4 (offset slot) + 2 (payload)
        assert_eq!(record.bytes().len(), 10);
        assert_eq!(record.get("i32").unwrap(), Value::I64(-7));
        assert_eq!(record.get("name").unwrap(), Value::Str("hi".into()));

        record.set("name", &Value::from("")).unwrap();
        assert_eq!(record.get("name").unwrap(), Value::Str(String::new()));
        assert_eq!(record.bytes().len(), 8);

        record.set("name", &Value::from("longer text")).unwrap();
        assert_eq!(record.bytes().len(), 8 + 11);
        // Earlier fields are untouched by the resize
        assert_eq!(record.get("i32").unwrap(), Value::I64(-7));
    }

    #[test]
    fn test_second_variable_field_tracks_resize() {
        let shape = intern(
            Some("two_vars"),
            vec![
                FieldSpec::new("a", Primitive::Utf8),
                FieldSpec::new("b", Primitive::Bytes),
                FieldSpec::new("n", Primitive::Uint16),
            ],
        )
        .unwrap();
        let mut record = Record::new(shape);
        record.set("n", &Value::from(7u16)).unwrap();
        record.set("b", &Value::from(vec![9u8, 8, 7])).unwrap();
        record.set("a", &Value::from("abc")).unwrap();

        assert_eq!(record.get("a").unwrap(), Value::Str("abc".into()));
        assert_eq!(record.get("b").unwrap(), Value::Bytes(vec![9, 8, 7]));

        // Shrinking the first payload moves the second, values survive
        record.set("a", &Value::from("z")).unwrap();
        assert_eq!(record.get("a").unwrap(), Value::Str("z".into()));
        assert_eq!(record.get("b").unwrap(), Value::Bytes(vec![9, 8, 7]));
        assert_eq!(record.get("n").unwrap(), Value::U64(7));

        // Growing it moves the second the other way
        record.set("a", &Value::from("wide open")).unwrap();
        assert_eq!(record.get("b").unwrap(), Value::Bytes(vec![9, 8, 7]));
    }

    #[test]
    fn test_in_place_overwrite_keeps_length() {
        let mut record = Record::new(named_shape());
        record.set("name", &Value::from("abc")).unwrap();
        let len = record.bytes().len();
        record.set("name", &Value::from("xyz")).unwrap();
        assert_eq!(record.bytes().len(), len);
        assert_eq!(record.get("name").unwrap(), Value::Str("xyz".into()));
    }

    #[test]
    fn test_adopt_rejects_short_buffer() {
        let err = Record::from_vec(point_shape(), vec![0u8; 3]);
        assert!(matches!(err, Err(CodecError::BufferTooSmall { .. })));
    }

    #[test]
    fn test_adopted_buffer_is_zero_copy_view() {
        let shape = point_shape();
        let mut original = Record::new(shape.clone());
        original.set("x", &Value::from(41)).unwrap();
        original.set("y", &Value::from(-2)).unwrap();

        let reopened = Record::from_vec(shape.clone(), original.into_vec()).unwrap();
        assert_eq!(reopened.get("x").unwrap(), Value::I64(41));
        assert_eq!(reopened.get("y").unwrap(), Value::I64(-2));

        let bytes = reopened.bytes().to_vec();
        let view = RecordRef::new(&shape, &bytes).unwrap();
        assert_eq!(view.get("y").unwrap(), Value::I64(-2));
    }

    #[test]
    fn test_array_field_access() {
        let shape = intern(
            Some("samples"),
            vec![
                FieldSpec::array("values", Primitive::Uint16, 4),
                FieldSpec::new("count", Primitive::Uint8),
            ],
        )
        .unwrap();
        let mut record = Record::new(shape);
        let values = record.shape().field("values").unwrap();

        record
            .set_at(
                values,
                &Value::Array(vec![
                    Value::from(10u16),
                    Value::from(20u16),
                    Value::from(30u16),
                    Value::from(40u16),
                    // A fifth element is ignored
                    Value::from(99u16),
                ]),
            )
            .unwrap();

        let view = record.array_at(values).unwrap();
        assert_eq!(view.len(), 4);
        assert_eq!(view.elem_width(), 2);
        assert_eq!(view.byte_len(), 8);
        assert_eq!(view.get(1), Some(Value::U64(20)));
        assert_eq!(view.get(4), None);

        record.set_element(values, 2, &Value::from(31u16)).unwrap();
        assert_eq!(record.array_at(values).unwrap().get(2), Some(Value::U64(31)));
    }

    #[test]
    fn test_to_map_covers_initializer() {
        let shape = named_shape();
        let init = [("i32", Value::I64(12)), ("name", Value::Str("map".into()))];
        let record = Record::with_values(shape, init.clone()).unwrap();
        let map = record.to_map();
        for (key, value) in init {
            assert_eq!(map.get(key), Some(&value));
        }
    }

    #[test]
    fn test_unknown_field_and_type_mismatch() {
        let mut record = Record::new(named_shape());
        assert!(matches!(
            record.get("missing"),
            Err(CodecError::UnknownField(_))
        ));
        assert!(matches!(
            record.set("name", &Value::U64(1)),
            Err(CodecError::TypeMismatch { .. })
        ));
        // A failed set leaves the buffer untouched
        assert_eq!(record.bytes().len(), 8);
    }

    #[test]
    fn test_record_mut_rejects_variable_writes() {
        let shape = named_shape();
        let mut bytes = Record::new(shape.clone()).into_vec();
        let mut view = RecordMut::new(&shape, &mut bytes).unwrap();
        view.set("i32", &Value::from(5)).unwrap();
        assert!(view.set("name", &Value::from("no")).is_err());
        assert_eq!(view.get("i32").unwrap(), Value::I64(5));
    }
}
