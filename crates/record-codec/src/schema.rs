//! Schema compilation: field validation, deterministic layout, identity.
//!
//! A schema is an ordered list of `(name, type, length)` field descriptors.
//! Compiling one produces a [`Shape`]: the same fields rearranged into their
//! storage order with byte offsets assigned, plus the schema's canonical JSON
//! and 64-bit identifier.
//!
//! # Layout rules
//!
//! - Fixed-width fields are stably sorted so wider elements precede narrower
//!   ones; input order breaks ties. Variable-width fields always come last,
//!   in input order.
//! - Every offset is rounded up to the field's element width (4 bytes for a
//!   variable field's offset slot), so aligned loads and stores are safe.
//! - A variable field's 4-byte slot stores the buffer offset where its
//!   payload begins; the payload ends at the next variable field's offset or
//!   at the end of the buffer. No length word is stored.
//! - For fully fixed schemas the total is rounded up to the widest element
//!   width so records pack into flat arrays without misaligning.

use std::collections::HashMap;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{CodecError, CodecResult};
use crate::primitive::Primitive;

/// Accessor name reserved for the raw byte view.
const RESERVED_NAME: &str = "buffer";

/// Alignment of a variable field's offset slot.
const VAR_SLOT_WIDTH: usize = 4;

/// One field as declared by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: Primitive,
    pub len: usize,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: Primitive) -> Self {
        Self {
            name: name.into(),
            ty,
            len: 1,
        }
    }

    pub fn array(name: impl Into<String>, ty: Primitive, len: usize) -> Self {
        Self {
            name: name.into(),
            ty,
            len,
        }
    }
}

/// One field in storage order, with its byte offset assigned.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub spec: FieldSpec,
    pub offset: usize,
}

impl FieldDef {
    /// Whether this field's payload size depends on its value.
    pub fn is_variable(&self) -> bool {
        self.spec.ty.width().is_none()
    }
}

/// Opaque handle to a resolved field, cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId(pub(crate) usize);

/// A compiled schema: fields in storage order with offsets, identity, sizes.
///
/// Shapes are interned (see [`crate::registry`]); equal schemas share one
/// `Arc<Shape>` process-wide.
#[derive(Debug)]
pub struct Shape {
    name: String,
    fields: Vec<FieldDef>,
    by_name: HashMap<String, usize>,
    /// Indices of variable fields in storage (== payload) order.
    var_order: Vec<usize>,
    min_bytes: usize,
    fixed_width: Option<usize>,
    schema_id: u64,
    canonical: String,
}

impl Shape {
    /// Compile a field list into a shape. Prefer [`crate::registry::intern`],
    /// which deduplicates equal schemas.
    pub(crate) fn compile(name: Option<&str>, specs: Vec<FieldSpec>) -> CodecResult<Shape> {
        for spec in &specs {
            validate_name(&spec.name)?;
            if spec.len == 0 {
                return Err(CodecError::InvalidLength {
                    field: spec.name.clone(),
                    len: spec.len,
                });
            }
            if spec.ty.width().is_none() && spec.len != 1 {
                return Err(CodecError::VariadicUnsupported(spec.name.clone()));
            }
        }

        // Storage order: wider fixed fields first, variable fields last,
        // input order as the tiebreak (stable sort).
        let mut order: Vec<usize> = (0..specs.len()).collect();
        order.sort_by_key(|&i| match specs[i].ty.width() {
            Some(w) => usize::MAX - w,
            None => usize::MAX,
        });

        let mut fields = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        let mut var_order = Vec::new();
        let mut cursor = 0usize;
        let mut max_align = 1usize;

        for &i in &order {
            let spec = specs[i].clone();
            let slot = spec.ty.width().unwrap_or(VAR_SLOT_WIDTH);
            let offset = align_up(cursor, slot);
            cursor = offset
                + match spec.ty.width() {
                    Some(w) => w * spec.len,
                    None => VAR_SLOT_WIDTH,
                };
            if spec.ty.width().is_none() {
                var_order.push(fields.len());
            } else {
                max_align = max_align.max(slot);
            }
            if by_name.insert(spec.name.clone(), fields.len()).is_some() {
                return Err(CodecError::InvalidFieldName(spec.name.clone()));
            }
            fields.push(FieldDef { spec, offset });
        }

        let fully_fixed = var_order.is_empty();
        let min_bytes = if fully_fixed {
            align_up(cursor, max_align)
        } else {
            cursor
        };

        let canonical_fields = canonical_fields_json(&fields);
        let name = match name {
            Some(n) => n.to_string(),
            None => synthetic_name(&canonical_fields),
        };
        let canonical = serde_json::to_string(&json!([name, canonical_fields]))
            .expect("schema JSON is always serializable");
        let schema_id = id_of(&canonical);

        Ok(Shape {
            name,
            fields,
            by_name,
            var_order,
            min_bytes,
            fixed_width: fully_fixed.then_some(min_bytes),
            schema_id,
            canonical,
        })
    }

    /// Schema name (caller-supplied or synthetic).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in storage order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Resolve a field name once; accessors then take the returned id.
    pub fn field(&self, name: &str) -> Option<FieldId> {
        self.by_name.get(name).copied().map(FieldId)
    }

    pub(crate) fn def(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0]
    }

    /// Indices of variable fields in payload order.
    pub(crate) fn var_order(&self) -> &[usize] {
        &self.var_order
    }

    /// Byte size of the fixed area; the smallest legal buffer.
    pub fn min_bytes(&self) -> usize {
        self.min_bytes
    }

    /// Total record size, defined only for fully fixed schemas.
    pub fn fixed_width(&self) -> Option<usize> {
        self.fixed_width
    }

    /// 64-bit stable identifier: first 8 bytes of SHA-256 over the canonical
    /// JSON, interpreted big-endian.
    pub fn schema_id(&self) -> u64 {
        self.schema_id
    }

    /// Canonical `[name, fields]` JSON, the interning key and on-disk blob.
    pub fn canonical_json(&self) -> &str {
        &self.canonical
    }
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Field names follow identifier rules and must not shadow `buffer`.
fn validate_name(name: &str) -> CodecResult<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if !head_ok || !tail_ok || name == RESERVED_NAME {
        return Err(CodecError::InvalidFieldName(name.to_string()));
    }
    Ok(())
}

/// Fields in declared storage order as `[name, type]` or `[name, type, len]`.
fn canonical_fields_json(fields: &[FieldDef]) -> serde_json::Value {
    serde_json::Value::Array(
        fields
            .iter()
            .map(|f| {
                if f.spec.len > 1 {
                    json!([f.spec.name, f.spec.ty.name(), f.spec.len])
                } else {
                    json!([f.spec.name, f.spec.ty.name()])
                }
            })
            .collect(),
    )
}

/// Stable label for schemas declared without a name, derived from the field
/// list alone. Schemas differing only by name remain distinct.
fn synthetic_name(fields_json: &serde_json::Value) -> String {
    let fields = serde_json::to_string(fields_json).expect("schema JSON is always serializable");
    format!("anon_{:016x}", id_of(&fields))
}

fn id_of(canonical: &str) -> u64 {
    let digest = Sha256::digest(canonical.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Parse the canonical `[name, fields]` JSON back into its parts.
pub(crate) fn parse_canonical(json: &str) -> CodecResult<(String, Vec<FieldSpec>)> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| CodecError::MalformedSchema(e.to_string()))?;
    let pair = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| CodecError::MalformedSchema("expected [name, fields]".into()))?;
    let name = pair[0]
        .as_str()
        .ok_or_else(|| CodecError::MalformedSchema("schema name must be a string".into()))?;
    let raw_fields = pair[1]
        .as_array()
        .ok_or_else(|| CodecError::MalformedSchema("fields must be an array".into()))?;

    let mut specs = Vec::with_capacity(raw_fields.len());
    for raw in raw_fields {
        let parts = raw
            .as_array()
            .filter(|a| a.len() == 2 || a.len() == 3)
            .ok_or_else(|| {
                CodecError::MalformedSchema("field must be [name, type] or [name, type, len]".into())
            })?;
        let fname = parts[0]
            .as_str()
            .ok_or_else(|| CodecError::MalformedSchema("field name must be a string".into()))?;
        let tyname = parts[1]
            .as_str()
            .ok_or_else(|| CodecError::MalformedSchema("field type must be a string".into()))?;
        let ty = Primitive::parse(tyname).ok_or_else(|| CodecError::UnknownType(tyname.into()))?;
        let len = match parts.get(2) {
            Some(v) => v
                .as_u64()
                .filter(|&n| n >= 1)
                .ok_or_else(|| CodecError::MalformedSchema("field length must be >= 1".into()))?
                as usize,
            None => 1,
        };
        specs.push(FieldSpec {
            name: fname.to_string(),
            ty,
            len,
        });
    }
    Ok((name.to_string(), specs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_ordering_is_deterministic() {
        // [a: Uint8, b: Uint32] and [b: Uint32, a: Uint8] compile to the
        // same layout: b at 0, a at 4, total rounded up to 8.
        let ab = Shape::compile(
            Some("pair"),
            vec![
                FieldSpec::new("a", Primitive::Uint8),
                FieldSpec::new("b", Primitive::Uint32),
            ],
        )
        .unwrap();
        let ba = Shape::compile(
            Some("pair"),
            vec![
                FieldSpec::new("b", Primitive::Uint32),
                FieldSpec::new("a", Primitive::Uint8),
            ],
        )
        .unwrap();

        for shape in [&ab, &ba] {
            assert_eq!(shape.fixed_width(), Some(8));
            let b = shape.field("b").unwrap();
            let a = shape.field("a").unwrap();
            assert_eq!(shape.def(b).offset, 0);
            assert_eq!(shape.def(a).offset, 4);
        }
        assert_eq!(ab.schema_id(), ba.schema_id());
        assert_eq!(ab.canonical_json(), ba.canonical_json());
    }

    #[test]
    fn test_equal_width_preserves_input_order() {
        let shape = Shape::compile(
            Some("t"),
            vec![
                FieldSpec::new("x", Primitive::Uint16),
                FieldSpec::new("y", Primitive::Int16),
            ],
        )
        .unwrap();
        assert_eq!(shape.def(shape.field("x").unwrap()).offset, 0);
        assert_eq!(shape.def(shape.field("y").unwrap()).offset, 2);
    }

    #[test]
    fn test_variable_fields_sort_last() {
        let shape = Shape::compile(
            Some("t"),
            vec![
                FieldSpec::new("name", Primitive::Utf8),
                FieldSpec::new("i32", Primitive::Int32),
            ],
        )
        .unwrap();
        assert_eq!(shape.min_bytes(), 8);
        assert_eq!(shape.fixed_width(), None);
        assert_eq!(shape.def(shape.field("i32").unwrap()).offset, 0);
        assert_eq!(shape.def(shape.field("name").unwrap()).offset, 4);
    }

    #[test]
    fn test_array_field_layout() {
        let shape = Shape::compile(
            Some("t"),
            vec![
                FieldSpec::new("tag", Primitive::Uint8),
                FieldSpec::array("samples", Primitive::Uint32, 3),
            ],
        )
        .unwrap();
        // samples (width 4) sorts first: 12 bytes, then tag, padded to 16
        assert_eq!(shape.def(shape.field("samples").unwrap()).offset, 0);
        assert_eq!(shape.def(shape.field("tag").unwrap()).offset, 12);
        assert_eq!(shape.fixed_width(), Some(16));
    }

    #[test]
    fn test_empty_schema_is_degenerate() {
        let shape = Shape::compile(Some("empty"), vec![]).unwrap();
        assert_eq!(shape.min_bytes(), 0);
        assert_eq!(shape.fixed_width(), Some(0));
    }

    #[test]
    fn test_rejects_bad_names() {
        for bad in ["", "1x", "a-b", "buffer", "sp ace"] {
            let err = Shape::compile(Some("t"), vec![FieldSpec::new(bad, Primitive::Int8)]);
            assert!(
                matches!(err, Err(CodecError::InvalidFieldName(_))),
                "name {bad:?}"
            );
        }
        // $ and _ are legal identifier characters
        assert!(Shape::compile(
            Some("t"),
            vec![
                FieldSpec::new("$x", Primitive::Int8),
                FieldSpec::new("_y", Primitive::Int8)
            ]
        )
        .is_ok());
    }

    #[test]
    fn test_rejects_variable_arrays_and_zero_lengths() {
        assert!(matches!(
            Shape::compile(Some("t"), vec![FieldSpec::array("s", Primitive::Utf8, 2)]),
            Err(CodecError::VariadicUnsupported(_))
        ));
        assert!(matches!(
            Shape::compile(Some("t"), vec![FieldSpec::array("s", Primitive::Int8, 0)]),
            Err(CodecError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_name_participates_in_identity() {
        let fields = vec![FieldSpec::new("x", Primitive::Int32)];
        let a = Shape::compile(Some("a"), fields.clone()).unwrap();
        let b = Shape::compile(Some("b"), fields.clone()).unwrap();
        let anon = Shape::compile(None, fields).unwrap();
        assert_ne!(a.schema_id(), b.schema_id());
        assert_ne!(a.schema_id(), anon.schema_id());
        assert!(anon.name().starts_with("anon_"));
    }

    #[test]
    fn test_canonical_json_roundtrip() {
        let shape = Shape::compile(
            Some("sensor"),
            vec![
                FieldSpec::new("id", Primitive::BigUint64),
                FieldSpec::array("readings", Primitive::Float32, 4),
                FieldSpec::new("label", Primitive::Utf8),
            ],
        )
        .unwrap();
        let (name, specs) = parse_canonical(shape.canonical_json()).unwrap();
        let reparsed = Shape::compile(Some(&name), specs).unwrap();
        assert_eq!(reparsed.schema_id(), shape.schema_id());
        assert_eq!(reparsed.canonical_json(), shape.canonical_json());
    }

    #[test]
    fn test_parse_canonical_rejects_garbage() {
        assert!(parse_canonical("not json").is_err());
        assert!(parse_canonical("[\"a\"]").is_err());
        assert!(parse_canonical("[\"a\", [[\"x\", \"NoSuchType\"]]]").is_err());
        assert!(parse_canonical("[\"a\", [[\"x\", \"Int8\", 0]]]").is_err());
    }
}
