//! Schema-driven zero-copy record layout and codec.
//!
//! A schema — an ordered list of `(name, type, length)` field descriptors —
//! compiles into an interned [`Shape`] with a deterministic byte layout:
//! wider fixed-width fields first, variable-width payloads at the tail,
//! every offset aligned to its element width. A [`Record`] is that shape
//! over a contiguous byte buffer; field accessors read and write the bytes
//! in place.
//!
//! ```
//! use record_codec::{registry, FieldSpec, Primitive, Record, Value};
//!
//! let shape = registry::intern(
//!     Some("account"),
//!     vec![
//!         FieldSpec::new("id", Primitive::BigUint64),
//!         FieldSpec::new("balance", Primitive::Int32),
//!         FieldSpec::new("label", Primitive::Utf8),
//!     ],
//! )?;
//!
//! let mut account = Record::new(shape);
//! account.set("id", &Value::from(7u64))?;
//! account.set("label", &Value::from("savings"))?;
//! assert_eq!(account.get("label")?, Value::from("savings"));
//! # Ok::<(), record_codec::CodecError>(())
//! ```
//!
//! Equal schemas intern to the same `Arc<Shape>` process-wide, and each
//! shape carries a 64-bit identifier (first 8 bytes of SHA-256 over its
//! canonical JSON) that names it across processes and on disk.

pub mod error;
pub mod primitive;
pub mod record;
pub mod registry;
pub mod schema;

pub use error::{CodecError, CodecResult};
pub use primitive::{Primitive, Value};
pub use record::{ArrayRef, Record, RecordMut, RecordRef};
pub use schema::{FieldDef, FieldId, FieldSpec, Shape};
