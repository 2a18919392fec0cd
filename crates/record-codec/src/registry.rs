//! Process-wide shape interning.
//!
//! Equal schemas must share one runtime type: the canonical `[name, fields]`
//! JSON is the cache key, and the 64-bit schema id indexes the same entries
//! for lookups coming off the wire or off disk. Re-registering an identical
//! schema is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::error::CodecResult;
use crate::schema::{parse_canonical, FieldSpec, Shape};

#[derive(Default)]
struct Registry {
    by_json: HashMap<String, Arc<Shape>>,
    by_id: HashMap<u64, Arc<Shape>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

/// Compile and intern a schema. Equal schemas return the identical `Arc`.
pub fn intern(name: Option<&str>, fields: Vec<FieldSpec>) -> CodecResult<Arc<Shape>> {
    let shape = Shape::compile(name, fields)?;
    let mut reg = registry().lock().expect("shape registry poisoned");
    if let Some(existing) = reg.by_json.get(shape.canonical_json()) {
        return Ok(existing.clone());
    }
    let shape = Arc::new(shape);
    debug!(
        name = %shape.name(),
        schema_id = format_args!("{:016x}", shape.schema_id()),
        "interned schema"
    );
    reg.by_json
        .insert(shape.canonical_json().to_string(), shape.clone());
    reg.by_id.insert(shape.schema_id(), shape.clone());
    Ok(shape)
}

/// Intern a schema from its canonical JSON (as found in a log frame).
pub fn intern_json(json: &str) -> CodecResult<Arc<Shape>> {
    if let Some(existing) = registry()
        .lock()
        .expect("shape registry poisoned")
        .by_json
        .get(json)
    {
        return Ok(existing.clone());
    }
    let (name, specs) = parse_canonical(json)?;
    intern(Some(&name), specs)
}

/// Look up a previously interned shape by its 64-bit id.
pub fn lookup(schema_id: u64) -> Option<Arc<Shape>> {
    registry()
        .lock()
        .expect("shape registry poisoned")
        .by_id
        .get(&schema_id)
        .cloned()
}
