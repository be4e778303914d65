use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    accessor::{AccessorDriver, BulkDataAccessor},
    batch::BatchConfig,
    error::{Error, Result},
    ident::{RecordId, TypeRegistry},
    pool::RecordPool,
    record::{Record, RecordType},
    store::Store,
};

/// One record type together with its two access paths: the batching
/// [`BulkDataAccessor`] and the [`RecordPool`] in front of it.
#[derive(Debug, Clone)]
pub struct Model {
    kind: RecordType,
    pool: RecordPool,
    registry: Option<Arc<TypeRegistry>>,
}

impl Model {
    /// Build the accessor and pool for `kind`. The returned driver must be
    /// polled for any read or write to complete.
    pub fn new(
        kind: RecordType,
        store: Arc<dyn Store>,
        config: BatchConfig,
    ) -> Result<(Self, AccessorDriver)> {
        let (accessor, driver) = BulkDataAccessor::new(kind.clone(), store, config)?;
        let pool = RecordPool::new(accessor);
        let model = Self {
            kind,
            pool,
            registry: None,
        };
        Ok((model, driver))
    }

    /// Resolve reference fields through `registry` in
    /// [`create_with`](Model::create_with).
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn kind(&self) -> &RecordType {
        &self.kind
    }

    /// A new, unsaved record with a fresh id and its field defaults.
    pub fn create(&self) -> Record {
        self.kind.create()
    }

    /// A new, unsaved record carrying `fields`, with defaults filling the
    /// rest. Reference fields must hold ids of their target type, and are
    /// stored canonicalized.
    pub fn create_with(&self, fields: Map<String, Value>) -> Result<Record> {
        let mut record = Record::from_parts(RecordId::generate(&self.kind), fields);
        self.kind.apply_defaults(&mut record);

        match &self.registry {
            Some(registry) => registry.resolve_references(&mut record)?,
            None => {
                let unresolved = self.kind.fields().iter().find(|field| {
                    field.reference.is_some()
                        && !matches!(record.get(&field.name), None | Some(Value::Null))
                });
                if let Some(field) = unresolved {
                    return Err(Error::Config(format!(
                        "field {:?} of {:?} is a reference, but the model has no type registry",
                        field.name,
                        self.kind.key()
                    )));
                }
            }
        }

        Ok(record)
    }

    /// Parse an id of this type, from a bare raw value or a prefixed one.
    pub fn id(&self, raw: &str) -> Result<RecordId> {
        self.kind.id(raw)
    }

    /// Uncached access.
    pub fn data(&self) -> &BulkDataAccessor {
        self.pool.accessor()
    }

    pub fn pool(&self) -> &RecordPool {
        &self.pool
    }
}
