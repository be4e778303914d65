//! Record types and the dynamic records that belong to them.
//!
//! A [`RecordType`] is declared once, up front, with an explicit list of
//! [`FieldDescriptor`]s. The accessor never inspects a record to decide what
//! may be written; it asks the type.

use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    ident::RecordId,
};

/// The name every document uses for its id. No field may claim it.
pub const ID_FIELD: &str = "_id";

/// The value a field takes when a new record doesn't set it.
#[derive(Clone)]
pub enum FieldDefault {
    Value(Value),
    /// Computed from the id of the record being created.
    Computed(Arc<dyn Fn(&RecordId) -> Value + Send + Sync>),
}

impl FieldDefault {
    pub fn value_for(&self, id: &RecordId) -> Value {
        match self {
            FieldDefault::Value(value) => value.clone(),
            FieldDefault::Computed(compute) => compute(id),
        }
    }
}

impl PartialEq for FieldDefault {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldDefault::Value(a), FieldDefault::Value(b)) => a == b,
            (FieldDefault::Computed(a), FieldDefault::Computed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for FieldDefault {}

impl Debug for FieldDefault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldDefault::Value(value) => f.debug_tuple("Value").field(value).finish(),
            FieldDefault::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Declares how a single field of a record type may be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    /// Whether the field is written by `insert`.
    pub insertable: bool,
    /// Whether the field is written by `update` and `upsert`.
    pub updatable: bool,
    /// Whether `insert` refuses a record lacking this field.
    pub required: bool,
    pub default: Option<FieldDefault>,
    /// Prefix of the record type this field points at. Values must be ids
    /// of that type, and are stored in their canonical form.
    pub reference: Option<String>,
}

impl FieldDescriptor {
    /// A plain field: insertable, updatable, optional.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insertable: true,
            updatable: true,
            required: false,
            default: None,
            reference: None,
        }
    }

    /// Mark the field as written once on insert and never updated.
    pub fn immutable(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    /// Default the field to a value derived from the new record's id.
    pub fn default_with<F>(mut self, compute: F) -> Self
    where
        F: Fn(&RecordId) -> Value + Send + Sync + 'static,
    {
        self.default = Some(FieldDefault::Computed(Arc::new(compute)));
        self
    }

    /// Make the field a reference to records of the type with `prefix`.
    pub fn reference(mut self, prefix: impl AsRef<str>) -> Self {
        self.reference = Some(prefix.as_ref().to_uppercase());
        self
    }
}

#[derive(Debug)]
struct RecordTypeDef {
    key: String,
    singular: String,
    plural: String,
    prefix: String,
    pool_size: Option<usize>,
    fields: Vec<FieldDescriptor>,
}

/// A registered kind of record, shared cheaply by every id and record of
/// that kind. Two record types are the same type if they share a prefix.
#[derive(Clone)]
pub struct RecordType {
    def: Arc<RecordTypeDef>,
}

impl RecordType {
    /// Start declaring a record type. `key` names the backing collection;
    /// `prefix` is the public id prefix and is stored uppercased.
    pub fn builder(key: impl Into<String>, prefix: impl AsRef<str>) -> RecordTypeBuilder {
        let key = key.into();
        RecordTypeBuilder {
            def: RecordTypeDef {
                singular: key.clone(),
                plural: format!("{}s", key),
                prefix: prefix.as_ref().to_uppercase(),
                key,
                pool_size: None,
                fields: Vec::new(),
            },
            reserved: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.def.key
    }

    pub fn singular(&self) -> &str {
        &self.def.singular
    }

    pub fn plural(&self) -> &str {
        &self.def.plural
    }

    pub fn prefix(&self) -> &str {
        &self.def.prefix
    }

    /// The pool capacity requested by this type, if any.
    pub fn pool_size(&self) -> Option<usize> {
        self.def.pool_size
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.def.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.def.fields.iter().find(|field| field.name == name)
    }

    /// Create a record of this type with a freshly generated id and every
    /// field default applied.
    pub fn create(&self) -> Record {
        let mut record = Record::new(RecordId::generate(self));
        self.apply_defaults(&mut record);
        record
    }

    /// Fill every undefined field that has a default. Fields the record
    /// already carries, `null` included, are left alone.
    pub fn apply_defaults(&self, record: &mut Record) {
        for field in &self.def.fields {
            if let Some(default) = &field.default {
                if record.get(&field.name).is_none() {
                    let value = default.value_for(record.id());
                    record.set(field.name.clone(), value);
                }
            }
        }
    }

    /// Build an id of this type from a raw value or a prefixed string.
    pub fn id(&self, raw: &str) -> Result<RecordId> {
        RecordId::new(self, raw)
    }
}

impl PartialEq for RecordType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.def, &other.def) || self.def.prefix == other.def.prefix
    }
}

impl Eq for RecordType {}

impl Debug for RecordType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordType")
            .field("key", &self.def.key)
            .field("prefix", &self.def.prefix)
            .field("fields", &self.def.fields.len())
            .finish()
    }
}

pub struct RecordTypeBuilder {
    def: RecordTypeDef,
    reserved: Option<String>,
}

impl RecordTypeBuilder {
    pub fn singular(mut self, singular: impl Into<String>) -> Self {
        self.def.singular = singular.into();
        self
    }

    pub fn plural(mut self, plural: impl Into<String>) -> Self {
        self.def.plural = plural.into();
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.def.pool_size = Some(pool_size);
        self
    }

    /// Declare a field, replacing any earlier field of the same name. A
    /// field named `_id` is refused when the type is built.
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        if field.name == ID_FIELD {
            self.reserved = Some(field.name);
            return self;
        }

        match self.def.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.def.fields.push(field),
        }
        self
    }

    pub fn build(self) -> Result<RecordType> {
        if let Some(name) = self.reserved {
            return Err(Error::Config(format!(
                "record type {:?} declares a field named {:?}, which is reserved for the id",
                self.def.key, name
            )));
        }

        Ok(RecordType {
            def: Arc::new(self.def),
        })
    }
}

/// A single document: its id plus whatever fields it currently carries.
///
/// A field missing from the map is "undefined" and is never written. An
/// explicit `null` is a value like any other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    #[serde(rename = "_id")]
    id: RecordId,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            fields: Map::new(),
        }
    }

    pub fn from_parts(id: RecordId, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn kind(&self) -> &RecordType {
        self.id.kind()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a field, returning its previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Builder-style [`set`](Record::set).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Make a field undefined again.
    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}
