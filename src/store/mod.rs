//! The boundary between the accessor and the document store.
//!
//! The accessor only ever makes two kinds of calls: one bulk write carrying
//! an ordered list of [`WriteOp`]s, and one lookup by a set of ids. Anything
//! that can answer those two calls can back it.

mod memory;

pub use memory::{MemoryStore, StoreCall};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    error::Result,
    ident::RecordId,
    record::{Record, RecordType},
};

/// The `{"_id": ...}` filter naming the target of a write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdFilter {
    #[serde(rename = "_id")]
    pub id: RecordId,
}

/// One operation of a bulk write. Serializes in the
/// `insertOne`/`updateOne`/`deleteOne` shape that document stores accept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOp {
    InsertOne {
        /// The projected document, including its `_id`.
        document: Map<String, Value>,
    },
    UpdateOne {
        filter: IdFilter,
        /// The projected fields to set.
        update: Map<String, Value>,
        upsert: bool,
    },
    DeleteOne {
        filter: IdFilter,
    },
}

impl WriteOp {
    /// The id of the record this operation targets.
    pub fn target(&self) -> Option<&str> {
        match self {
            WriteOp::InsertOne { document } => document.get("_id").and_then(Value::as_str),
            WriteOp::UpdateOne { filter, .. } | WriteOp::DeleteOne { filter } => {
                Some(filter.id.as_str())
            }
        }
    }
}

/// A document store, as seen by the accessor.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Apply the operations in order. On success, returns one outcome per
    /// operation, in the same order; an `Err` means the whole round-trip
    /// failed.
    async fn bulk_write(&self, kind: &RecordType, ops: Vec<WriteOp>) -> Result<Vec<Result<()>>>;

    /// Fetch every record among `ids` that exists. Missing ids are simply
    /// absent from the result.
    async fn find_by_ids(&self, kind: &RecordType, ids: &[RecordId]) -> Result<Vec<Record>>;
}
