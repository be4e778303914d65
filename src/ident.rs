//! Prefixed record identifiers.
//!
//! Every record id is exposed as `PREFIX-raw`, where the prefix names the
//! record type and the raw part is unique within it. Because the prefix is
//! enough to find the type, a bare id string can be routed to the right
//! accessor without touching the store; all that's needed is a
//! [`TypeRegistry`] mapping prefixes to types.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

use arc_swap::ArcSwap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    record::{Record, RecordType},
};

const SEPARATOR: char = '-';
const MAX_RAW_LEN: usize = 64;

/// A typed, canonicalized record identifier.
///
/// Ids compare, hash, and display by their public string. The raw part is
/// always stored lowercase and the prefix uppercase, so `u-ABC` and `U-abc`
/// are the same id.
#[derive(Clone)]
pub struct RecordId {
    kind: RecordType,
    // Offset of the raw part within `public`
    split: usize,
    public: Arc<str>,
}

impl RecordId {
    /// Create an id of the given type. `raw` may be a bare value or a full
    /// public string; in the latter case its prefix must match `kind`.
    pub fn new(kind: &RecordType, raw: &str) -> Result<Self> {
        let raw = match split_prefix(raw) {
            None => raw,
            Some((prefix, rest)) if prefix.eq_ignore_ascii_case(kind.prefix()) => rest,
            Some((prefix, _)) => {
                return Err(Error::invalid_key(
                    raw,
                    format!(
                        "prefix {:?} does not match record type {:?}",
                        prefix.to_uppercase(),
                        kind.prefix()
                    ),
                ))
            }
        };

        Self::from_raw(kind, raw)
    }

    /// Mint a fresh, random id of the given type.
    pub fn generate(kind: &RecordType) -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self::assemble(kind, &raw)
    }

    fn from_raw(kind: &RecordType, raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::invalid_key(raw, "the raw id is empty"));
        }
        if raw.len() > MAX_RAW_LEN {
            return Err(Error::invalid_key(
                raw,
                format!("the raw id is longer than {} characters", MAX_RAW_LEN),
            ));
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::invalid_key(
                raw,
                "the raw id must be ASCII letters and digits",
            ));
        }

        Ok(Self::assemble(kind, &raw.to_ascii_lowercase()))
    }

    fn assemble(kind: &RecordType, raw: &str) -> Self {
        let public = format!("{}{}{}", kind.prefix(), SEPARATOR, raw);
        Self {
            kind: kind.clone(),
            split: kind.prefix().len() + SEPARATOR.len_utf8(),
            public: public.into(),
        }
    }

    pub fn kind(&self) -> &RecordType {
        &self.kind
    }

    pub fn prefix(&self) -> &str {
        self.kind.prefix()
    }

    /// The canonical (lowercase) raw value, without its prefix.
    pub fn raw(&self) -> &str {
        &self.public[self.split..]
    }

    /// The public `PREFIX-raw` form.
    pub fn as_str(&self) -> &str {
        &self.public
    }
}

fn split_prefix(input: &str) -> Option<(&str, &str)> {
    let index = input.find(SEPARATOR)?;
    Some((&input[..index], &input[index + SEPARATOR.len_utf8()..]))
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public.hash(state)
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.public)
    }
}

impl Debug for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordId").field(&&*self.public).finish()
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The prefix → record type map used to decode public ids.
///
/// Types are registered once while the system boots; afterwards the map is
/// only read, so lookups go through an [`ArcSwap`] and never block.
#[derive(Default)]
pub struct TypeRegistry {
    types: ArcSwap<HashMap<String, RecordType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record type under its prefix. Fails if the prefix isn't
    /// made of ASCII letters and digits, or if another type already claimed
    /// it.
    pub fn register(&self, kind: RecordType) -> Result<()> {
        let prefix = kind.prefix();
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::Config(format!(
                "record type {:?} has prefix {:?}; a prefix must be ASCII letters and digits",
                kind.key(),
                prefix
            )));
        }

        let mut conflict = None;

        self.types.rcu(|types| {
            conflict = types.get(kind.prefix()).cloned();
            let mut types = HashMap::clone(types);
            if conflict.is_none() {
                types.insert(kind.prefix().to_owned(), kind.clone());
            }
            types
        });

        match conflict {
            None => Ok(()),
            Some(existing) => Err(Error::Config(format!(
                "prefix {:?} of record type {:?} is already registered to {:?}",
                kind.prefix(),
                kind.key(),
                existing.key()
            ))),
        }
    }

    /// Look up a record type by prefix, case-insensitively.
    pub fn get(&self, prefix: &str) -> Option<RecordType> {
        let types = self.types.load();
        match types.get(prefix) {
            Some(kind) => Some(kind.clone()),
            None => types.get(&prefix.to_uppercase()).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.types.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.load().is_empty()
    }

    /// Decode a public id string.
    ///
    /// A prefixed input is routed by its prefix, which must be registered;
    /// if `expected` is given, the decoded type must match it. An input
    /// without a prefix is only accepted when `expected` supplies the type.
    pub fn parse(&self, input: &str, expected: Option<&RecordType>) -> Result<RecordId> {
        let input = input.trim();

        match split_prefix(input) {
            Some((prefix, raw)) => {
                let kind = self.get(prefix).ok_or_else(|| {
                    Error::invalid_key(
                        input,
                        format!("prefix {:?} is not a registered record type", prefix),
                    )
                })?;

                if let Some(expected) = expected {
                    if *expected != kind {
                        return Err(Error::invalid_key(
                            input,
                            format!(
                                "expected a {} id, found a {} id",
                                expected.singular(),
                                kind.singular()
                            ),
                        ));
                    }
                }

                RecordId::from_raw(&kind, raw)
            }
            None => match expected {
                Some(kind) => RecordId::from_raw(kind, input),
                None => Err(Error::invalid_key(
                    input,
                    "the id has no prefix and no record type was given",
                )),
            },
        }
    }

    /// Check every reference field of `record` and store its value in
    /// canonical `PREFIX-raw` form. A `null` reference is left as it is.
    pub fn resolve_references(&self, record: &mut Record) -> Result<()> {
        let kind = record.kind().clone();

        for field in kind.fields() {
            let target = match &field.reference {
                Some(target) => target,
                None => continue,
            };
            let target = self.get(target).ok_or_else(|| {
                Error::Config(format!(
                    "field {:?} of {:?} references prefix {:?}, which is not registered",
                    field.name,
                    kind.key(),
                    target
                ))
            })?;

            let canonical = match record.get(&field.name) {
                None | Some(Value::Null) => continue,
                Some(Value::String(raw)) => self.parse(raw, Some(&target))?,
                Some(other) => {
                    return Err(Error::Validation(format!(
                        "field {:?} must hold a {} id, found {}",
                        field.name,
                        target.singular(),
                        other
                    )))
                }
            };
            record.set(field.name.clone(), canonical.as_str());
        }

        Ok(())
    }
}

impl Debug for TypeRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.types.load().keys()).finish()
    }
}
