//! Record ↔ store key/value mapping.
//!
//! A [`RecordMapper`] turns a record into the key it lives at and the hash
//! fields stored there. The schema is declared once at construction and
//! validated then; a record that does not carry the declared fields is a
//! configuration error, never a silent drop.

use crate::record::Record;
use shardstate_common::{is_reserved_field, FieldMap, StateError, RESERVED_FIELD_PREFIX};
use shardstate_config::StateConfig;

/// Per-deployment key namespace, prepended to every mapped key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// An empty prefix means no namespacing.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, raw: &str) -> String {
        format!("{}{}", self.prefix, raw)
    }

    /// The mapped key field value of a namespaced key.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }
}

/// Record schema: which field is the key and which fields are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub key_field: String,
    pub value_fields: Vec<String>,
}

impl Schema {
    pub fn new(key_field: impl Into<String>, value_fields: &[&str]) -> Self {
        Self {
            key_field: key_field.into(),
            value_fields: value_fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn validate(&self) -> Result<(), StateError> {
        if self.key_field.trim().is_empty() {
            return Err(StateError::Configuration("key field is not set".into()));
        }
        if self.value_fields.is_empty() {
            return Err(StateError::Configuration(
                "at least one value field is required".into(),
            ));
        }
        for (i, field) in self.value_fields.iter().enumerate() {
            if field.trim().is_empty() {
                return Err(StateError::Configuration("empty value field name".into()));
            }
            if is_reserved_field(field) {
                return Err(StateError::Configuration(format!(
                    "value field '{}' uses a reserved prefix",
                    field
                )));
            }
            if self.value_fields[..i].contains(field) {
                return Err(StateError::Configuration(format!(
                    "value field '{}' declared twice",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Maps application records to store keys and hash fields.
pub trait RecordMapper: Send + Sync {
    /// The key a record is written at and the fields written there.
    fn to_key_value(&self, record: &Record) -> Result<(String, FieldMap), StateError>;

    /// The key a lookup record reads from.
    fn to_lookup_key(&self, record: &Record) -> Result<String, StateError>;

    /// Declared value fields, in declaration order.
    fn value_fields(&self) -> &[String];

    /// Name of the record field the key is derived from.
    fn key_field(&self) -> &str;
}

/// The stock mapper: key = namespace prefix + value of the key field; value =
/// the declared value fields.
#[derive(Debug, Clone)]
pub struct FieldsMapper {
    schema: Schema,
    namespace: KeyNamespace,
}

impl FieldsMapper {
    pub fn new(schema: Schema, namespace: KeyNamespace) -> Result<Self, StateError> {
        schema.validate()?;
        Ok(Self { schema, namespace })
    }

    pub fn from_config(config: &StateConfig) -> Result<Self, StateError> {
        Self::new(
            Schema {
                key_field: config.schema.key_field.clone(),
                value_fields: config.schema.value_fields.clone(),
            },
            KeyNamespace::new(config.key_prefix.clone()),
        )
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    fn key_of(&self, record: &Record) -> Result<String, StateError> {
        match record.get(&self.schema.key_field) {
            Some(v) if is_reserved_field(v) => Err(StateError::Configuration(format!(
                "key field '{}' value '{}' uses the reserved '{}' prefix",
                self.schema.key_field, v, RESERVED_FIELD_PREFIX
            ))),
            Some(v) if !v.is_empty() => Ok(self.namespace.key(v)),
            Some(_) => Err(StateError::Configuration(format!(
                "key field '{}' is empty",
                self.schema.key_field
            ))),
            None => Err(StateError::Configuration(format!(
                "record has no key field '{}'",
                self.schema.key_field
            ))),
        }
    }
}

impl RecordMapper for FieldsMapper {
    fn to_key_value(&self, record: &Record) -> Result<(String, FieldMap), StateError> {
        let key = self.key_of(record)?;
        let mut fields = FieldMap::new();
        for name in &self.schema.value_fields {
            let value = record.get(name).ok_or_else(|| {
                StateError::Configuration(format!(
                    "record for '{}' has no value field '{}'",
                    key, name
                ))
            })?;
            fields.insert(name.clone(), value.to_string());
        }
        Ok((key, fields))
    }

    fn to_lookup_key(&self, record: &Record) -> Result<String, StateError> {
        self.key_of(record)
    }

    fn value_fields(&self) -> &[String] {
        &self.schema.value_fields
    }

    fn key_field(&self) -> &str {
        &self.schema.key_field
    }
}
