//! Batches and per-key write grouping.

use crate::combiner::Combiner;
use crate::mapper::RecordMapper;
use crate::record::Record;
use shardstate_common::{BatchId, FieldMap, StateError};
use std::collections::HashMap;

/// An ordered sequence of records with the identifier the upstream engine
/// assigned to it. The unit of exactly-once application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: BatchId,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(id: BatchId, records: Vec<Record>) -> Self {
        Self { id, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// All field writes a batch makes to one key, already folded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWrite {
    pub key: String,
    pub fields: FieldMap,
}

/// Map every record and fold the values that target the same key and field
/// with `combiner`. Keys come out in first-seen order.
pub fn group_by_key(
    records: &[Record],
    mapper: &dyn RecordMapper,
    combiner: &dyn Combiner,
) -> Result<Vec<KeyWrite>, StateError> {
    let mut writes: Vec<KeyWrite> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let (key, fields) = mapper.to_key_value(record)?;
        let slot = match index.get(&key) {
            Some(&i) => i,
            None => {
                index.insert(key.clone(), writes.len());
                writes.push(KeyWrite {
                    key: key.clone(),
                    fields: FieldMap::new(),
                });
                writes.len() - 1
            }
        };
        let acc = &mut writes[slot].fields;
        for (field, value) in fields {
            let folded = combiner
                .combine(acc.get(&field).map(String::as_str), &value)
                .map_err(|e| StateError::InvalidValue {
                    key: key.clone(),
                    field: field.clone(),
                    value: e.0,
                })?;
            acc.insert(field, folded);
        }
    }

    Ok(writes)
}
