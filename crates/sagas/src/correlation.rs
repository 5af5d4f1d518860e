//! Correlation index entries.
//!
//! Every correlation property except the identity is indexed as
//! `(saga type, property path, stringified value) -> saga id`. The storage engine
//! enforces uniqueness of that triple.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::data::{CorrelationProperty, SagaData};
use crate::error::{SagaStoreError, SagaStoreResult};

/// Longest saga type name the index accepts.
pub const MAX_SAGA_TYPE_LENGTH: usize = 40;

/// Longest correlation property path the index accepts.
pub const MAX_CORRELATION_KEY_LENGTH: usize = 200;

/// Longest stringified correlation value the index accepts.
pub const MAX_CORRELATION_VALUE_LENGTH: usize = 200;

/// One row of the correlation index for a given saga instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub key: String,
    pub value: String,
}

/// Index form of a correlation value. `None` for JSON null.
///
/// Strings are used verbatim; everything else is its JSON text.
pub fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Value at a dotted path, `None` if any segment is missing.
pub fn extract<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

/// Validated saga type name of `D`.
pub fn saga_type_name<D: SagaData>() -> SagaStoreResult<String> {
    let name = D::saga_type_name();
    if name.chars().count() > MAX_SAGA_TYPE_LENGTH {
        return Err(SagaStoreError::Configuration(format!(
            "saga type name '{name}' is longer than {MAX_SAGA_TYPE_LENGTH} characters"
        )));
    }
    Ok(name)
}

/// Index rows for `saga`, one per distinct non-identity property path.
///
/// Missing and null values are skipped unless `index_nulls` is set, in which
/// case they are indexed as the empty string.
pub fn index_entries<D: SagaData>(
    saga: &D,
    properties: &[CorrelationProperty],
    index_nulls: bool,
) -> SagaStoreResult<Vec<IndexEntry>> {
    let document = serde_json::to_value(saga)
        .map_err(|e| SagaStoreError::InvalidSaga(format!("could not serialize saga {}: {e}", saga.id())))?;

    let mut entries = BTreeMap::new();
    for property in properties.iter().filter(|p| !p.is_id()) {
        let key = property.path();
        if key.chars().count() > MAX_CORRELATION_KEY_LENGTH {
            return Err(SagaStoreError::Configuration(format!(
                "correlation property '{key}' is longer than {MAX_CORRELATION_KEY_LENGTH} characters"
            )));
        }

        let value = match extract(&document, key).and_then(stringify) {
            Some(value) => value,
            None if index_nulls => String::new(),
            None => continue,
        };
        if value.chars().count() > MAX_CORRELATION_VALUE_LENGTH {
            return Err(SagaStoreError::InvalidSaga(format!(
                "value of correlation property '{key}' on saga {} is longer than {MAX_CORRELATION_VALUE_LENGTH} characters",
                saga.id()
            )));
        }
        entries.insert(key.to_string(), value);
    }

    Ok(entries
        .into_iter()
        .map(|(key, value)| IndexEntry { key, value })
        .collect())
}
