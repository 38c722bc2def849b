//! Safe lookup and mutation over decoded JSON bodies.
//!
//! Every accessor returns a [`PathMiss`] describing which segment was absent
//! instead of silently producing nothing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a lookup did not reach its target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathMiss {
    #[error("body is not a JSON object")]
    NotAnObject,
    #[error("field '{0}' is missing")]
    MissingField(String),
    #[error("field '{0}' is not an array")]
    NotAnArray(String),
    #[error("no element of '{array}' has {key} equal to the locator value")]
    NoMatchingElement { array: String, key: String },
    #[error("field '{0}' has no object at index 0")]
    NoNestedObject(String),
}

/// Identifies one element of an array field by linear scan: the first
/// element whose `key` property equals `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayLocator {
    /// Top-level field holding the array
    pub array_path: String,
    /// Property compared on each element
    pub key: String,
    /// Expected value, compared with strict JSON equality
    pub value: Value,
}

impl ArrayLocator {
    pub fn new(array_path: impl Into<String>, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            array_path: array_path.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

fn as_object_mut(target: &mut Value) -> Result<&mut Map<String, Value>, PathMiss> {
    target.as_object_mut().ok_or(PathMiss::NotAnObject)
}

/// Set `target[field] = value`. Inserts the field when it does not exist yet.
pub fn set_field(target: &mut Value, field: &str, value: Value) -> Result<(), PathMiss> {
    as_object_mut(target)?.insert(field.to_string(), value);
    Ok(())
}

/// Borrow the array stored at `target[path]`.
pub fn array_mut<'a>(target: &'a mut Value, path: &str) -> Result<&'a mut Vec<Value>, PathMiss> {
    as_object_mut(target)?
        .get_mut(path)
        .ok_or_else(|| PathMiss::MissingField(path.to_string()))?
        .as_array_mut()
        .ok_or_else(|| PathMiss::NotAnArray(path.to_string()))
}

/// Find the element addressed by `locator`. First match wins; elements that
/// are not objects never match.
pub fn locate_mut<'a>(target: &'a mut Value, locator: &ArrayLocator) -> Result<&'a mut Value, PathMiss> {
    array_mut(target, &locator.array_path)?
        .iter_mut()
        .find(|element| element.get(&locator.key) == Some(&locator.value))
        .ok_or_else(|| PathMiss::NoMatchingElement {
            array: locator.array_path.clone(),
            key: locator.key.clone(),
        })
}

/// Borrow the object at index 0 of the array stored at `element[property]`.
pub fn first_nested_object_mut<'a>(
    element: &'a mut Value,
    property: &str,
) -> Result<&'a mut Map<String, Value>, PathMiss> {
    array_mut(element, property)?
        .first_mut()
        .and_then(Value::as_object_mut)
        .ok_or_else(|| PathMiss::NoNestedObject(property.to_string()))
}
