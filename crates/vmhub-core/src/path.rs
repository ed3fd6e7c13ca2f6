//! Dotted property paths over JSON values.
//!
//! Segments are separated by `.`; a numeric segment indexes an array.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Empty property path or segment in '{0}'")]
    EmptySegment(String),

    #[error("Invalid array index '{0}'")]
    InvalidIndex(String),

    #[error("Index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Cannot descend into '{0}': not an object or array")]
    NotContainer(String),
}

fn segments(path: &str) -> Result<Vec<&str>, PathError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(PathError::EmptySegment(path.to_string()));
    }
    Ok(segments)
}

fn parse_index(segment: &str) -> Result<usize, PathError> {
    segment
        .parse()
        .map_err(|_| PathError::InvalidIndex(segment.to_string()))
}

fn step_mut<'a>(cursor: &'a mut Value, segment: &str) -> Result<&'a mut Value, PathError> {
    if cursor.is_null() {
        *cursor = Value::Object(Map::new());
    }
    match cursor {
        Value::Object(map) => Ok(map.entry(segment.to_string()).or_insert(Value::Null)),
        Value::Array(items) => {
            let index = parse_index(segment)?;
            let len = items.len();
            items
                .get_mut(index)
                .ok_or(PathError::IndexOutOfBounds { index, len })
        }
        _ => Err(PathError::NotContainer(segment.to_string())),
    }
}

/// Set `path` inside `target`, creating missing intermediate objects.
///
/// Writing one past the end of an array appends.
pub fn set_path(target: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let segments = segments(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(PathError::EmptySegment(path.to_string()));
    };

    let mut cursor = target;
    for segment in parents {
        cursor = step_mut(cursor, segment)?;
    }

    if cursor.is_null() {
        *cursor = Value::Object(Map::new());
    }
    match cursor {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last)?;
            let len = items.len();
            if index < len {
                items[index] = value;
                Ok(())
            } else if index == len {
                items.push(value);
                Ok(())
            } else {
                Err(PathError::IndexOutOfBounds { index, len })
            }
        }
        _ => Err(PathError::NotContainer((*last).to_string())),
    }
}

/// Read the value at `path`
pub fn get_path<'a>(target: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = target;
    for segment in path.split('.') {
        cursor = match cursor {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}
