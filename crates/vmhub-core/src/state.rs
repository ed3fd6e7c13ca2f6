//! JSON-backed state with change tracking

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::path::{get_path, set_path, PathError};
use crate::protocol::ChangeSet;
use crate::view_model::{BoxError, ViewModel, ViewModelMetadata};

/// A JSON object that remembers which top-level properties changed.
///
/// Deltas are keyed by top-level property and carry that property's whole
/// current value, so clients can merge them into their copy directly.
#[derive(Debug, Clone, Default)]
pub struct ObservableState {
    value: Map<String, Value>,
    changed: Vec<String>,
}

impl ObservableState {
    /// Start from `initial`; anything but an object starts empty
    pub fn new(initial: Value) -> Self {
        let value = match initial {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            value,
            changed: Vec::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.splitn(2, '.');
        let head = self.value.get(segments.next()?)?;
        match segments.next() {
            Some(rest) => get_path(head, rest),
            None => Some(head),
        }
    }

    /// Set a property; returns whether the value actually changed
    pub fn set(&mut self, path: &str, value: Value) -> Result<bool, PathError> {
        if self.get(path) == Some(&value) {
            return Ok(false);
        }

        let mut root = Value::Object(std::mem::take(&mut self.value));
        let result = set_path(&mut root, path, value);
        if let Value::Object(map) = root {
            self.value = map;
        }
        result?;

        let top = path.split('.').next().unwrap_or(path).to_string();
        if !self.changed.contains(&top) {
            self.changed.push(top);
        }
        Ok(true)
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(self.value.clone())
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Drain the delta accumulated since the last call
    pub fn take_changes(&mut self) -> Option<ChangeSet> {
        if self.changed.is_empty() {
            return None;
        }
        let mut delta = ChangeSet::new();
        for key in self.changed.drain(..) {
            let value = self.value.get(&key).cloned().unwrap_or(Value::Null);
            delta.insert(key, value);
        }
        Some(delta)
    }
}

/// A view model whose state is a plain JSON object.
///
/// Useful for form-like view models that need no custom logic.
#[derive(Debug, Clone, Default)]
pub struct StateViewModel {
    state: ObservableState,
    metadata: ViewModelMetadata,
}

impl StateViewModel {
    pub fn new(initial: Value) -> Self {
        Self {
            state: ObservableState::new(initial),
            metadata: ViewModelMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ViewModelMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn state_mut(&mut self) -> &mut ObservableState {
        &mut self.state
    }
}

#[async_trait]
impl ViewModel for StateViewModel {
    fn state(&self) -> Value {
        self.state.snapshot()
    }

    async fn apply(&mut self, path: &str, value: Value) -> Result<(), BoxError> {
        self.state.set(path, value)?;
        Ok(())
    }

    fn take_changes(&mut self) -> Option<ChangeSet> {
        self.state.take_changes()
    }

    fn metadata(&self) -> ViewModelMetadata {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_records_top_level_change() {
        let mut state = ObservableState::new(json!({"count": 0, "user": {"name": "a"}}));
        assert!(state.set("user.name", json!("b")).unwrap());

        let delta = state.take_changes().unwrap();
        assert_eq!(Value::Object(delta), json!({"user": {"name": "b"}}));
        assert!(state.take_changes().is_none());
    }

    #[test]
    fn test_unchanged_value_is_not_a_change() {
        let mut state = ObservableState::new(json!({"count": 3}));
        assert!(!state.set("count", json!(3)).unwrap());
        assert!(!state.has_changes());
    }

    #[test]
    fn test_later_write_wins() {
        let mut state = ObservableState::new(json!({"count": 0}));
        state.set("count", json!(1)).unwrap();
        state.set("count", json!(2)).unwrap();

        let delta = state.take_changes().unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["count"], json!(2));
    }

    #[test]
    fn test_failed_set_keeps_state() {
        let mut state = ObservableState::new(json!({"count": 1}));
        assert!(state.set("count.inner", json!(2)).is_err());
        assert_eq!(state.snapshot(), json!({"count": 1}));
        assert!(!state.has_changes());
    }

    #[tokio::test]
    async fn test_state_view_model_apply() {
        let mut vm = StateViewModel::new(json!({"title": ""}));
        vm.apply("title", json!("hello")).await.unwrap();

        assert_eq!(vm.state(), json!({"title": "hello"}));
        assert_eq!(Value::Object(vm.take_changes().unwrap()), json!({"title": "hello"}));
    }
}
