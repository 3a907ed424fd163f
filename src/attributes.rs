// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A thread-safe attribute bag for cross-cutting user state.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

/// A string-keyed map of opaque values, safe to share across worker
/// threads.
///
/// Attributes are scratch state for user code (listeners, invokers); the
/// core never interprets the values.
#[derive(Debug, Default)]
pub struct AttributeBag {
    attributes: Mutex<IndexMap<String, Value>>,
}

impl AttributeBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.attributes.lock().get(name).cloned()
    }

    /// Stores `value` under `name`, replacing any previous value.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.attributes.lock().insert(name.into(), value);
    }

    /// Removes and returns the value stored under `name`.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.attributes.lock().shift_remove(name)
    }

    /// The currently set attribute names, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.attributes.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_remove() {
        let bag = AttributeBag::new();
        assert_eq!(bag.get("missing"), None);

        bag.set("count", json!(3));
        bag.set("tag", json!("slow"));
        assert_eq!(bag.get("count"), Some(json!(3)));
        assert_eq!(bag.names(), ["count", "tag"]);

        assert_eq!(bag.remove("count"), Some(json!(3)));
        assert_eq!(bag.get("count"), None);
    }
}
