// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Free-form key/value store offered to API clients.

use config::{ApiError, ApiResult};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct UserAgentKv {
    entries: RwLock<HashMap<String, String>>,
}

impl UserAgentKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, key: &str, value: &str) {
        self.entries.write().insert(key.to_string(), value.to_string());
    }

    pub fn retrieve(&self, key: &str) -> ApiResult<String> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Unknown key {key}")))
    }

    /// Every entry whose key is listed; an empty list means all of them.
    #[must_use]
    pub fn retrieve_many(&self, keys: &[String]) -> Vec<(String, String)> {
        let entries = self.entries.read();
        let mut found: Vec<(String, String)> = entries
            .iter()
            .filter(|(k, _)| keys.is_empty() || keys.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        found.sort();
        found
    }

    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_retrieve_delete() {
        let kv = UserAgentKv::new();
        kv.store("k", "v1");
        kv.store("k", "v2");
        kv.store("j", "w");
        assert_eq!(kv.retrieve("k"), Ok("v2".to_string()));
        assert_eq!(kv.retrieve_many(&[]).len(), 2);
        kv.delete("k");
        assert!(kv.retrieve("k").expect_err("Should be gone").is_not_found());
        kv.delete("k");
    }
}
