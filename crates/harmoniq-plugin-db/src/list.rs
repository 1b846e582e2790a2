use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entry::{PluginDescription, PluginFormat, PluginKey};
use crate::store_json::StoreError;

/// Known plugins plus the identifiers that must not be probed again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginList {
    plugins: BTreeMap<PluginKey, PluginDescription>,
    blacklist: BTreeSet<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PluginListFile {
    plugins: Vec<PluginDescription>,
    #[serde(default)]
    blacklist: Vec<String>,
}

impl PluginList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty() && self.blacklist.is_empty()
    }

    pub fn clear(&mut self) {
        self.plugins.clear();
        self.blacklist.clear();
    }

    /// Inserts or replaces the description stored under its key. Returns
    /// `true` when the key was not known before.
    pub fn add(&mut self, description: PluginDescription) -> bool {
        self.plugins
            .insert(description.key.clone(), description)
            .is_none()
    }

    pub fn remove(&mut self, key: &PluginKey) -> Option<PluginDescription> {
        self.plugins.remove(key)
    }

    pub fn get(&self, key: &PluginKey) -> Option<&PluginDescription> {
        self.plugins.get(key)
    }

    pub fn contains(&self, key: &PluginKey) -> bool {
        self.plugins.contains_key(key)
    }

    pub fn descriptions(&self) -> impl Iterator<Item = &PluginDescription> {
        self.plugins.values()
    }

    pub fn descriptions_for(
        &self,
        format: PluginFormat,
    ) -> impl Iterator<Item = &PluginDescription> {
        self.plugins
            .values()
            .filter(move |description| description.format() == format)
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.plugins.keys().map(|key| key.identifier.as_str()).collect()
    }

    pub fn blacklist(&self) -> impl Iterator<Item = &str> {
        self.blacklist.iter().map(String::as_str)
    }

    pub fn is_blacklisted(&self, identifier: &str) -> bool {
        self.blacklist.contains(identifier)
    }

    pub fn add_blacklisted(&mut self, identifier: impl Into<String>) -> bool {
        self.blacklist.insert(identifier.into())
    }

    pub fn remove_blacklisted(&mut self, identifier: &str) -> bool {
        self.blacklist.remove(identifier)
    }

    /// Union of both lists. Membership only grows; when both sides know a key
    /// the description with the newer `last_seen` wins and ties keep ours.
    pub fn merge(&mut self, other: &PluginList) {
        for (key, incoming) in &other.plugins {
            match self.plugins.get_mut(key) {
                Some(existing) => {
                    if incoming.last_seen > existing.last_seen {
                        *existing = incoming.clone();
                    }
                }
                None => {
                    self.plugins.insert(key.clone(), incoming.clone());
                }
            }
        }
        self.blacklist.extend(other.blacklist.iter().cloned());
    }

    pub fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let file = PluginListFile {
            plugins: self.plugins.values().cloned().collect(),
            blacklist: self.blacklist.iter().cloned().collect(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
        let file: PluginListFile = serde_json::from_slice(bytes)?;
        let mut list = PluginList::new();
        for description in file.plugins {
            list.add(description);
        }
        list.blacklist.extend(file.blacklist);
        Ok(list)
    }
}
