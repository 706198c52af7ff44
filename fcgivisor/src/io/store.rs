//! Persisted app registry: named sections of string key/value pairs.
//!
//! Every mutation rewrites the whole file (temp file + rename) before
//! returning, so a restarted supervisor always sees the last acknowledged
//! change. The in-memory view is only updated once the write succeeded.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::config::write_atomic;

pub type Section = BTreeMap<String, String>;

#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    sections: BTreeMap<String, Section>,
}

impl RegistryStore {
    /// Open the registry at `path`; a missing file is an empty registry.
    pub fn open(path: &Path) -> Result<Self> {
        let sections = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read registry {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("parse registry {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), sections = sections.len(), "registry loaded");
        Ok(Self {
            path: path.to_path_buf(),
            sections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sections in name order.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections
            .iter()
            .map(|(name, section)| (name.as_str(), section))
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|values| values.get(key))
            .map(String::as_str)
    }

    /// Set `key` in `section`, creating the section if needed.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        self.commit(|sections| {
            sections
                .entry(section.to_string())
                .or_default()
                .insert(key.to_string(), value);
        })
    }

    /// Replace `section` wholesale with `values`.
    pub fn set_section(&mut self, section: &str, values: Section) -> Result<()> {
        self.commit(|sections| {
            sections.insert(section.to_string(), values);
        })
    }

    /// Remove `key` from `section`; missing keys are not an error.
    pub fn remove_option(&mut self, section: &str, key: &str) -> Result<()> {
        if self.get(section, key).is_none() {
            return Ok(());
        }
        self.commit(|sections| {
            if let Some(values) = sections.get_mut(section) {
                values.remove(key);
            }
        })
    }

    /// Remove `section`; missing sections are not an error.
    pub fn remove_section(&mut self, section: &str) -> Result<()> {
        if !self.has_section(section) {
            return Ok(());
        }
        self.commit(|sections| {
            sections.remove(section);
        })
    }

    fn commit(&mut self, mutate: impl FnOnce(&mut BTreeMap<String, Section>)) -> Result<()> {
        let mut next = self.sections.clone();
        mutate(&mut next);
        let buf = toml::to_string(&next).context("serialize registry")?;
        write_atomic(&self.path, &buf)
            .with_context(|| format!("flush registry {}", self.path.display()))?;
        self.sections = next;
        debug!(path = %self.path.display(), "registry flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RegistryStore::open(&temp.path().join("apps.toml")).expect("open");
        assert_eq!(store.sections().count(), 0);
    }

    #[test]
    fn every_mutation_is_on_disk_immediately() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("apps.toml");
        let mut store = RegistryStore::open(&path).expect("open");

        store.set("foo", "path", "/apps/foo").expect("set path");
        store.set("foo", "port", "9500").expect("set port");
        let reopened = RegistryStore::open(&path).expect("reopen");
        assert_eq!(reopened.get("foo", "path"), Some("/apps/foo"));
        assert_eq!(reopened.get("foo", "port"), Some("9500"));

        store.set("foo", "disabled", "true").expect("set disabled");
        store.remove_option("foo", "disabled").expect("remove option");
        let reopened = RegistryStore::open(&path).expect("reopen");
        assert_eq!(reopened.get("foo", "disabled"), None);

        store.remove_section("foo").expect("remove section");
        let reopened = RegistryStore::open(&path).expect("reopen");
        assert!(!reopened.has_section("foo"));
    }

    #[test]
    fn sections_iterate_in_name_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = RegistryStore::open(&temp.path().join("apps.toml")).expect("open");
        store.set("wiki", "port", "9501").expect("set");
        store.set("api", "port", "9500").expect("set");
        let names: Vec<&str> = store.sections().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["api", "wiki"]);
    }

    #[test]
    fn failed_flush_leaves_memory_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "").expect("write blocker");
        let mut store = RegistryStore::open(&blocker.join("apps.toml")).expect("open");

        assert!(store.set("foo", "port", "9500").is_err());
        assert!(!store.has_section("foo"));
    }

    #[test]
    fn removing_missing_entries_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("apps.toml");
        let mut store = RegistryStore::open(&path).expect("open");
        store.remove_option("foo", "disabled").expect("remove option");
        store.remove_section("foo").expect("remove section");
        assert!(!path.exists());
    }
}
