//! All configured storages of one running instance
//!
//! Routes each variable to the first storage (in declaration order) whose
//! pattern accepts it, tracks which files are claimed, and runs the staged
//! startup: every storage bulk-loads first, variables are redistributed to
//! their owning storage, and only then do background threads start.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::StorageEngine;
use crate::config::StorageConfig;
use crate::error::{Result, VarStoreError};
use crate::registry::VariableSink;
use crate::types::SerializedRecord;

#[derive(Default)]
pub struct StorageSet {
    storages: Vec<StorageEngine>,
    failures: Vec<(String, VarStoreError)>,
}

impl StorageSet {
    /// Load every configured storage into `sink`
    ///
    /// A storage that fails to load is logged and skipped; the others keep
    /// working. Variables matching only a failed storage are not persisted.
    pub fn load(configs: &[StorageConfig], sink: Arc<dyn VariableSink>) -> Self {
        let mut set = Self::default();
        let mut claimed: HashMap<PathBuf, String> = HashMap::new();
        let mut loaded: Vec<Vec<SerializedRecord>> = Vec::new();

        for config in configs {
            match Self::open_one(config, &mut claimed) {
                Ok((engine, records)) => {
                    set.storages.push(engine);
                    loaded.push(records);
                }
                Err(e) => {
                    tracing::error!(
                        storage = %config.name,
                        "Storage failed to load, variables matching its pattern will NOT be saved: {}",
                        e
                    );
                    set.failures.push((config.name.clone(), e));
                }
            }
        }

        set.distribute(loaded, sink.as_ref());

        for engine in &set.storages {
            if let Err(e) = engine.start_background(sink.clone()) {
                tracing::error!(
                    storage = %engine.name(),
                    "Could not start background threads: {}",
                    e
                );
            }
        }

        set
    }

    fn open_one(
        config: &StorageConfig,
        claimed: &mut HashMap<PathBuf, String>,
    ) -> Result<(StorageEngine, Vec<SerializedRecord>)> {
        config.validate()?;

        // Claim the file before anything connects to it
        let claim = config.file_path().map(|file| claim_key(&file));
        if let Some(key) = &claim {
            if let Some(owner) = claimed.get(key) {
                return Err(VarStoreError::Config(format!(
                    "file '{}' is already used by storage '{}'",
                    key.display(),
                    owner
                )));
            }
            claimed.insert(key.clone(), config.name.clone());
        }

        let opened = StorageEngine::open(config.clone()).and_then(|engine| {
            let records = engine.bulk_load()?;
            engine.start_writer()?;
            Ok((engine, records))
        });
        if opened.is_err() {
            if let Some(key) = &claim {
                claimed.remove(key);
            }
        }
        opened
    }

    /// Report loaded records to the sink, moving each variable found outside
    /// its owning storage
    ///
    /// Records already in their owner are reported first, so a stale copy in
    /// another storage never overwrites the owner's value.
    fn distribute(&self, loaded: Vec<Vec<SerializedRecord>>, sink: &dyn VariableSink) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut misplaced: Vec<(usize, SerializedRecord)> = Vec::new();

        for (source, records) in loaded.into_iter().enumerate() {
            let source_name = self.storages[source].name();
            for record in records {
                match self.owner_index(&record.name) {
                    Some(owner) if owner == source => {
                        sink.variable_loaded(&record.name, record.value.as_ref(), source_name);
                        seen.insert(record.name);
                    }
                    Some(_) => misplaced.push((source, record)),
                    None => {
                        tracing::warn!(
                            storage = %source_name,
                            variable = %record.name,
                            "Variable no longer matches any storage pattern, further changes will not be saved"
                        );
                        sink.variable_loaded(&record.name, record.value.as_ref(), source_name);
                    }
                }
            }
        }

        for (source, record) in misplaced {
            let source = &self.storages[source];
            source.save(SerializedRecord::tombstone(record.name.clone()));

            if !seen.insert(record.name.clone()) {
                continue;
            }
            if let Some(owner) = self.owner_index(&record.name).map(|i| &self.storages[i]) {
                tracing::info!(
                    variable = %record.name,
                    "Moving variable from storage '{}' to '{}'",
                    source.name(),
                    owner.name()
                );
                sink.variable_loaded(&record.name, record.value.as_ref(), owner.name());
                owner.save(record);
            }
        }
    }

    fn owner_index(&self, name: &str) -> Option<usize> {
        self.storages.iter().position(|s| s.accept(name))
    }

    /// The storage responsible for `name`
    pub fn route(&self, name: &str) -> Option<&StorageEngine> {
        self.owner_index(name).map(|i| &self.storages[i])
    }

    /// Queue `record` on its owning storage; false if no storage accepts it
    pub fn save(&self, record: SerializedRecord) -> bool {
        match self.route(&record.name) {
            Some(storage) => storage.save(record),
            None => {
                tracing::debug!(variable = %record.name, "No storage accepts variable, not persisted");
                false
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&StorageEngine> {
        self.storages.iter().find(|s| s.name() == name)
    }

    pub fn storages(&self) -> &[StorageEngine] {
        &self.storages
    }

    /// Storages that failed to load, with the reason
    pub fn failures(&self) -> &[(String, VarStoreError)] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Close every storage in declaration order
    pub fn close(&self) {
        for storage in &self.storages {
            storage.close();
        }
    }
}

/// Canonical form of a backing file path, usable before the file exists
fn claim_key(file: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(file) {
        return path;
    }
    match (file.parent(), file.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            std::fs::canonicalize(parent)
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| file.to_path_buf())
        }
        _ => file.to_path_buf(),
    }
}
