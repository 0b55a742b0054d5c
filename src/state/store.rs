use crate::error::{Error, Result};
use crate::state::ServerRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Durable mapping from server name to last-known record.
///
/// The store is a JSON file rewritten on every mutation, so records
/// survive a crash of the manager itself. Records are independent;
/// writes are last-writer-wins per record and no cross-record
/// transactions exist.
///
/// The persisted `running` flag is a hint only: the runner reconciles
/// it against OS process existence on startup before serving requests.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: HashMap<String, ServerRecord>,
}

impl StateStore {
    /// Opens the store at `path`, loading existing records if the file
    /// exists and creating parent directories otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateStore`] if the file exists but cannot be
    /// read or parsed, or if the parent directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::StateStore(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let records = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                Error::StateStore(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                Error::StateStore(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            HashMap::new()
        };

        Ok(Self { path, records })
    }

    /// Returns a copy of the record for `name`, if one exists.
    pub fn get(&self, name: &str) -> Option<ServerRecord> {
        self.records.get(name).cloned()
    }

    /// Inserts or replaces the record keyed by its name and persists.
    pub fn put(&mut self, record: ServerRecord) -> Result<()> {
        self.records.insert(record.name.clone(), record);
        self.save()
    }

    /// Removes the record for `name` and persists. Removing an absent
    /// name is a no-op.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        if self.records.remove(name).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// Returns copies of all records, in no particular order.
    pub fn list_all(&self) -> Vec<ServerRecord> {
        self.records.values().cloned().collect()
    }

    /// Ports held by records in a live state, used as the allocator's
    /// reservation set.
    pub fn reserved_ports(&self) -> std::collections::HashSet<u16> {
        self.records
            .values()
            .filter(|r| r.state.is_live())
            .filter_map(|r| r.port)
            .collect()
    }

    // Write to a sibling temp file then rename, so a crash mid-write
    // never leaves a truncated registry behind.
    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.records)
            .map_err(|e| Error::StateStore(format!("Failed to serialize records: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| {
            Error::StateStore(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            Error::StateStore(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;

        Ok(())
    }
}
