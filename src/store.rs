use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Why a rule mutation was refused. The admin surface turns these into
/// response messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleError {
    /// The `key::value` form payload did not split in two.
    Malformed,
    /// The forwarded IP overlaps an existing match key.
    DuplicateSource,
    /// The backend address overlaps an existing rule value.
    DuplicateBackend,
    /// `addTo` named a backend address no rule maps to.
    UnknownBackend,
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            RuleError::Malformed => "malformed rule, expected key::value",
            RuleError::DuplicateSource => "the forwarded IP is already configured",
            RuleError::DuplicateBackend => "the backend address is already configured",
            RuleError::UnknownBackend => "no rule has that backend address",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for RuleError {}

/// The live rule map shared between the admin surface and the
/// supervisor.
///
/// The broker never reads this directly: each broker generation gets a
/// snapshot, and every successful mutation here is followed by a restart
/// signal so the next generation picks the edit up. Mutations write
/// through to a JSON object file, serialized to a sibling temp file
/// first and renamed into place so a crash never leaves a torn config.
pub struct RuleStore {
    rules: Mutex<HashMap<String, String>>,
    path: PathBuf,
    restart: mpsc::Sender<()>,
}

impl RuleStore {
    /// A missing file is a valid empty store; it appears on the first
    /// persisted edit.
    pub fn load(path: &Path, restart: mpsc::Sender<()>) -> Result<Self> {
        let rules = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            rules: Mutex::new(rules),
            path: path.to_path_buf(),
            restart,
        })
    }

    /// Deep copy handed to each broker generation, so a running broker
    /// never observes mid-flight edits.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.rules.lock().clone()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&*self.rules.lock()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Add a brand new rule from a `key::value` payload. Both sides are
    /// checked for overlap against every existing rule by substring, so
    /// no source IP or backend address can be claimed twice.
    pub fn add(&self, data: &str) -> Result<(), RuleError> {
        let (key, value) = split_rule(data)?;

        {
            let mut rules = self.rules.lock();
            for (existing_key, existing_value) in rules.iter() {
                if existing_key.contains(key) {
                    return Err(RuleError::DuplicateSource);
                }
                if existing_value.contains(value) {
                    return Err(RuleError::DuplicateBackend);
                }
            }

            rules.insert(key.to_string(), value.to_string());
        }

        self.persist();
        Ok(())
    }

    /// Replace the rule at `old_key` with a `key::value` payload. The
    /// duplicate policy of [`RuleStore::add`] applies, ignoring the row
    /// being edited; a no-op edit is accepted without persisting.
    pub fn update(&self, old_key: &str, data: &str) -> Result<(), RuleError> {
        let (key, value) = split_rule(data)?;

        let changed = {
            let mut rules = self.rules.lock();
            for (existing_key, existing_value) in rules.iter() {
                if existing_key == old_key {
                    continue;
                }
                if existing_key.contains(key) {
                    return Err(RuleError::DuplicateSource);
                }
                if existing_value.contains(value) {
                    return Err(RuleError::DuplicateBackend);
                }
            }

            if key != old_key || rules.get(old_key).map(String::as_str) != Some(value) {
                rules.remove(old_key);
                rules.insert(key.to_string(), value.to_string());
                true
            } else {
                false
            }
        };

        if changed {
            self.persist();
        }

        Ok(())
    }

    /// Append a source IP to the match key of the rule whose backend
    /// address is `to`.
    pub fn add_to(&self, ip: &str, to: &str) -> Result<(), RuleError> {
        let ip = ip.trim();
        let to = to.trim();

        {
            let mut rules = self.rules.lock();

            let mut target = None;
            for (key, value) in rules.iter() {
                if key.contains(ip) {
                    return Err(RuleError::DuplicateSource);
                }
                if value == to {
                    target = Some(key.clone());
                }
            }

            let Some(key) = target else {
                return Err(RuleError::UnknownBackend);
            };

            if let Some(value) = rules.remove(&key) {
                rules.insert(format!("{key};{ip}"), value);
            }
        }

        self.persist();
        Ok(())
    }

    /// Write-through: serialize next to the store file, then rename over
    /// it, then ask the supervisor for a broker restart. A restart
    /// already pending covers this edit too, the supervisor snapshots
    /// the map after draining the signal.
    fn persist(&self) {
        let written = (|| -> Result<()> {
            let bytes = serde_json::to_vec(&*self.rules.lock())?;
            let temp = self.path.with_file_name("tmp.txt");
            fs::write(&temp, bytes)?;
            fs::rename(&temp, &self.path)?;
            Ok(())
        })();

        if let Err(error) = written {
            log::error!("rule store write failed: path={:?}, err={error}", self.path);
            return;
        }

        log::info!("rule store updated: path={:?}", self.path);
        let _ = self.restart.try_send(());
    }
}

fn split_rule(data: &str) -> Result<(&str, &str), RuleError> {
    data.split_once("::").ok_or(RuleError::Malformed)
}
