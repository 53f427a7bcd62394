//! Per-device connection counters.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// Stores how often each device (keyed by object path) has been connected successfully.
pub trait ConnectionHistory {
    /// Returns the number of recorded connections of `device`.
    fn get(&self, device: &str) -> u32;

    /// Records one more connection of `device` and returns the new count.
    fn increment(&self, device: &str) -> u32;
}

/// A [`ConnectionHistory`] that forgets everything when dropped.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    counts: RefCell<BTreeMap<String, u32>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionHistory for MemoryHistory {
    fn get(&self, device: &str) -> u32 {
        self.counts.borrow().get(device).copied().unwrap_or(0)
    }

    fn increment(&self, device: &str) -> u32 {
        let mut counts = self.counts.borrow_mut();
        let count = counts.entry(device.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }
}

/// A [`ConnectionHistory`] persisted as a TOML table of `"<object path>" = <count>` entries.
///
/// The file is rewritten on every [`increment`][ConnectionHistory::increment]. Write failures
/// are logged; the in-memory count is still updated.
#[derive(Debug)]
pub struct FileHistory {
    path: PathBuf,
    counts: MemoryHistory,
}

impl FileHistory {
    /// Opens the history at `path`. A missing file is treated as an empty history.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let counts = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(Error::from)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::from(e)),
        };
        Ok(Self {
            path,
            counts: MemoryHistory {
                counts: RefCell::new(counts),
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> std::result::Result<(), String> {
        let content =
            toml::to_string(&*self.counts.counts.borrow()).map_err(|e| e.to_string())?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        }
        fs::write(&self.path, content).map_err(|e| e.to_string())
    }
}

impl ConnectionHistory for FileHistory {
    fn get(&self, device: &str) -> u32 {
        self.counts.get(device)
    }

    fn increment(&self, device: &str) -> u32 {
        let count = self.counts.increment(device);
        if let Err(e) = self.save() {
            log::warn!(
                "failed to persist connection history to {}: {}",
                self.path.display(),
                e
            );
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

    #[test]
    fn memory() {
        let history = MemoryHistory::new();
        assert_eq!(history.get(DEV), 0);
        assert_eq!(history.increment(DEV), 1);
        assert_eq!(history.increment(DEV), 2);
        assert_eq!(history.get(DEV), 2);
        assert_eq!(history.get("/org/bluez/hci0/dev_other"), 0);
    }

    #[test]
    fn file_roundtrip() {
        let path = std::env::temp_dir()
            .join(format!("bluedeck-history-{}", std::process::id()))
            .join("history.toml");
        let _ = fs::remove_file(&path);

        let history = FileHistory::open(&path).unwrap();
        assert_eq!(history.get(DEV), 0);
        history.increment(DEV);
        history.increment(DEV);

        let reopened = FileHistory::open(&path).unwrap();
        assert_eq!(reopened.get(DEV), 2);
        assert_eq!(reopened.increment(DEV), 3);

        let _ = fs::remove_file(&path);
    }
}
