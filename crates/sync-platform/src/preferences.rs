//! Last-opened guild/channel selection remembered between launches.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use sync_core::OrderedId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LastOpened {
    #[serde(default)]
    pub guild_id: Option<OrderedId>,
    #[serde(default)]
    pub channel_id: Option<OrderedId>,
}

#[derive(Debug, Error)]
pub enum PreferencesError {
    #[error("failed reading preferences {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed writing preferences {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed parsing preferences {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed encoding preferences: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait PreferencesStore: Send + Sync {
    fn last_opened(&self) -> Result<LastOpened, PreferencesError>;

    fn set_last_opened(&self, selection: LastOpened) -> Result<(), PreferencesError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    last_opened: RwLock<LastOpened>,
}

impl InMemoryPreferences {
    pub fn new(last_opened: LastOpened) -> Self {
        Self {
            last_opened: RwLock::new(last_opened),
        }
    }
}

impl PreferencesStore for InMemoryPreferences {
    fn last_opened(&self) -> Result<LastOpened, PreferencesError> {
        Ok(*self
            .last_opened
            .read()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn set_last_opened(&self, selection: LastOpened) -> Result<(), PreferencesError> {
        *self
            .last_opened
            .write()
            .unwrap_or_else(PoisonError::into_inner) = selection;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferencesFile {
    #[serde(default)]
    last_opened: LastOpened,
}

/// Preferences persisted as JSON. A missing file reads as defaults.
#[derive(Debug, Clone)]
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file. Removing a missing file succeeds.
    pub fn clear(&self) -> Result<(), PreferencesError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PreferencesError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn load(&self) -> Result<PreferencesFile, PreferencesError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(PreferencesFile::default());
            }
            Err(source) => {
                return Err(PreferencesError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| PreferencesError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, file: &PreferencesFile) -> Result<(), PreferencesError> {
        let write_err = |source| PreferencesError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let encoded = serde_json::to_vec_pretty(file)?;
        let temp_path = temp_path_for(&self.path);
        fs::write(&temp_path, encoded).map_err(write_err)?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(_) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(write_err(rename_err));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                write_err(err)
            })?;
        }
        Ok(())
    }
}

impl PreferencesStore for JsonFilePreferences {
    fn last_opened(&self) -> Result<LastOpened, PreferencesError> {
        Ok(self.load()?.last_opened)
    }

    fn set_last_opened(&self, selection: LastOpened) -> Result<(), PreferencesError> {
        let mut file = self.load().unwrap_or_default();
        file.last_opened = selection;
        self.save(&file)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("preferences.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn unique_temp_path(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        env::temp_dir()
            .join(format!("chatsync-{label}-{now_nanos}"))
            .join("preferences.json")
    }

    fn selection(guild: u64, channel: u64) -> LastOpened {
        LastOpened {
            guild_id: Some(OrderedId::new(guild)),
            channel_id: Some(OrderedId::new(channel)),
        }
    }

    #[test]
    fn in_memory_preferences_remember_selection() {
        let prefs = InMemoryPreferences::default();
        assert_eq!(prefs.last_opened().expect("read"), LastOpened::default());

        prefs.set_last_opened(selection(1, 2)).expect("write");
        assert_eq!(prefs.last_opened().expect("read"), selection(1, 2));
    }

    #[test]
    fn json_file_round_trip() {
        let path = unique_temp_path("prefs");
        let prefs = JsonFilePreferences::new(&path);
        assert_eq!(
            prefs.last_opened().expect("missing file reads as default"),
            LastOpened::default()
        );

        prefs.set_last_opened(selection(100, 7)).expect("save should work");
        prefs.set_last_opened(selection(100, 8)).expect("overwrite should work");
        let reopened = JsonFilePreferences::new(&path);
        assert_eq!(reopened.last_opened().expect("load"), selection(100, 8));

        prefs.clear().expect("clear should work");
        prefs.clear().expect("clearing twice is fine");
        assert_eq!(prefs.last_opened().expect("load"), LastOpened::default());
        let _ = fs::remove_dir(path.parent().expect("temp dir"));
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let path = unique_temp_path("prefs-corrupt");
        fs::create_dir_all(path.parent().expect("temp dir")).expect("create dir");
        fs::write(&path, "{ not json").expect("write corrupt file");

        let prefs = JsonFilePreferences::new(&path);
        assert!(matches!(
            prefs.last_opened(),
            Err(PreferencesError::Parse { .. })
        ));

        prefs
            .set_last_opened(selection(1, 1))
            .expect("writing replaces a corrupt file");
        assert_eq!(prefs.last_opened().expect("load"), selection(1, 1));
        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir(path.parent().expect("temp dir"));
    }
}
