use crate::cache::{validate_key, CacheError, KvStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Stores every key as `<dir>/<key>.json`
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    value: serde_json::Value,
}

impl Envelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl FileKvStore {
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::Io(dir.display().to_string(), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, CacheError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }

    fn read_envelope(path: &Path) -> Result<Option<Envelope>, CacheError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(path.display().to_string(), e)),
        }
    }

    fn remove(path: &Path) -> Result<(), CacheError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(path.display().to_string(), e)),
        }
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let path = self.path(key)?;
        match Self::read_envelope(&path)? {
            Some(envelope) if envelope.is_expired(Utc::now()) => {
                Self::remove(&path)?;
                Ok(None)
            }
            Some(envelope) => Ok(Some(envelope.value)),
            None => Ok(None),
        }
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let path = self.path(key)?;
        let envelope = Envelope {
            expires_at: ttl.and_then(expiry_from_now),
            value,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        // write next to the target and rename, so readers never see half a file
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes).map_err(|e| CacheError::Io(tmp_path.display().to_string(), e))?;
        fs::rename(&tmp_path, &path).map_err(|e| CacheError::Io(path.display().to_string(), e))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        Self::remove(&self.path(key)?)
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let entries =
            fs::read_dir(&self.dir).map_err(|e| CacheError::Io(self.dir.display().to_string(), e))?;

        let mut removed = 0;
        for entry in entries {
            let path = entry
                .map_err(|e| CacheError::Io(self.dir.display().to_string(), e))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            // unreadable entries are left alone, they are reported when accessed by key
            match Self::read_envelope(&path) {
                Ok(Some(envelope)) if envelope.is_expired(now) => {
                    Self::remove(&path)?;
                    removed += 1;
                }
                _ => {}
            }
        }

        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "purged expired cache entries");
        }
        Ok(removed)
    }
}

fn expiry_from_now(ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
}
