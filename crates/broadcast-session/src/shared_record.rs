//! Key/value record shared with the host application.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{SessionError, SessionResult};

/// Key of the "last session captured the microphone" flag.
pub const MIC_RECORD_KEY: &str = "LastBroadcastMicrophoneWasEnabled";

/// A JSON object file of preferences scoped to one application group.
#[derive(Debug, Clone)]
pub struct SharedDefaults {
    path: PathBuf,
}

impl SharedDefaults {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> SessionResult<Map<String, Value>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&contents).map_err(|e| {
            SessionError::Record(format!("{} is not a JSON object: {}", self.path.display(), e))
        })
    }

    fn store(&self, values: &Map<String, Value>) -> SessionResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(values)
            .map_err(|e| SessionError::Record(e.to_string()))?;

        // Readers never see a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Store a boolean under `key`.
    pub fn set_bool(&self, key: &str, value: bool) -> SessionResult<()> {
        let mut values = self.load()?;
        values.insert(key.to_string(), Value::Bool(value));
        self.store(&values)?;
        debug!(path = %self.path.display(), key, value, "Shared record written");
        Ok(())
    }

    /// Read a boolean; absent or non-boolean values read as `None`.
    pub fn bool(&self, key: &str) -> SessionResult<Option<bool>> {
        Ok(self.load()?.get(key).and_then(Value::as_bool))
    }

    /// Read a boolean and remove it.
    pub fn take_bool(&self, key: &str) -> SessionResult<Option<bool>> {
        let mut values = self.load()?;
        let value = values.remove(key);
        if value.is_some() {
            self.store(&values)?;
        }
        Ok(value.as_ref().and_then(Value::as_bool))
    }
}
