//! Extension configuration.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use broadcast_ipc::ScreenGeometry;
use broadcast_muxer::MuxerConfig;
use broadcast_writer::TRACK_QUEUE_CAPACITY;

use crate::error::{SessionError, SessionResult};

const DEFAULT_EXPECTED_FPS: u32 = 60;
const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44100;
const DEFAULT_AUDIO_CHANNELS: u16 = 1;
const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 128;
const DEFAULT_FINISH_TIMEOUT_MS: u64 = 30_000;

/// Configuration read by the broadcast extension at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Application group shared with the host app.
    pub app_group_identifier: Option<String>,

    /// Directory holding one container directory per application group.
    pub container_root: PathBuf,

    /// Private directory for in-progress recordings.
    pub scratch_dir: PathBuf,

    /// Directory of the stop-notification sockets.
    pub notification_dir: PathBuf,

    pub expected_fps: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub audio_bitrate_kbps: u32,

    /// Samples queued per track before it reports not ready.
    pub track_queue_capacity: usize,

    /// Bound on the finalization wait in milliseconds. `None` waits forever.
    pub finish_timeout_ms: Option<u64>,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        let tmp = env::temp_dir();
        Self {
            app_group_identifier: None,
            container_root: tmp.join("broadcast-containers"),
            scratch_dir: tmp.join("broadcast-scratch"),
            notification_dir: tmp.join("broadcast-notifications"),
            expected_fps: DEFAULT_EXPECTED_FPS,
            audio_sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            audio_channels: DEFAULT_AUDIO_CHANNELS,
            audio_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
            track_queue_capacity: TRACK_QUEUE_CAPACITY,
            finish_timeout_ms: Some(DEFAULT_FINISH_TIMEOUT_MS),
        }
    }
}

impl ExtensionConfig {
    /// Load configuration from a JSON file; missing keys take defaults.
    pub fn load(path: &Path) -> SessionResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| SessionError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| SessionError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        debug!(path = %path.display(), group = ?config.app_group_identifier, "Loaded configuration");
        Ok(config)
    }

    pub fn with_app_group(mut self, group: impl Into<String>) -> Self {
        self.app_group_identifier = Some(group.into());
        self
    }

    pub fn with_container_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.container_root = root.into();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_notification_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.notification_dir = dir.into();
        self
    }

    pub fn with_finish_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.finish_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// The configured application group, if non-empty.
    pub fn app_group(&self) -> SessionResult<&str> {
        self.app_group_identifier
            .as_deref()
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .ok_or(SessionError::MissingAppGroup)
    }

    /// Root of the application group's shared container.
    pub fn group_container(&self) -> SessionResult<PathBuf> {
        Ok(self.container_root.join(self.app_group()?))
    }

    /// Shared directory that receives finished recordings.
    pub fn shared_documents_dir(&self) -> SessionResult<PathBuf> {
        Ok(self.group_container()?.join("Library").join("Documents"))
    }

    /// Key/value file holding the shared output record.
    pub fn shared_record_path(&self) -> SessionResult<PathBuf> {
        let group = self.app_group()?;
        Ok(self
            .group_container()?
            .join("Library")
            .join("Preferences")
            .join(format!("{}.json", group)))
    }

    pub fn finish_timeout(&self) -> Option<Duration> {
        self.finish_timeout_ms.map(Duration::from_millis)
    }

    /// Multiplexer parameters for a display.
    pub fn muxer_config(&self, screen: ScreenGeometry) -> MuxerConfig {
        MuxerConfig {
            screen,
            expected_fps: self.expected_fps,
            audio_sample_rate: self.audio_sample_rate,
            audio_channels: self.audio_channels,
            audio_bitrate_kbps: self.audio_bitrate_kbps,
            finish_timeout: self.finish_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExtensionConfig::default();
        assert_eq!(config.app_group_identifier, None);
        assert_eq!(config.expected_fps, DEFAULT_EXPECTED_FPS);
        assert_eq!(config.track_queue_capacity, TRACK_QUEUE_CAPACITY);
        assert_eq!(config.finish_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_group_is_an_error() {
        let config = ExtensionConfig::default();
        assert!(matches!(
            config.shared_documents_dir(),
            Err(SessionError::MissingAppGroup)
        ));

        let blank = ExtensionConfig::default().with_app_group("  ");
        assert!(matches!(blank.app_group(), Err(SessionError::MissingAppGroup)));
    }

    #[test]
    fn test_shared_layout() {
        let config = ExtensionConfig::default()
            .with_app_group("group.com.example.coach")
            .with_container_root("/containers");

        assert_eq!(
            config.shared_documents_dir().unwrap(),
            PathBuf::from("/containers/group.com.example.coach/Library/Documents")
        );
        assert_eq!(
            config.shared_record_path().unwrap(),
            PathBuf::from(
                "/containers/group.com.example.coach/Library/Preferences/group.com.example.coach.json"
            )
        );
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extension.json");
        fs::write(
            &path,
            r#"{ "app_group_identifier": "group.test", "audio_sample_rate": 48000, "finish_timeout_ms": null }"#,
        )
        .unwrap();

        let config = ExtensionConfig::load(&path).unwrap();
        assert_eq!(config.app_group().unwrap(), "group.test");
        assert_eq!(config.audio_sample_rate, 48000);
        assert_eq!(config.expected_fps, DEFAULT_EXPECTED_FPS);
        assert_eq!(config.finish_timeout(), None);

        let muxer = config.muxer_config(ScreenGeometry::new(390.0, 844.0, 3.0));
        assert_eq!(muxer.audio_sample_rate, 48000);
        assert_eq!(muxer.finish_timeout, None);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extension.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            ExtensionConfig::load(&path),
            Err(SessionError::Config { .. })
        ));
        assert!(matches!(
            ExtensionConfig::load(&dir.path().join("absent.json")),
            Err(SessionError::Config { .. })
        ));
    }
}
