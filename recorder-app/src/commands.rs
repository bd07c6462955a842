//! Command implementations.

use std::path::Path;

use anyhow::Context;
use tracing::{info, instrument};

use broadcast_session::{ExtensionConfig, SharedDefaults, MIC_RECORD_KEY};
use broadcast_writer::{inspect_container, ContainerSummary};

/// Post the stop notification. Returns how many listeners it reached.
#[cfg(unix)]
#[instrument(skip_all)]
pub fn stop_broadcast(config: &ExtensionConfig) -> anyhow::Result<usize> {
    use broadcast_session::{NotificationBus, UnixNotificationBus, STOP_BROADCAST_NOTIFICATION};

    let bus = UnixNotificationBus::new(&config.notification_dir);
    let reached = bus
        .post(STOP_BROADCAST_NOTIFICATION)
        .context("posting stop notification")?;
    info!(reached, "Stop notification posted");
    Ok(reached)
}

#[cfg(not(unix))]
pub fn stop_broadcast(_config: &ExtensionConfig) -> anyhow::Result<usize> {
    anyhow::bail!("cross-process notifications need Unix domain sockets")
}

/// Summarise the tracks of a recording.
pub fn inspect_recording(path: &Path) -> anyhow::Result<ContainerSummary> {
    inspect_container(path).with_context(|| format!("inspecting {}", path.display()))
}

/// Read the microphone flag of the last session, clearing it if asked.
#[instrument(skip(config))]
pub fn last_microphone(config: &ExtensionConfig, clear: bool) -> anyhow::Result<Option<bool>> {
    let record = SharedDefaults::open(config.shared_record_path()?);
    let value = if clear {
        record.take_bool(MIC_RECORD_KEY)
    } else {
        record.bool(MIC_RECORD_KEY)
    };
    value.with_context(|| format!("reading {}", record.path().display()))
}
