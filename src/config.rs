use crate::util::{de_duration_millis, de_duration_sec};
use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub apple_id: Option<String>,
    pub mount_point: PathBuf,
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub cookie_dir: PathBuf,
    pub cache: CacheConfig,
    pub adapter: AdapterConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Files at or above this size are materialized chunk by chunk.
    pub partial_threshold: u64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Folders whose last listing is older than this get a refresh queued
    /// on readdir.
    #[serde(deserialize_with = "de_duration_sec")]
    pub readdir_stale_after: Duration,
    /// Bound on the readdir wait for a never-listed folder.
    #[serde(deserialize_with = "de_duration_sec")]
    pub first_sync_wait: Duration,
    /// Bound on the read wait for content being fetched.
    #[serde(deserialize_with = "de_duration_sec")]
    pub read_wait: Duration,
    #[serde(deserialize_with = "de_duration_millis")]
    pub poll_interval: Duration,
    /// Queue an ensure_latest when a fully cached file is opened.
    pub refresh_on_open: bool,
    /// Caller identities that must never trigger a remote fetch.
    pub process_blacklist: Vec<String>,
    /// Display-name prefixes that never trigger an upload on release.
    pub temp_name_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(deserialize_with = "de_duration_sec")]
    pub base_backoff: Duration,
    pub max_retries: i64,
    /// Sleep when the queue is drained.
    #[serde(deserialize_with = "de_duration_sec")]
    pub idle_delay: Duration,
    /// Sleep after a failed session (re-)establishment.
    #[serde(deserialize_with = "de_duration_sec")]
    pub reconnect_delay: Duration,
    /// A parent listed within this window is trusted for ensure_latest
    /// without another remote round trip.
    #[serde(deserialize_with = "de_duration_sec")]
    pub metadata_fresh_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            apple_id: None,
            mount_point: home.join("iCloud"),
            db_path: data.join("orchard/orchard.db"),
            cache_dir: cache.join("orchard/objects"),
            cookie_dir: data.join("orchard/icloud_session"),
            cache: CacheConfig::default(),
            adapter: AdapterConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            partial_threshold: 32 << 20,
            chunk_size: 8 << 20,
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            readdir_stale_after: Duration::from_secs(60),
            first_sync_wait: Duration::from_secs(10),
            read_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            refresh_on_open: true,
            process_blacklist: [
                "nautilus",
                "nemo",
                "caja",
                "thunar",
                "dolphin",
                "konqueror",
                "pcmanfm",
                "tracker-miner-f",
                "tracker-extract",
                "baloo_file",
                "updatedb",
                "locate",
                "gnome-shell",
                "systemd-user",
                "ffmpeg",
                "ffprobe",
                "totem",
                "evince-thumbnailer",
                "gstreamer",
                "gst-launch",
                "xdg-desktop-portal",
                "gnome-desktop-thumbnailer",
                "tumbler",
                "ffmpegthumbnailer",
                "glycin-thumbnailer",
                "xreader-thumbnailer",
                "gdk-pixbuf-thumbnailer",
                "mate-thumbnailer",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            temp_name_prefixes: [".goutputstream-", ".~", "~$", ".#", ".Trash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(30),
            max_retries: 5,
            idle_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            metadata_fresh_window: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("orchard/config.toml")
    }

    /// Load the TOML config file if it exists, falling back to defaults for
    /// everything it leaves out.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let cfg = config::Config::builder()
            .add_source(config::File::from(path.to_owned()))
            .build()
            .with_context(|| format!("cannot read config at {}", path.display()))?;
        cfg.try_deserialize()
            .with_context(|| format!("invalid config at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/orchard.toml")).unwrap();
        assert_eq!(cfg.cache.chunk_size, 8 << 20);
        assert_eq!(cfg.sync.max_retries, 5);
        assert!(cfg.adapter.process_blacklist.iter().any(|p| p == "nautilus"));
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "apple_id = \"user@example.com\"").unwrap();
        writeln!(f, "[adapter]").unwrap();
        writeln!(f, "read_wait = 5").unwrap();
        writeln!(f, "[cache]").unwrap();
        writeln!(f, "chunk_size = 1048576").unwrap();
        drop(f);

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.apple_id.as_deref(), Some("user@example.com"));
        assert_eq!(cfg.adapter.read_wait, Duration::from_secs(5));
        assert_eq!(cfg.cache.chunk_size, 1 << 20);
        // untouched sections keep their defaults
        assert_eq!(cfg.sync.base_backoff, Duration::from_secs(30));
    }
}
