pub mod capture;
pub mod display;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod state;
pub mod utils;
pub mod vision;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

pub use capture::{Frame, PixelFormat};
pub use error::{ConfigError, InvalidConfigError};
pub use event::StreamEvent;
pub use pipeline::{Orchestrator, StreamResources, StreamSupervisor};
pub use state::{StreamPhase, StreamRuntimeState};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
    pub display: DisplayConfig,
    pub streams: Vec<StreamEntry>,
}

impl Config {
    /// Layer an optional TOML file under `VIGIL__`-prefixed environment
    /// variables, e.g. `VIGIL__PIPELINE__MAX_RETRIES=3`.
    ///
    /// Without an explicit path, `vigil.toml` in the working directory is
    /// used if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("vigil").required(false),
        };
        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames held per stream between capture and processing
    pub buffer_capacity: usize,
    /// Consecutive failures that mark a stream FAILED
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound on how long a task goes without checking for shutdown
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Largest MJPEG frame accepted before the connection is reset
    pub max_frame_bytes: usize,
}

impl PipelineConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            max_retries: 5,
            retry_backoff_ms: 2_000,
            poll_interval_ms: 200,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub cascade: PathBuf,
    pub scale_factor: f64,
    pub min_neighbors: i32,
    /// Smallest face edge in pixels
    pub min_size: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cascade: PathBuf::from("haarcascade_frontalface_default.xml"),
            scale_factor: 1.3,
            min_neighbors: 5,
            min_size: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub model: PathBuf,
    pub identity_map: PathBuf,
    /// Distances below this are matches; lower is better
    pub threshold: f64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("trainer/trainer.yml"),
            identity_map: PathBuf::from("faces.txt"),
            threshold: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBackend {
    /// Log frames only
    Headless,
    /// Periodically write the latest annotated frame per stream as JPEG
    Snapshot,
    /// One SDL2 window per stream
    Sdl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub backend: DisplayBackend,
    pub snapshot_dir: PathBuf,
    /// Write every n-th frame
    pub snapshot_every: u64,
    /// TrueType/OpenType font for overlay text; the bundled DejaVu Sans Mono when unset
    pub font: Option<PathBuf>,
    pub font_size: f32,
    /// Annotated frames queued for the display thread across all streams
    pub queue_depth: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: DisplayBackend::Headless,
            snapshot_dir: PathBuf::from("snapshots"),
            snapshot_every: 30,
            font: None,
            font_size: 24.0,
            queue_depth: 8,
        }
    }
}

/// One stream as written in the configuration, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub url: String,
    pub name: String,
}

impl StreamEntry {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }
}

/// A validated stream: named, with a URL that has a scheme and a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub url: Url,
    pub name: Arc<str>,
}

impl StreamConfig {
    pub fn new(url: &str, name: &str) -> Result<Self, InvalidConfigError> {
        let invalid = |reason: String| InvalidConfigError {
            name: name.to_string(),
            url: url.to_string(),
            reason,
        };

        if name.trim().is_empty() {
            return Err(invalid("stream name is empty".into()));
        }
        let parsed = Url::parse(url).map_err(|e| invalid(format!("not a URL: {e}")))?;
        match parsed.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(invalid("URL has no host".into())),
        }

        Ok(Self {
            url: parsed,
            name: Arc::from(name),
        })
    }
}

impl TryFrom<&StreamEntry> for StreamConfig {
    type Error = InvalidConfigError;

    fn try_from(entry: &StreamEntry) -> Result<Self, Self::Error> {
        Self::new(&entry.url, &entry.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_stream_config_accepts_scheme_and_host() {
        for url in ["rtsp://a/1", "http://b/2", "rtsp://user:pw@10.0.0.5:554/stream2"] {
            let cfg = StreamConfig::new(url, "cam").unwrap();
            assert_eq!(&*cfg.name, "cam");
        }
    }

    #[test]
    fn test_stream_config_rejects_malformed() {
        for url in ["not-a-url", "", "file:///tmp/video.mp4", "http://", "/relative/path"] {
            let err = StreamConfig::new(url, "cam").unwrap_err();
            assert_eq!(err.name, "cam");
            assert_eq!(err.url, url);
        }
        assert!(StreamConfig::new("http://b/2", "  ").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pipeline.buffer_capacity, 10);
        assert_eq!(config.pipeline.max_retries, 5);
        assert_eq!(config.pipeline.retry_backoff(), Duration::from_secs(2));
        assert_eq!(config.pipeline.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.recognition.threshold, 100.0);
        assert_eq!(config.detection.scale_factor, 1.3);
        assert_eq!(config.display.backend, DisplayBackend::Headless);
        assert!(config.streams.is_empty());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[pipeline]
max_retries = 3
buffer_capacity = 4

[display]
backend = "snapshot"

[[streams]]
url = "http://singapore:9081"
name = "Camera 1"

[[streams]]
url = "rtsp://d09/stream"
name = "Camera 3"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.pipeline.buffer_capacity, 4);
        assert_eq!(config.pipeline.retry_backoff_ms, 2_000);
        assert_eq!(config.display.backend, DisplayBackend::Snapshot);
        assert_eq!(
            config.streams,
            vec![
                StreamEntry::new("http://singapore:9081", "Camera 1"),
                StreamEntry::new("rtsp://d09/stream", "Camera 3"),
            ]
        );
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some(Path::new("/no/such/vigil.toml"))).is_err());
    }
}
