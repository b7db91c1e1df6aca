use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::display::{GridLayout, PresenterBackend, Region, SyncPolicy};
use crate::recovery::BackoffPolicy;

pub mod streams;
pub use streams::{Placement, SourceOptions, StreamDescriptor, TransportMode};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub display: DisplayConfig,
    pub recovery: RecoveryConfig,
    pub source_defaults: SourceDefaults,
    pub decode: DecodeConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub log_level: String,
    /// Upper bound on how long a session takes to notice a stop request.
    pub poll_interval_ms: u64,
    pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub backend: PresenterBackend,
    pub width: u32,
    pub height: u32,
    pub columns: u32,
    /// Fixed row count. Derived from the number of cells when unset.
    pub rows: Option<u32>,
    pub sync: bool,
    pub qos: bool,
    pub force_aspect_ratio: bool,
    /// Native window per stream name, for overlay and composited output.
    pub window_handles: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffProfile {
    #[default]
    Embedded,
    Desktop,
    Fast,
    Custom,
}

impl BackoffProfile {
    /// Base and ceiling of the profile, in milliseconds.
    pub fn bounds_ms(&self) -> (u64, u64) {
        match self {
            BackoffProfile::Embedded | BackoffProfile::Custom => (500, 10_000),
            BackoffProfile::Desktop => (2_000, 30_000),
            BackoffProfile::Fast => (500, 5_000),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub profile: BackoffProfile,
    /// Overrides the profile's base delay.
    pub base_backoff_ms: Option<u64>,
    /// Overrides the profile's ceiling.
    pub max_backoff_ms: Option<u64>,
    pub negotiation_timeout_seconds: u64,
}

impl RecoveryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        let (base, ceiling) = self.profile.bounds_ms();
        BackoffPolicy::new(
            Duration::from_millis(self.base_backoff_ms.unwrap_or(base)),
            Duration::from_millis(self.max_backoff_ms.unwrap_or(ceiling)),
        )
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceDefaults {
    pub transport: TransportMode,
    pub latency_ms: u32,
    pub timeout_seconds: u64,
    pub drop_on_latency: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Ranked H.264 decoder factories, hardware first.
    pub h264: Vec<String>,
    /// Ranked H.265 decoder factories, hardware first.
    pub h265: Vec<String>,
    pub leaky_queue: bool,
    pub convert: bool,
    pub output: Option<OutputFormat>,
}

/// Fixed raw video format the decoded frames are scaled to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    #[serde(default)]
    pub format: Option<String>,
}

impl OutputFormat {
    pub fn caps_string(&self) -> String {
        let mut caps = format!(
            "video/x-raw,width={},height={},framerate={}/1",
            self.width, self.height, self.framerate
        );
        if let Some(format) = &self.format {
            caps.push_str(",format=");
            caps.push_str(format);
        }
        caps
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: Option<TransportMode>,
    pub latency_ms: Option<u32>,
    pub cell: Option<usize>,
    pub rect: Option<Region>,
    pub enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "camera-grid".to_string(),
            log_level: "info".to_string(),
            poll_interval_ms: 200,
            shutdown_timeout_seconds: 10,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: PresenterBackend::Plane,
            width: 1920,
            height: 1080,
            columns: 2,
            rows: None,
            sync: false,
            qos: false,
            force_aspect_ratio: true,
            window_handles: BTreeMap::new(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            profile: BackoffProfile::Embedded,
            base_backoff_ms: None,
            max_backoff_ms: None,
            negotiation_timeout_seconds: 15,
        }
    }
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            transport: TransportMode::Tcp,
            latency_ms: 100,
            timeout_seconds: 5,
            drop_on_latency: true,
        }
    }
}

fn candidates(family: &str) -> Vec<String> {
    ["v4l2sl", "v4l2", "omx", "va", "nv", "d3d11"]
        .iter()
        .map(|prefix| format!("{}{}dec", prefix, family))
        .chain(std::iter::once(format!("avdec_{}", family)))
        .collect()
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            h264: candidates("h264"),
            h265: candidates("h265"),
            leaky_queue: true,
            convert: false,
            output: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            uri: String::new(),
            username: None,
            password: None,
            transport: None,
            latency_ms: None,
            cell: None,
            rect: None,
            enabled: true,
        }
    }
}

impl DisplayConfig {
    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            sync: self.sync,
            qos: self.qos,
            force_aspect_ratio: self.force_aspect_ratio,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.app.shutdown_timeout_seconds)
    }

    /// Grid cell of every stream placed on the grid, explicit cells first and
    /// then the lowest free cells in configuration order.
    fn assign_cells(&self) -> Vec<Option<usize>> {
        let taken: HashSet<usize> = self.streams.iter().filter_map(|s| s.cell).collect();
        let mut next_free = 0;
        self.streams
            .iter()
            .map(|stream| {
                if stream.rect.is_some() {
                    return None;
                }
                if let Some(cell) = stream.cell {
                    return Some(cell);
                }
                while taken.contains(&next_free) {
                    next_free += 1;
                }
                let cell = next_free;
                next_free += 1;
                Some(cell)
            })
            .collect()
    }

    pub fn layout(&self) -> GridLayout {
        let cells = self
            .assign_cells()
            .into_iter()
            .flatten()
            .map(|cell| cell + 1)
            .max()
            .unwrap_or(0);
        let mut layout = GridLayout::for_cells(
            self.display.width,
            self.display.height,
            self.display.columns,
            cells,
        );
        if let Some(rows) = self.display.rows {
            layout.rows = rows.max(1);
        }
        layout
    }

    fn source_options(&self, stream: &StreamConfig) -> SourceOptions {
        let defaults = &self.source_defaults;
        let transport = stream
            .transport
            .or_else(|| TransportMode::from_uri(&stream.uri))
            .unwrap_or(defaults.transport);
        SourceOptions {
            location: stream.uri.clone(),
            user_id: stream.username.clone(),
            user_pw: stream.password.clone(),
            latency_ms: stream.latency_ms.unwrap_or(defaults.latency_ms),
            transport,
            timeout: Duration::from_secs(defaults.timeout_seconds),
            drop_on_latency: defaults.drop_on_latency,
        }
    }

    /// Resolve every configured stream, disabled ones included.
    pub fn descriptors(&self) -> Result<Vec<StreamDescriptor>, String> {
        let layout = self.layout();
        let cells = self.assign_cells();

        self.streams
            .iter()
            .zip(cells)
            .enumerate()
            .map(|(index, (stream, cell))| {
                let (placement, region) = match (stream.rect, cell) {
                    (Some(rect), _) => (Placement::Rect, rect),
                    (None, Some(cell)) => {
                        let region = layout.cell(cell).ok_or_else(|| {
                            format!(
                                "Stream '{}' is placed in cell {} outside the {}x{} grid",
                                stream.name, cell, layout.columns, layout.rows
                            )
                        })?;
                        (Placement::Cell(cell), region)
                    }
                    (None, None) => {
                        return Err(format!("Stream '{}' has no placement", stream.name))
                    }
                };
                Ok(StreamDescriptor {
                    index,
                    name: stream.name.clone(),
                    source: self.source_options(stream),
                    placement,
                    region,
                    enabled: stream.enabled,
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.app.poll_interval_ms == 0 || self.app.poll_interval_ms >= 1000 {
            return Err("poll_interval_ms must be between 1 and 999".to_string());
        }

        if self.display.columns == 0 {
            return Err("display columns must be greater than 0".to_string());
        }
        if self.display.width == 0 || self.display.height == 0 {
            return Err("display width and height must be greater than 0".to_string());
        }

        let policy = self.recovery.policy();
        if policy.base.is_zero() {
            return Err("base backoff must be greater than 0".to_string());
        }
        if policy.base > policy.ceiling {
            return Err(format!(
                "base backoff {}ms exceeds maximum backoff {}ms",
                policy.base.as_millis(),
                policy.ceiling.as_millis()
            ));
        }
        if self.recovery.negotiation_timeout_seconds == 0 {
            return Err("negotiation_timeout_seconds must be greater than 0".to_string());
        }

        if self.decode.h264.is_empty() || self.decode.h265.is_empty() {
            return Err("decoder candidate lists cannot be empty".to_string());
        }

        if self.streams.is_empty() {
            warn!("No streams configured");
        }

        let mut names = HashSet::new();
        let mut cells = HashSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() {
                return Err("stream name cannot be empty".to_string());
            }
            if !names.insert(stream.name.as_str()) {
                return Err(format!("duplicate stream name '{}'", stream.name));
            }
            if stream.uri.is_empty() {
                return Err(format!("stream '{}' has an empty uri", stream.name));
            }
            if !stream.uri.to_ascii_lowercase().starts_with("rtsp") || !stream.uri.contains("://") {
                return Err(format!(
                    "stream '{}' uri '{}' is not an RTSP address",
                    stream.name, stream.uri
                ));
            }
            match (stream.cell, stream.rect) {
                (Some(_), Some(_)) => {
                    return Err(format!(
                        "stream '{}' sets both cell and rect",
                        stream.name
                    ))
                }
                (Some(cell), None) => {
                    if !cells.insert(cell) {
                        return Err(format!("grid cell {} is used twice", cell));
                    }
                }
                (None, Some(rect)) => {
                    if rect.area() == 0 {
                        return Err(format!("stream '{}' has a zero-area rect", stream.name));
                    }
                }
                (None, None) => {}
            }
        }

        let descriptors = self.descriptors()?;
        for (i, a) in descriptors.iter().enumerate() {
            for b in &descriptors[i + 1..] {
                if a.region.overlaps(&b.region) {
                    return Err(format!(
                        "streams '{}' and '{}' overlap on the display",
                        a.name, b.name
                    ));
                }
            }
        }

        if self.display.backend == PresenterBackend::Overlay {
            if let Some(missing) = descriptors
                .iter()
                .filter(|d| d.enabled)
                .find(|d| !self.display.window_handles.contains_key(&d.name))
            {
                return Err(format!(
                    "overlay output needs a window handle for stream '{}'",
                    missing.name
                ));
            }
        }

        Ok(())
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| {
            crate::CameraGridError::ConfigError(format!("Failed to parse configuration: {}", e))
        })?;
        config.validate().map_err(crate::CameraGridError::ConfigError)?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(crate::CameraGridError::ConfigError(format!(
                "Configuration file not found: {:?}\n\
                Please create a camera-grid.toml file or specify the path with --config\n\
                You can use config.example.toml as a template",
                path
            )));
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            crate::CameraGridError::ConfigError(format!(
                "Failed to read configuration file {:?}: {}",
                path, e
            ))
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            crate::CameraGridError::ConfigError(msg) => {
                crate::CameraGridError::ConfigError(format!("{:?}: {}", path, msg))
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TWO_CAMERAS: &str = r#"
[app]
poll_interval_ms = 100

[display]
width = 1280
height = 720
columns = 2

[recovery]
profile = "desktop"

[[streams]]
name = "door"
uri = "rtsp://192.168.1.20:554/stream1"
username = "admin"
password = "secret"

[[streams]]
name = "yard"
uri = "rtspt://192.168.1.21/h265"
latency_ms = 50
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.app.name, "camera-grid");
        assert_eq!(config.app.poll_interval_ms, 200);
        assert_eq!(config.display.columns, 2);
        assert_eq!(config.decode.h264.last().map(String::as_str), Some("avdec_h264"));
        assert_eq!(config.decode.h265[0], "v4l2slh265dec");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(TWO_CAMERAS.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).await.unwrap();
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.app.poll_interval_ms, 100);
        assert_eq!(
            config.recovery.policy(),
            BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let err = Config::from_file(Path::new("/nonexistent/camera-grid.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_descriptors_resolve_sources_and_cells() {
        let config = Config::from_toml(TWO_CAMERAS).unwrap();
        let descriptors = config.descriptors().unwrap();

        let door = &descriptors[0];
        assert_eq!(door.placement, Placement::Cell(0));
        assert_eq!(door.region, Region::new(0, 0, 640, 720));
        assert_eq!(door.source.transport, TransportMode::Tcp);
        assert_eq!(door.source.user_id.as_deref(), Some("admin"));
        assert_eq!(door.source.latency_ms, 100);

        let yard = &descriptors[1];
        assert_eq!(yard.placement, Placement::Cell(1));
        assert_eq!(yard.region, Region::new(640, 0, 640, 720));
        assert_eq!(yard.source.latency_ms, 50);
        assert_eq!(yard.source.transport, TransportMode::Tcp);
    }

    #[test]
    fn test_unplaced_streams_take_free_cells() {
        let mut config = Config::default();
        config.streams = vec![
            StreamConfig {
                name: "a".to_string(),
                uri: "rtsp://a/".to_string(),
                ..Default::default()
            },
            StreamConfig {
                name: "b".to_string(),
                uri: "rtsp://b/".to_string(),
                cell: Some(0),
                ..Default::default()
            },
            StreamConfig {
                name: "c".to_string(),
                uri: "rtsp://c/".to_string(),
                ..Default::default()
            },
        ];
        config.validate().unwrap();

        let cells: Vec<Placement> = config
            .descriptors()
            .unwrap()
            .into_iter()
            .map(|d| d.placement)
            .collect();
        assert_eq!(
            cells,
            vec![Placement::Cell(1), Placement::Cell(0), Placement::Cell(2)]
        );
        assert_eq!(config.layout().rows, 2);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.streams[1].name = "door".to_string();
        assert!(config.validate().unwrap_err().contains("duplicate stream name"));

        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.streams[0].cell = Some(1);
        config.streams[1].cell = Some(1);
        assert!(config.validate().unwrap_err().contains("used twice"));

        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.recovery.profile = BackoffProfile::Custom;
        config.recovery.base_backoff_ms = Some(5000);
        config.recovery.max_backoff_ms = Some(1000);
        assert!(config.validate().unwrap_err().contains("exceeds"));

        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.app.poll_interval_ms = 1000;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.streams[0].uri = "http://camera/".to_string();
        assert!(config.validate().unwrap_err().contains("not an RTSP address"));

        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.decode.h265.clear();
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.display.rows = Some(1);
        config.streams[1].cell = Some(5);
        assert!(config.validate().unwrap_err().contains("outside"));
    }

    #[test]
    fn test_rect_overlap_is_rejected() {
        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.streams[0].rect = Some(Region::new(600, 0, 100, 100));
        assert!(config.validate().unwrap_err().contains("overlap"));

        config.streams[0].rect = Some(Region::new(0, 0, 0, 100));
        assert!(config.validate().unwrap_err().contains("zero-area"));
    }

    #[test]
    fn test_overlay_needs_handles() {
        let mut config = Config::from_toml(TWO_CAMERAS).unwrap();
        config.display.backend = PresenterBackend::Overlay;
        config.display.window_handles.insert("door".to_string(), 0x1c00_0003);
        assert!(config.validate().unwrap_err().contains("yard"));

        config.streams[1].enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_caps_string() {
        let output = OutputFormat {
            width: 640,
            height: 360,
            framerate: 30,
            format: Some("I420".to_string()),
        };
        assert_eq!(
            output.caps_string(),
            "video/x-raw,width=640,height=360,framerate=30/1,format=I420"
        );
    }
}
