use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound for `buffer_duration` and `chunk_duration`, in seconds.
pub const MAX_DURATION_SECS: f64 = 60.0;
/// Upper bound for the debounce `delay`, in seconds.
pub const MAX_DELAY_SECS: f64 = 3600.0;

const DEFAULT_SETTINGS_PATH: &str = "/data/options.json";
const DEFAULT_THRESHOLD: f64 = 0.5;
const DEFAULT_OVERLAP_FACTOR: f64 = 0.8;
const DEFAULT_DELAY_SECS: f64 = 2.0;
const DEFAULT_CHUNK_DURATION_SECS: f64 = 0.5;
const DEFAULT_BUFFER_DURATION_SECS: f64 = 1.0;
const DEFAULT_MQTT_HOST: &str = "localhost";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_CLIENT_ID: &str = "claptrap";
const DEFAULT_MQTT_TOPIC: &str = "claptrap";
const DEFAULT_VBAN_PORT: u16 = 6980;
const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
const DEFAULT_FFPROBE_PATH: &str = "ffprobe";

#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    log_level: Option<String>,
    microphone: Option<MicrophoneFile>,
    global: Option<GlobalFile>,
    rtsp: Option<Vec<RtspFile>>,
    saved_vban_sources: Option<Vec<VbanFile>>,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_client_id: Option<String>,
    mqtt_topic: Option<String>,
    mqtt_use_tls: Option<bool>,
    mqtt_tls_ca_path: Option<PathBuf>,
    ffmpeg_path: Option<String>,
    ffprobe_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MicrophoneFile {
    enabled: Option<bool>,
    audio_source: Option<String>,
    device_index: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct GlobalFile {
    threshold: Option<f64>,
    overlap_factor: Option<f64>,
    delay: Option<f64>,
    chunk_duration: Option<f64>,
    buffer_duration: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RtspFile {
    enabled: Option<bool>,
    url: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct VbanFile {
    enabled: Option<bool>,
    ip: Option<String>,
    name: Option<String>,
    port: Option<u16>,
    stream_name: Option<String>,
}

/// Resolved settings snapshot consumed by the orchestrator and publisher.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: Option<String>,
    pub microphone: MicrophoneSettings,
    pub global: GlobalSettings,
    pub rtsp: Vec<RtspSourceSettings>,
    pub saved_vban_sources: Vec<VbanSourceSettings>,
    pub mqtt: MqttSettings,
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, Default)]
pub struct MicrophoneSettings {
    pub enabled: bool,
    pub audio_source: Option<String>,
    pub device_index: usize,
}

#[derive(Debug, Clone)]
pub struct GlobalSettings {
    pub threshold: f64,
    pub overlap_factor: f64,
    /// Minimum seconds between two detections on the same source.
    pub delay: f64,
    pub chunk_duration: f64,
    pub buffer_duration: f64,
}

#[derive(Debug, Clone)]
pub struct RtspSourceSettings {
    pub enabled: bool,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct VbanSourceSettings {
    pub enabled: bool,
    pub ip: String,
    pub name: String,
    pub port: u16,
    pub stream_name: String,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Base topic; availability is published under `<topic>/status`.
    pub topic: String,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
}

/// External tools used by the RTSP adapter.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl GlobalSettings {
    /// Reject durations the classifier cannot represent.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("global.buffer_duration", self.buffer_duration),
            ("global.chunk_duration", self.chunk_duration),
        ] {
            if !(value > 0.0 && value <= MAX_DURATION_SECS) {
                return Err(anyhow!(
                    "{} must be within (0, {}] seconds, got {}",
                    key,
                    MAX_DURATION_SECS,
                    value
                ));
            }
        }
        if !(0.0..=MAX_DELAY_SECS).contains(&self.delay) {
            return Err(anyhow!(
                "global.delay must be within [0, {}] seconds, got {}",
                MAX_DELAY_SECS,
                self.delay
            ));
        }
        Ok(())
    }
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            overlap_factor: DEFAULT_OVERLAP_FACTOR,
            delay: DEFAULT_DELAY_SECS,
            chunk_duration: DEFAULT_CHUNK_DURATION_SECS,
            buffer_duration: DEFAULT_BUFFER_DURATION_SECS,
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_MQTT_HOST.to_string(),
            port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            topic: DEFAULT_MQTT_TOPIC.to_string(),
            use_tls: false,
            tls_ca_path: None,
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: DEFAULT_FFMPEG_PATH.to_string(),
            ffprobe_path: DEFAULT_FFPROBE_PATH.to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Infallible: every field of an empty file falls back to a default.
        Self::from_file(SettingsFile::default())
    }
}

impl Settings {
    /// Load settings from `CLAPTRAP_SETTINGS` (or the add-on default path),
    /// then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CLAPTRAP_SETTINGS")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
        Self::load_from(&path)
    }

    /// Load settings from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let file_cfg = if path.exists() {
            read_settings_file(path)?
        } else {
            log::warn!(
                "settings file {} not found, using defaults",
                path.display()
            );
            SettingsFile::default()
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a settings document without touching the environment.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: SettingsFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid settings: {}", e))?;
        let mut cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SettingsFile) -> Self {
        let microphone = file
            .microphone
            .map(|mic| MicrophoneSettings {
                enabled: mic.enabled.unwrap_or(false),
                audio_source: mic.audio_source,
                device_index: mic.device_index.unwrap_or(0),
            })
            .unwrap_or_default();

        let defaults = GlobalSettings::default();
        let global = file
            .global
            .map(|g| GlobalSettings {
                threshold: g.threshold.unwrap_or(defaults.threshold),
                overlap_factor: g.overlap_factor.unwrap_or(defaults.overlap_factor),
                delay: g.delay.unwrap_or(defaults.delay),
                chunk_duration: g.chunk_duration.unwrap_or(defaults.chunk_duration),
                buffer_duration: g.buffer_duration.unwrap_or(defaults.buffer_duration),
            })
            .unwrap_or(defaults);

        let rtsp = file
            .rtsp
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let Some(url) = entry.url.filter(|u| !u.trim().is_empty()) else {
                    log::warn!("skipping RTSP entry without url");
                    return None;
                };
                Some(RtspSourceSettings {
                    enabled: entry.enabled.unwrap_or(false),
                    name: entry.name.unwrap_or_else(|| url.clone()),
                    url,
                })
            })
            .collect();

        let saved_vban_sources = file
            .saved_vban_sources
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let Some(ip) = entry.ip.filter(|ip| !ip.trim().is_empty()) else {
                    log::warn!("skipping VBAN entry without ip");
                    return None;
                };
                Some(VbanSourceSettings {
                    enabled: entry.enabled.unwrap_or(true),
                    name: entry.name.unwrap_or_default(),
                    port: entry.port.unwrap_or(DEFAULT_VBAN_PORT),
                    stream_name: entry.stream_name.unwrap_or_default(),
                    ip,
                })
            })
            .collect();

        let mqtt = MqttSettings {
            host: file
                .mqtt_host
                .unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port: file.mqtt_port.unwrap_or(DEFAULT_MQTT_PORT),
            username: file.mqtt_username.filter(|u| !u.is_empty()),
            password: file.mqtt_password.filter(|p| !p.is_empty()),
            client_id: file
                .mqtt_client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            topic: file
                .mqtt_topic
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            use_tls: file.mqtt_use_tls.unwrap_or(false),
            tls_ca_path: file.mqtt_tls_ca_path,
        };

        let tools = ToolSettings {
            ffmpeg_path: file
                .ffmpeg_path
                .unwrap_or_else(|| DEFAULT_FFMPEG_PATH.to_string()),
            ffprobe_path: file
                .ffprobe_path
                .unwrap_or_else(|| DEFAULT_FFPROBE_PATH.to_string()),
        };

        Self {
            log_level: file.log_level,
            microphone,
            global,
            rtsp,
            saved_vban_sources,
            mqtt,
            tools,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("CLAPTRAP_MQTT_HOST") {
            if !host.trim().is_empty() {
                self.mqtt.host = host;
            }
        }
        if let Ok(port) = std::env::var("CLAPTRAP_MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("CLAPTRAP_MQTT_PORT must be a port number"))?;
        }
        if let Ok(user) = std::env::var("CLAPTRAP_MQTT_USERNAME") {
            if !user.trim().is_empty() {
                self.mqtt.username = Some(user);
            }
        }
        if let Ok(password) = std::env::var("CLAPTRAP_MQTT_PASSWORD") {
            if !password.is_empty() {
                self.mqtt.password = Some(password);
            }
        }
        if let Ok(level) = std::env::var("CLAPTRAP_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log_level = Some(level);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.global.validate()?;
        if self.mqtt.port == 0 {
            return Err(anyhow!("mqtt_port must be greater than zero"));
        }
        self.mqtt.client_id = self.mqtt.client_id.trim().to_string();
        if self.mqtt.client_id.is_empty() {
            return Err(anyhow!("mqtt_client_id must not be empty"));
        }
        Ok(())
    }
}

fn read_settings_file(path: &Path) -> Result<SettingsFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read settings file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid settings file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() -> Result<()> {
        let cfg = Settings::from_json("{}")?;
        assert!(!cfg.microphone.enabled);
        assert_eq!(cfg.microphone.device_index, 0);
        assert_eq!(cfg.global.threshold, DEFAULT_THRESHOLD);
        assert_eq!(cfg.global.overlap_factor, DEFAULT_OVERLAP_FACTOR);
        assert_eq!(cfg.mqtt.host, "localhost");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.client_id, "claptrap");
        assert!(cfg.rtsp.is_empty());
        assert!(cfg.saved_vban_sources.is_empty());
        Ok(())
    }

    #[test]
    fn null_sections_fall_back_to_defaults() -> Result<()> {
        let cfg = Settings::from_json(
            r#"{ "microphone": null, "global": null, "rtsp": null, "saved_vban_sources": null }"#,
        )?;
        assert!(!cfg.microphone.enabled);
        assert_eq!(cfg.global.delay, DEFAULT_DELAY_SECS);
        Ok(())
    }

    #[test]
    fn vban_entries_default_to_enabled_and_rtsp_to_disabled() -> Result<()> {
        let cfg = Settings::from_json(
            r#"{
                "rtsp": [{ "url": "rtsp://cam" }],
                "saved_vban_sources": [{ "ip": "10.0.0.5", "name": "desk" }]
            }"#,
        )?;
        assert!(!cfg.rtsp[0].enabled);
        assert_eq!(cfg.rtsp[0].name, "rtsp://cam");
        assert!(cfg.saved_vban_sources[0].enabled);
        assert_eq!(cfg.saved_vban_sources[0].port, DEFAULT_VBAN_PORT);
        Ok(())
    }

    #[test]
    fn entries_without_address_are_skipped() -> Result<()> {
        let cfg = Settings::from_json(
            r#"{
                "rtsp": [{ "enabled": true }, { "enabled": true, "url": "" }],
                "saved_vban_sources": [{ "name": "no ip" }]
            }"#,
        )?;
        assert!(cfg.rtsp.is_empty());
        assert!(cfg.saved_vban_sources.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_durations() {
        for raw in [
            r#"{ "global": { "delay": 1e20 } }"#,
            r#"{ "global": { "delay": -1 } }"#,
            r#"{ "global": { "buffer_duration": 1e30 } }"#,
            r#"{ "global": { "buffer_duration": 0 } }"#,
            r#"{ "global": { "chunk_duration": 120 } }"#,
        ] {
            let err = Settings::from_json(raw).unwrap_err();
            assert!(err.to_string().contains("global."), "{raw}: {err}");
        }
    }

    #[test]
    fn accepts_boundary_durations() -> Result<()> {
        let cfg = Settings::from_json(
            r#"{ "global": { "delay": 0, "buffer_duration": 60, "chunk_duration": 60 } }"#,
        )?;
        assert_eq!(cfg.global.delay, 0.0);
        assert_eq!(cfg.global.buffer_duration, MAX_DURATION_SECS);
        Ok(())
    }

    #[test]
    fn rejects_empty_client_id() {
        let err = Settings::from_json(r#"{ "mqtt_client_id": "  " }"#).unwrap_err();
        assert!(format!("{err}").contains("mqtt_client_id"));
    }

    #[test]
    fn rejects_malformed_document() {
        assert!(Settings::from_json("{ not json").is_err());
    }
}
