//! Audio source descriptors and the selection policy.
//!
//! Exactly one source is active at a time. Selection is evaluated against the
//! latest settings snapshot at every start request, highest priority first:
//! 1. the microphone, when explicitly enabled
//! 2. the first enabled RTSP entry
//! 3. the first enabled saved VBAN source

use std::fmt;

use crate::config::Settings;

/// Everything needed to open one audio source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    Microphone { device_index: usize },
    Rtsp { url: String, name: String },
    Vban { ip: String, name: String },
}

impl SourceDescriptor {
    /// Stable key identifying this source to the classifier and on the bus.
    pub fn source_id(&self) -> String {
        match self {
            Self::Microphone { device_index } => format!("mic_{}", device_index),
            Self::Rtsp { url, .. } => format!("rtsp_{}", url),
            Self::Vban { ip, .. } => format!("vban_{}", ip),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Microphone { .. } => "microphone",
            Self::Rtsp { .. } => "rtsp",
            Self::Vban { .. } => "vban",
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Microphone { device_index } => write!(f, "microphone #{}", device_index),
            Self::Rtsp { url, name } => write!(f, "RTSP {} ({})", name, url),
            Self::Vban { ip, name } if name.is_empty() => write!(f, "VBAN {}", ip),
            Self::Vban { ip, name } => write!(f, "VBAN {} ({})", name, ip),
        }
    }
}

/// Pick the active source for a new session, or `None` when nothing usable
/// is configured.
pub fn select_source(settings: &Settings) -> Option<SourceDescriptor> {
    if settings.microphone.enabled {
        if let Some(label) = settings.microphone.audio_source.as_deref() {
            log::info!("using microphone source '{}'", label);
        }
        return Some(SourceDescriptor::Microphone {
            device_index: settings.microphone.device_index,
        });
    }

    if let Some(entry) = settings.rtsp.iter().find(|entry| entry.enabled) {
        log::info!("using RTSP source {} ({})", entry.name, entry.url);
        return Some(SourceDescriptor::Rtsp {
            url: entry.url.clone(),
            name: entry.name.clone(),
        });
    }

    if let Some(entry) = settings.saved_vban_sources.iter().find(|entry| entry.enabled) {
        log::info!("using VBAN source {} ({})", entry.name, entry.ip);
        return Some(SourceDescriptor::Vban {
            ip: entry.ip.clone(),
            name: entry.name.clone(),
        });
    }

    if settings.saved_vban_sources.is_empty() {
        log::info!("no VBAN source configured");
    } else {
        log::info!("no saved VBAN source is enabled");
    }
    None
}
