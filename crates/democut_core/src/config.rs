use crate::error::{CoreError, Result};
use crate::types::*;
use crate::viewport::{DEFAULT_FPS, DEFAULT_KEYFRAME_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Channels and tracks
// ---------------------------------------------------------------------------

/// Partial channel definition; unset fields fall back to
/// [`Channel::default_for`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub role: Option<ChannelRole>,
    pub output: Option<ChannelOutput>,
    pub volume: Option<f64>,
    pub pan: Option<f64>,
}

impl ChannelConfig {
    pub fn resolve(&self, id: ChannelId) -> Channel {
        let default = Channel::default_for(id);
        Channel {
            id,
            role: self.role.unwrap_or(default.role),
            output: self.output.unwrap_or(default.output),
            volume: self.volume.unwrap_or(default.volume).clamp(0.0, 1.0),
            pan: self.pan.unwrap_or(default.pan).clamp(-1.0, 1.0),
        }
    }
}

/// Resolve a channel map, always including the narration channel.
pub fn resolve_channels(
    configs: &BTreeMap<ChannelId, ChannelConfig>,
) -> Result<BTreeMap<ChannelId, Channel>> {
    let mut channels = BTreeMap::new();
    channels.insert(NARRATION_CHANNEL, Channel::default_for(NARRATION_CHANNEL));
    for (&id, config) in configs {
        if id == 0 {
            return Err(CoreError::InvalidChannel(id));
        }
        channels.insert(id, config.resolve(id));
    }
    Ok(channels)
}

/// A track scheduled up front instead of played by the scene.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTrack {
    pub file: String,
    pub channel: ChannelId,
    #[serde(default)]
    pub start_at: TimeMs,
    #[serde(default)]
    pub fade_in: TimeMs,
    #[serde(default)]
    pub fade_out: TimeMs,
    #[serde(default, rename = "loop")]
    pub loop_track: bool,
    #[serde(default)]
    pub volume: Option<f64>,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSettings {
    /// Floor for the fade applied when a new track replaces a playing one.
    pub crossfade_min: TimeMs,
    /// Extra wait after live playback before the scene continues.
    pub settle_margin: TimeMs,
    pub default_stop_fade: TimeMs,
    pub dropout_transition_s: f64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            crossfade_min: TimeMs(500),
            settle_margin: TimeMs(200),
            default_stop_fade: TimeMs(500),
            dropout_transition_s: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewportSettings {
    pub fps: f64,
    pub keyframe_interval: usize,
    /// Used when the source resolution cannot be probed.
    pub default_resolution: Resolution,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        preset_1080p()
    }
}

/// External binaries, by name or path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub mpv: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            mpv: PathBuf::from("mpv"),
        }
    }
}

/// A viewport program as handed over by the scene runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewportConfig {
    pub commands: Vec<ViewportCommand>,
}

impl ViewportConfig {
    pub fn is_noop(&self) -> bool {
        self.commands.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Everything a recording session needs before playback starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub base_path: PathBuf,
    pub channels: BTreeMap<ChannelId, ChannelConfig>,
    pub tracks: Vec<ScheduledTrack>,
    pub audio: AudioSettings,
    pub viewport: ViewportSettings,
    pub tools: ToolPaths,
}

impl SessionConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.viewport.fps <= 0.0 {
            return Err(CoreError::InvalidConfig("viewport fps must be positive".into()));
        }
        if self.viewport.keyframe_interval == 0 {
            return Err(CoreError::InvalidConfig(
                "keyframe interval must be at least one frame".into(),
            ));
        }
        if self.channels.contains_key(&0) {
            return Err(CoreError::InvalidChannel(0));
        }
        if let Some(track) = self.tracks.iter().find(|t| t.channel == 0) {
            return Err(CoreError::InvalidConfig(format!(
                "track {} is scheduled on channel 0",
                track.file
            )));
        }
        Ok(())
    }

    pub fn resolved_channels(&self) -> Result<BTreeMap<ChannelId, Channel>> {
        resolve_channels(&self.channels)
    }

    /// Save as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load and validate a JSON session file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: SessionConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }
}

/// 1920x1080 at 30fps.
pub fn preset_1080p() -> ViewportSettings {
    ViewportSettings {
        fps: DEFAULT_FPS,
        keyframe_interval: DEFAULT_KEYFRAME_INTERVAL,
        default_resolution: Resolution {
            width: 1920,
            height: 1080,
        },
    }
}

/// 1280x720 at 30fps.
pub fn preset_720p() -> ViewportSettings {
    ViewportSettings {
        default_resolution: Resolution {
            width: 1280,
            height: 720,
        },
        ..preset_1080p()
    }
}

/// 3840x2160 at 30fps.
pub fn preset_4k() -> ViewportSettings {
    ViewportSettings {
        default_resolution: Resolution {
            width: 3840,
            height: 2160,
        },
        ..preset_1080p()
    }
}
