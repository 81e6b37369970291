use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// TimeMs
// ---------------------------------------------------------------------------

/// Milliseconds since recording start.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct TimeMs(pub u64);

impl TimeMs {
    pub const ZERO: Self = Self(0);

    pub fn from_seconds(s: f64) -> Self {
        Self((s.max(0.0) * 1_000.0).round() as u64)
    }

    pub fn as_seconds(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Add for TimeMs {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for TimeMs {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for TimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0 % 1_000;
        let total_secs = self.0 / 1_000;
        let secs = total_secs % 60;
        let total_mins = total_secs / 60;
        let mins = total_mins % 60;
        let hours = total_mins / 60;
        write!(f, "{:02}:{:02}:{:02}.{:03}", hours, mins, secs, ms)
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

pub type ChannelId = u32;

/// Channel reserved for live narration.
pub const NARRATION_CHANNEL: ChannelId = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelRole {
    Music,
    Narration,
    Sfx,
    Ambient,
    Custom,
}

/// Where a channel's audio goes while recording.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelOutput {
    VirtualMic,
    Monitor,
    Both,
    PostOnly,
}

impl ChannelOutput {
    /// Played through the live sink during capture.
    pub fn is_live(self) -> bool {
        !matches!(self, ChannelOutput::PostOnly)
    }

    /// Mixed in post. Pure virtual-mic audio is already in the captured
    /// video and must not be mixed a second time.
    pub fn is_post_mixed(self) -> bool {
        !matches!(self, ChannelOutput::VirtualMic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub role: ChannelRole,
    pub output: ChannelOutput,
    pub volume: f64,
    pub pan: f64,
}

impl Channel {
    /// Default definition for a channel nobody configured.
    pub fn default_for(id: ChannelId) -> Self {
        if id == NARRATION_CHANNEL {
            Self {
                id,
                role: ChannelRole::Narration,
                output: ChannelOutput::VirtualMic,
                volume: 1.0,
                pan: 0.0,
            }
        } else {
            Self {
                id,
                role: ChannelRole::Custom,
                output: ChannelOutput::PostOnly,
                volume: 1.0,
                pan: 0.0,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AudioEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AudioEventKind {
    #[serde(rename_all = "camelCase")]
    Play {
        file: PathBuf,
        fade_in: TimeMs,
        fade_out: TimeMs,
        #[serde(rename = "loop")]
        loop_track: bool,
        volume: Option<f64>,
        audio_duration: TimeMs,
    },
    #[serde(rename_all = "camelCase")]
    Stop { fade_out: TimeMs },
    #[serde(rename_all = "camelCase")]
    Volume { volume: f64, duration: TimeMs },
}

/// Something that happened on a channel, stamped with recording time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioEvent {
    pub channel: ChannelId,
    pub time: TimeMs,
    #[serde(flatten)]
    pub kind: AudioEventKind,
}

/// What is currently playing on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTrack {
    pub file: PathBuf,
    pub start_time: TimeMs,
    pub duration: TimeMs,
    pub fade_in: TimeMs,
    pub fade_out: TimeMs,
    pub volume: Option<f64>,
}

// ---------------------------------------------------------------------------
// Viewport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PanTarget {
    Cursor,
    Point(Point),
}

/// A viewport instruction. Times are seconds from clip start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewportCommand {
    Follow {
        from: f64,
        to: f64,
        #[serde(default)]
        zoom: Option<f64>,
    },
    Zoom {
        level: f64,
        at: f64,
        #[serde(default)]
        duration: f64,
        #[serde(default)]
        center: Option<Point>,
    },
    Pan {
        to: PanTarget,
        at: f64,
        #[serde(default)]
        duration: f64,
    },
    Hold {
        from: f64,
        to: f64,
    },
}

impl ViewportCommand {
    pub fn start(&self) -> f64 {
        match self {
            ViewportCommand::Follow { from, .. } => *from,
            ViewportCommand::Zoom { at, .. } => *at,
            ViewportCommand::Pan { at, .. } => *at,
            ViewportCommand::Hold { from, .. } => *from,
        }
    }

    pub fn end(&self) -> f64 {
        match self {
            ViewportCommand::Follow { to, .. } => *to,
            ViewportCommand::Zoom { at, duration, .. } => at + duration.max(0.0),
            ViewportCommand::Pan { at, duration, .. } => at + duration.max(0.0),
            ViewportCommand::Hold { to, .. } => *to,
        }
    }
}

/// Zoom and view center at one instant, in source-video pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewportState {
    pub time: f64,
    pub zoom: f64,
    pub center_x: f64,
    pub center_y: f64,
}

impl ViewportState {
    pub fn center(&self) -> Point {
        Point {
            x: self.center_x,
            y: self.center_y,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CursorSample {
    /// Milliseconds from clip start.
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn center(&self) -> Point {
        Point {
            x: self.width as f64 / 2.0,
            y: self.height as f64 / 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
