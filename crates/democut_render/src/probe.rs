use democut_core::types::{Resolution, TimeMs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{RenderError, Result};

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// What the rest of the pipeline needs to know about a media file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_ms: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub has_audio: bool,
}

impl MediaInfo {
    pub fn duration(&self) -> TimeMs {
        TimeMs(self.duration_ms)
    }

    pub fn resolution(&self) -> Option<Resolution> {
        match (self.width, self.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(Resolution { width, height })
            }
            _ => None,
        }
    }
}

pub trait MediaProbe {
    fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

/// Probes media with the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    binary: PathBuf,
}

impl Ffprobe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for Ffprobe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl MediaProbe for Ffprobe {
    fn probe(&self, path: &Path) -> Result<MediaInfo> {
        if !path.exists() {
            return Err(RenderError::FileNotFound(path.to_path_buf()));
        }

        let output = std::process::Command::new(&self.binary)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .map_err(|e| RenderError::FfprobeExec(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::FfprobeFailed(stderr.into_owned()));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        Ok(parse_probe_output(&probe))
    }
}

/// Per-session memo of probe results.
///
/// Failures are absorbed here: a file that cannot be probed is remembered
/// as zero-length with no streams.
#[derive(Debug, Default)]
pub struct ProbeCache {
    entries: HashMap<PathBuf, MediaInfo>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, probe: &dyn MediaProbe, path: &Path) -> MediaInfo {
        if let Some(info) = self.entries.get(path) {
            return *info;
        }
        let info = match probe.probe(path) {
            Ok(info) => {
                debug!(path = %path.display(), duration_ms = info.duration_ms, "probed");
                info
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "probe failed, treating as zero length");
                MediaInfo::default()
            }
        };
        self.entries.insert(path.to_path_buf(), info);
        info
    }

    pub fn duration(&mut self, probe: &dyn MediaProbe, path: &Path) -> TimeMs {
        self.info(probe, path).duration()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn parse_probe_output(probe: &FfprobeOutput) -> MediaInfo {
    let video_stream = probe.streams.iter().find(|s| s.codec_type == "video");
    let has_audio = probe.streams.iter().any(|s| s.codec_type == "audio");

    let duration_ms = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| TimeMs::from_seconds(secs).0)
        .unwrap_or(0);

    MediaInfo {
        duration_ms,
        width: video_stream.and_then(|s| s.width),
        height: video_stream.and_then(|s| s.height),
        has_audio,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
