use crate::error::{RenderError, Result};
use democut_core::audio::{MixGraph, MIX_OUTPUT_LABEL};
use democut_core::config::ToolPaths;
use democut_core::types::TimeMs;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lines of ffmpeg stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// How the filter text is handed to ffmpeg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterSpec {
    /// `-filter_complex`, for graphs with labelled pads.
    Complex(String),
    /// `-vf`, for a single-input video chain.
    Video(String),
}

/// A compiled render plan ready for ffmpeg execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPlan {
    pub inputs: Vec<PathBuf>,
    pub filter: FilterSpec,
    /// Stream selectors passed as `-map`.
    pub maps: Vec<String>,
    pub output_args: Vec<String>,
    pub output_path: PathBuf,
}

impl RenderPlan {
    /// Mix the compiled audio graph under the untouched video stream.
    pub fn audio_mix(video: &Path, graph: &MixGraph, output: &Path) -> Self {
        let mut inputs = vec![video.to_path_buf()];
        inputs.extend(graph.input_files.iter().cloned());
        Self {
            inputs,
            filter: FilterSpec::Complex(graph.filter_graph.clone()),
            maps: vec!["0:v".to_string(), format!("[{MIX_OUTPUT_LABEL}]")],
            output_args: vec![
                "-c:v".to_string(),
                "copy".to_string(),
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                "192k".to_string(),
            ],
            output_path: output.to_path_buf(),
        }
    }

    /// Re-encode `input` through a crop/scale chain, keeping its audio.
    pub fn video_filter(input: &Path, filter: String, output: &Path) -> Self {
        Self {
            inputs: vec![input.to_path_buf()],
            filter: FilterSpec::Video(filter),
            maps: Vec::new(),
            output_args: vec![
                "-c:v".to_string(),
                "libx264".to_string(),
                "-crf".to_string(),
                "18".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
                "-c:a".to_string(),
                "copy".to_string(),
            ],
            output_path: output.to_path_buf(),
        }
    }
}

/// Progress update during rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderProgress {
    pub percent: f64,
    pub frame: u64,
    pub fps: f64,
    pub speed: String,
    pub eta_seconds: Option<f64>,
}

impl RenderProgress {
    /// Read an ffmpeg status line such as
    /// `frame=  123 fps= 60 q=28.0 time=00:01:02.05 speed=1.50x`.
    ///
    /// Lines without an encoded `time` are not status lines.
    pub fn from_status_line(line: &str, total_secs: f64) -> Option<Self> {
        let fields = status_fields(line);
        let field = |key: &str| fields.iter().find(|(k, _)| *k == key).map(|&(_, v)| v);

        let encoded = clock_seconds(field("time")?)?;
        let speed = field("speed").unwrap_or_default();
        let factor: f64 = speed.trim_end_matches('x').parse().unwrap_or(0.0);

        let remaining = total_secs - encoded;
        Some(Self {
            percent: if total_secs > 0.0 {
                (encoded / total_secs * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            },
            frame: field("frame").and_then(|v| v.parse().ok()).unwrap_or(0),
            fps: field("fps").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            speed: speed.to_string(),
            eta_seconds: (factor > 0.0 && remaining > 0.0).then(|| remaining / factor),
        })
    }
}

/// Build ffmpeg args from a render plan.
pub fn build_ffmpeg_args(plan: &RenderPlan) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];

    for input in &plan.inputs {
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());
    }

    match &plan.filter {
        FilterSpec::Complex(graph) => {
            args.push("-filter_complex".to_string());
            args.push(graph.clone());
        }
        FilterSpec::Video(chain) => {
            args.push("-vf".to_string());
            args.push(chain.clone());
        }
    }

    for map in &plan.maps {
        args.push("-map".to_string());
        args.push(map.clone());
    }

    args.extend(plan.output_args.clone());

    args.push(plan.output_path.to_string_lossy().to_string());

    args
}

// ---------------------------------------------------------------------------
// RenderInvoker
// ---------------------------------------------------------------------------

/// Runs ffmpeg. One call, one output file; failures are never retried
/// because the output may be partially written.
///
/// Status lines from the running render are published to every receiver
/// handed out by [`RenderInvoker::subscribe`].
#[derive(Debug, Clone)]
pub struct RenderInvoker {
    ffmpeg: PathBuf,
    progress: Arc<watch::Sender<RenderProgress>>,
}

impl Default for RenderInvoker {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl RenderInvoker {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        let (progress, _) = watch::channel(RenderProgress::default());
        Self {
            ffmpeg: ffmpeg.into(),
            progress: Arc::new(progress),
        }
    }

    /// Progress of the current or most recent render.
    pub fn subscribe(&self) -> watch::Receiver<RenderProgress> {
        self.progress.subscribe()
    }

    /// Execute a render plan by spawning ffmpeg.
    ///
    /// `total_duration` scales the published percentage. On a non-zero exit
    /// the tail of stderr is returned in [`RenderError::FfmpegFailed`].
    pub async fn execute(&self, plan: &RenderPlan, total_duration: TimeMs) -> Result<()> {
        use std::process::Stdio;
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::process::Command;

        let args = build_ffmpeg_args(plan);
        info!(output = %plan.output_path.display(), inputs = plan.inputs.len(), "starting ffmpeg");
        debug!(?args, "ffmpeg arguments");

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RenderError::FfmpegNotFound
                } else {
                    RenderError::Io(e)
                }
            })?;
        self.progress.send_replace(RenderProgress::default());

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stderr was not captured"))?;
        // Status updates are separated by carriage returns, log lines by
        // newlines.
        let mut segments = BufReader::new(stderr).split(b'\r');

        let total_secs = total_duration.as_seconds();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

        while let Ok(Some(segment)) = segments.next_segment().await {
            let text = String::from_utf8_lossy(&segment);
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                if let Some(progress) = RenderProgress::from_status_line(line, total_secs) {
                    self.progress.send_replace(progress);
                    continue;
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
        }

        let status = child.wait().await.map_err(RenderError::Io)?;
        if !status.success() {
            let stderr = Vec::from(tail).join("\n");
            error!(%status, output = %plan.output_path.display(), %stderr, "ffmpeg failed");
            return Err(RenderError::FfmpegFailed(format!(
                "ffmpeg exited with {status}\n{stderr}"
            )));
        }

        info!(output = %plan.output_path.display(), "ffmpeg finished");
        Ok(())
    }
}

/// Copy `input` to `output` untouched. Used when there is nothing to render.
pub async fn copy_unchanged(input: &Path, output: &Path) -> Result<PathBuf> {
    if !input.exists() {
        return Err(RenderError::FileNotFound(input.to_path_buf()));
    }
    if input != output {
        tokio::fs::copy(input, output).await?;
    }
    info!(input = %input.display(), output = %output.display(), "copied without re-encoding");
    Ok(output.to_path_buf())
}

/// Names of the configured external tools that cannot be found.
pub fn check_tools(tools: &ToolPaths) -> Vec<String> {
    [&tools.ffmpeg, &tools.ffprobe, &tools.mpv]
        .into_iter()
        .filter(|bin| which::which(bin.as_os_str()).is_err())
        .map(|bin| {
            warn!(tool = %bin.display(), "tool not found");
            bin.display().to_string()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Status line helpers
// ---------------------------------------------------------------------------

/// `key=value` pairs of a status line. ffmpeg pads some values, so
/// `fps= 30` reads the same as `fps=30`.
fn status_fields(line: &str) -> Vec<(&str, &str)> {
    let mut fields = Vec::new();
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let value = if value.is_empty() {
            tokens.next().unwrap_or_default()
        } else {
            value
        };
        fields.push((key, value));
    }
    fields
}

/// `HH:MM:SS.cc` to seconds. `N/A` and other non-clock values are `None`.
fn clock_seconds(clock: &str) -> Option<f64> {
    let mut parts = 0;
    let mut seconds = 0.0;
    for part in clock.split(':') {
        seconds = seconds * 60.0 + part.parse::<f64>().ok()?;
        parts += 1;
    }
    (parts == 3).then_some(seconds)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mix_graph() -> MixGraph {
        MixGraph {
            input_files: vec![PathBuf::from("/audio/music.mp3")],
            filter_graph: "[1:a]adelay=0|0[a0];[a0]amix=inputs=1:duration=longest:dropout_transition=2[aout]"
                .to_string(),
            has_audio: true,
        }
    }

    #[test]
    fn audio_mix_plan_maps_video_and_mix() {
        let plan = RenderPlan::audio_mix(
            Path::new("/tmp/capture.mp4"),
            &mix_graph(),
            Path::new("/tmp/final.mp4"),
        );
        let args = build_ffmpeg_args(&plan);

        assert_eq!(args[0], "-y");
        let inputs: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| *flag == "-i")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(inputs, ["/tmp/capture.mp4", "/audio/music.mp3"]);

        let complex = args.iter().position(|a| a == "-filter_complex").unwrap();
        assert!(args[complex + 1].ends_with("[aout]"));

        let maps: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| *flag == "-map")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(maps, ["0:v", "[aout]"]);
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "copy"));
        assert_eq!(args.last().unwrap(), "/tmp/final.mp4");
    }

    #[test]
    fn video_filter_plan_uses_vf() {
        let plan = RenderPlan::video_filter(
            Path::new("/tmp/in.mp4"),
            "crop=1920:1080:0:0,scale=1920:1080".to_string(),
            Path::new("/tmp/out.mp4"),
        );
        let args = build_ffmpeg_args(&plan);
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-vf" && w[1] == "crop=1920:1080:0:0,scale=1920:1080"));
        assert!(!args.contains(&"-filter_complex".to_string()));
        assert!(!args.contains(&"-map".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "copy"));
    }

    #[test]
    fn status_line_reports_percent_and_eta() {
        let line = "frame=  300 fps= 60 q=23.0 size=    2048kB time=00:00:20.00 bitrate= 838.9kbits/s speed=2.00x";
        let progress = RenderProgress::from_status_line(line, 40.0).unwrap();

        assert_eq!(progress.frame, 300);
        assert_eq!(progress.fps, 60.0);
        assert_eq!(progress.speed, "2.00x");
        assert!((progress.percent - 50.0).abs() < 1e-9);
        // 20s left at twice realtime.
        assert_eq!(progress.eta_seconds, Some(10.0));
    }

    #[test]
    fn log_lines_are_not_status_lines() {
        for line in [
            "",
            "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'capture.mp4':",
            "  Stream #0:0(und): Video: h264 (High)",
            "frame=    0 fps=0.0 q=0.0 size=       0kB time=N/A bitrate=N/A speed=N/A",
        ] {
            assert!(RenderProgress::from_status_line(line, 10.0).is_none(), "{line}");
        }
    }

    #[test]
    fn unknown_total_gives_zero_percent() {
        let line = "frame=   12 fps=24 time=00:00:00.50 speed=0.98x";
        let progress = RenderProgress::from_status_line(line, 0.0).unwrap();
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.eta_seconds, None);
    }

    #[test]
    fn clock_values() {
        assert_eq!(clock_seconds("01:02:03.50"), Some(3_723.5));
        assert_eq!(clock_seconds("00:00:00.00"), Some(0.0));
        assert_eq!(clock_seconds("02:03.50"), None);
        assert_eq!(clock_seconds("N/A"), None);
    }

    #[test]
    fn padded_fields_read_like_compact_ones() {
        let fields = status_fields("frame=   7 fps=25 size=N/A time=00:00:00.28");
        assert_eq!(
            fields,
            [("frame", "7"), ("fps", "25"), ("size", "N/A"), ("time", "00:00:00.28")]
        );
    }

    /// Stand-in ffmpeg that prints two status updates and one log line.
    #[cfg(unix)]
    fn scripted_ffmpeg(dir: &TempDir, exit_code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("ffmpeg");
        let script = format!(
            "#!/bin/sh\n\
             printf 'frame=   30 fps=30 time=00:00:01.00 speed=2.00x\\r' >&2\n\
             printf 'frame=   60 fps=30 time=00:00:02.00 speed=2.00x\\r' >&2\n\
             printf 'encoder gave up\\n' >&2\n\
             exit {exit_code}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subscribers_see_status_updates() {
        let dir = TempDir::new().unwrap();
        let invoker = RenderInvoker::new(scripted_ffmpeg(&dir, 0));
        let progress = invoker.subscribe();
        let plan = RenderPlan::video_filter(
            Path::new("/tmp/in.mp4"),
            "null".to_string(),
            &dir.path().join("out.mp4"),
        );

        invoker.execute(&plan, TimeMs(4_000)).await.unwrap();

        let last = progress.borrow().clone();
        assert_eq!(last.frame, 60);
        assert!((last.percent - 50.0).abs() < 1e-9);
        assert_eq!(last.eta_seconds, Some(1.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_keeps_log_lines_but_not_status_lines() {
        let dir = TempDir::new().unwrap();
        let invoker = RenderInvoker::new(scripted_ffmpeg(&dir, 1));
        let plan = RenderPlan::video_filter(
            Path::new("/tmp/in.mp4"),
            "null".to_string(),
            &dir.path().join("out.mp4"),
        );

        let Err(RenderError::FfmpegFailed(message)) = invoker.execute(&plan, TimeMs(4_000)).await
        else {
            panic!("expected ffmpeg failure");
        };
        assert!(message.contains("encoder gave up"));
        assert!(!message.contains("frame="));
    }

    #[tokio::test]
    async fn copy_unchanged_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mp4");
        let output = dir.path().join("out.mp4");
        std::fs::write(&input, b"\x00\x00\x00\x18ftypmp42 not really a video").unwrap();

        let written = copy_unchanged(&input, &output).await.unwrap();
        assert_eq!(written, output);
        assert_eq!(std::fs::read(&input).unwrap(), std::fs::read(&output).unwrap());
    }

    #[tokio::test]
    async fn copy_unchanged_missing_input() {
        let dir = TempDir::new().unwrap();
        let result = copy_unchanged(&dir.path().join("nope.mp4"), &dir.path().join("out.mp4")).await;
        assert!(matches!(result, Err(RenderError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_reported() {
        let invoker = RenderInvoker::new("/nonexistent/democut-ffmpeg");
        let plan = RenderPlan::video_filter(
            Path::new("/tmp/in.mp4"),
            "null".to_string(),
            Path::new("/tmp/out.mp4"),
        );
        let result = invoker.execute(&plan, TimeMs(1_000)).await;
        assert!(matches!(result, Err(RenderError::FfmpegNotFound)));
    }

    #[test]
    fn check_tools_reports_missing_binaries() {
        let tools = ToolPaths {
            ffmpeg: PathBuf::from("/nonexistent/democut-ffmpeg"),
            ffprobe: PathBuf::from("/nonexistent/democut-ffprobe"),
            mpv: PathBuf::from("/nonexistent/democut-mpv"),
        };
        let missing = check_tools(&tools);
        assert_eq!(missing.len(), 3);
        assert!(missing[0].ends_with("democut-ffmpeg"));
    }
}
