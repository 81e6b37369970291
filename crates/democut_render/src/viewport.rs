use crate::error::Result;
use crate::invoke::{copy_unchanged, RenderInvoker, RenderPlan};
use crate::probe::{MediaInfo, MediaProbe};
use democut_core::config::{ViewportConfig, ViewportSettings};
use democut_core::types::{CursorSample, Resolution, TimeMs};
use democut_core::viewport::{build_timeline, compile_to_filter_expression};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Render `input` through the viewport program in `config`.
///
/// An empty program copies the input byte for byte. Otherwise the source is
/// probed for resolution and duration (falling back to `resolution`, then
/// `settings.default_resolution`), the per-frame timeline is compiled to a
/// crop/scale chain and ffmpeg re-encodes the video.
#[allow(clippy::too_many_arguments)]
pub async fn apply_viewport<P: MediaProbe + ?Sized>(
    invoker: &RenderInvoker,
    probe: &P,
    input: &Path,
    output: &Path,
    cursor: &[CursorSample],
    config: &ViewportConfig,
    settings: &ViewportSettings,
    resolution: Option<Resolution>,
) -> Result<PathBuf> {
    if config.is_noop() {
        return copy_unchanged(input, output).await;
    }

    let media = probe.probe(input).unwrap_or_else(|e| {
        warn!(input = %input.display(), error = %e, "probe failed, using defaults");
        MediaInfo::default()
    });
    let resolution = resolution
        .or_else(|| media.resolution())
        .unwrap_or(settings.default_resolution);

    let mut duration = media.duration().as_seconds();
    if duration <= 0.0 {
        duration = config
            .commands
            .iter()
            .map(|c| c.end())
            .fold(0.0, f64::max);
        warn!(duration, "source duration unknown, using last command end");
    }

    let timeline = build_timeline(&config.commands, cursor, resolution, duration, settings.fps);
    let filter = compile_to_filter_expression(&timeline, resolution, settings.keyframe_interval);
    info!(
        commands = config.commands.len(),
        frames = timeline.len(),
        width = resolution.width,
        height = resolution.height,
        "applying viewport"
    );
    debug!(%filter, "viewport filter");

    let plan = RenderPlan::video_filter(input, filter, output);
    invoker
        .execute(&plan, TimeMs::from_seconds(duration))
        .await?;
    Ok(output.to_path_buf())
}
