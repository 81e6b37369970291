use crate::expr::{escape_filter_value, format_fixed, piecewise_linear, Keyframe, Precision};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Output label of the compiled mix.
pub const MIX_OUTPUT_LABEL: &str = "aout";

/// Compiled post-production mix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixGraph {
    /// Audio files in ffmpeg input order, starting at `MixOptions::input_offset`.
    pub input_files: Vec<PathBuf>,
    pub filter_graph: String,
    /// False when nothing needs mixing; the caller copies the video instead.
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixOptions {
    /// Trim the mix to this length so audio never outruns the video.
    pub video_duration: Option<TimeMs>,
    /// Include the captured video's own audio (`[0:a]`) in the mix.
    pub source_has_audio: bool,
    /// ffmpeg input index of the first audio file (the video is input 0).
    pub input_offset: usize,
    pub dropout_transition_s: f64,
}

impl Default for MixOptions {
    fn default() -> Self {
        Self {
            video_duration: None,
            source_has_audio: false,
            input_offset: 1,
            dropout_transition_s: 2.0,
        }
    }
}

/// How one `play` event ends.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SegmentEnd {
    time: Option<TimeMs>,
    fade_out: TimeMs,
    /// Cut short by a stop before the file's natural end.
    truncated: bool,
}

fn segment_end(play: &AudioEvent, later: &[&AudioEvent]) -> SegmentEnd {
    let AudioEventKind::Play {
        fade_out,
        loop_track,
        audio_duration,
        ..
    } = &play.kind
    else {
        return SegmentEnd {
            time: None,
            fade_out: TimeMs::ZERO,
            truncated: false,
        };
    };

    let natural_end = (!loop_track).then(|| play.time + *audio_duration);
    let stop = later
        .iter()
        .filter(|e| e.time >= play.time)
        .find_map(|e| match e.kind {
            AudioEventKind::Stop { fade_out } => Some((e.time, fade_out)),
            _ => None,
        });

    match stop {
        Some((at, stop_fade)) if natural_end.map_or(true, |end| at < end) => SegmentEnd {
            time: Some(at),
            fade_out: stop_fade,
            truncated: true,
        },
        _ => SegmentEnd {
            time: natural_end,
            fade_out: *fade_out,
            truncated: false,
        },
    }
}

/// Channel gain as points of a piecewise-linear curve, starting at `start`.
///
/// Each volume event ramps from wherever the curve is at its start time, and
/// a ramp still running when the next event lands is cut off there.
fn gain_curve(initial: f64, start: TimeMs, events: &[&AudioEvent]) -> Vec<(TimeMs, f64)> {
    let mut ordered: Vec<&AudioEvent> = events.to_vec();
    ordered.sort_by_key(|e| e.time);

    let mut points = vec![(start, initial)];
    for event in ordered {
        let AudioEventKind::Volume { volume, duration } = event.kind else {
            continue;
        };
        let at = event.time.max(start);
        let from = level_on(&points, at);
        points.retain(|&(t, _)| t <= at);
        points.push((at, from));
        points.push((at + duration, volume));
    }
    points
}

/// Level of a gain curve at `time`. Later points win on equal times.
fn level_on(points: &[(TimeMs, f64)], time: TimeMs) -> f64 {
    let Some(i) = points.iter().rposition(|&(t, _)| t <= time) else {
        return points.first().map_or(1.0, |&(_, v)| v);
    };
    let (t0, v0) = points[i];
    match points.get(i + 1) {
        Some(&(t1, v1)) if t1 > t0 => {
            let p = (time.0 - t0.0) as f64 / (t1.0 - t0.0) as f64;
            v0 + (v1 - v0) * p
        }
        _ => v0,
    }
}

fn seconds(ms: TimeMs) -> String {
    format_fixed(ms.as_seconds(), 3)
}

/// Filter chain for one `play` event, or `None` if it has nothing to play.
fn play_chain(
    play: &AudioEvent,
    channel: &Channel,
    channel_events: &[&AudioEvent],
    later: &[&AudioEvent],
) -> Option<Vec<String>> {
    let AudioEventKind::Play {
        fade_in,
        loop_track,
        volume,
        audio_duration,
        ..
    } = &play.kind
    else {
        return None;
    };
    if audio_duration.0 == 0 {
        // Missing or unreadable file: probed as zero length.
        return None;
    }

    let end = segment_end(play, later);
    let mut filters = Vec::new();

    if *loop_track {
        filters.push("aloop=loop=-1:size=2147483647".to_string());
    }
    if end.truncated {
        if let Some(at) = end.time {
            filters.push(format!("atrim=end={}", seconds(at - play.time)));
        }
    }

    let delay = play.time.0;
    filters.push(format!("adelay={delay}|{delay}"));

    if fade_in.0 > 0 {
        filters.push(format!(
            "afade=t=in:st={}:d={}",
            seconds(play.time),
            seconds(*fade_in)
        ));
    }

    if let Some(end_time) = end.time {
        let fade = end.fade_out.0 as i64;
        let start = end_time.0 as i64 - fade;
        if fade > 0 && start >= 0 && end_time > play.time {
            filters.push(format!(
                "afade=t=out:st={}:d={}",
                seconds(TimeMs(start as u64)),
                seconds(end.fade_out)
            ));
        }
    }

    let (initial, origin) = match volume {
        Some(v) => (*v, play.time),
        None => (channel.volume, TimeMs::ZERO),
    };
    let volume_events: Vec<&AudioEvent> = channel_events
        .iter()
        .copied()
        .filter(|e| matches!(e.kind, AudioEventKind::Volume { .. }) && e.time >= origin)
        .collect();
    let curve = gain_curve(initial, origin, &volume_events);
    let base = level_on(&curve, play.time);

    let mut keys = vec![Keyframe {
        time: play.time.as_seconds(),
        value: base,
    }];
    for &(at, value) in curve.iter().filter(|(at, _)| *at > play.time) {
        keys.push(Keyframe {
            time: at.as_seconds(),
            value,
        });
        if end.time.is_some_and(|t| at >= t) {
            break;
        }
    }

    if keys.iter().all(|k| (k.value - base).abs() <= f64::EPSILON) {
        if (base - 1.0).abs() > f64::EPSILON {
            filters.push(format!("volume={}", format_fixed(base, 2)));
        }
    } else {
        let expr = piecewise_linear(&keys, Precision::GAIN, base);
        filters.push(format!(
            "volume=volume={}:eval=frame",
            escape_filter_value(&expr.to_string())
        ));
    }

    if channel.pan.abs() > f64::EPSILON {
        filters.push(format!(
            "stereotools=balance_out={}",
            format_fixed(channel.pan.clamp(-1.0, 1.0), 2)
        ));
    }

    Some(filters)
}

/// Compile the recorded timeline into an `amix` filter graph.
///
/// Every `play` event on a post-mixed channel becomes its own input and
/// chain; channels routed only to the virtual mic are skipped. Channels are
/// visited in id order and events in append order, so identical inputs give
/// byte-identical output.
pub fn compile_filter_graph(
    timeline: &[AudioEvent],
    channels: &BTreeMap<ChannelId, Channel>,
    options: &MixOptions,
) -> MixGraph {
    let mut by_channel: BTreeMap<ChannelId, Vec<&AudioEvent>> = BTreeMap::new();
    for event in timeline {
        by_channel.entry(event.channel).or_default().push(event);
    }

    let mut input_files = Vec::new();
    let mut chains = Vec::new();
    let mut labels = Vec::new();

    for (id, events) in &by_channel {
        let channel = channels
            .get(id)
            .cloned()
            .unwrap_or_else(|| Channel::default_for(*id));
        if !channel.output.is_post_mixed() {
            continue;
        }

        for (i, event) in events.iter().enumerate() {
            let AudioEventKind::Play { file, .. } = &event.kind else {
                continue;
            };
            let Some(filters) = play_chain(event, &channel, events, &events[i + 1..]) else {
                continue;
            };
            let input = options.input_offset + input_files.len();
            let label = format!("a{}", labels.len());
            chains.push(format!("[{input}:a]{}[{label}]", filters.join(",")));
            input_files.push(file.clone());
            labels.push(label);
        }
    }

    if input_files.is_empty() {
        return MixGraph::default();
    }

    let mut mix_inputs = String::new();
    if options.source_has_audio {
        mix_inputs.push_str("[0:a]");
    }
    for label in &labels {
        mix_inputs.push_str(&format!("[{label}]"));
    }
    let count = labels.len() + usize::from(options.source_has_audio);
    let trim = options
        .video_duration
        .map(|d| format!(",atrim=end={}", seconds(d)))
        .unwrap_or_default();

    chains.push(format!(
        "{mix_inputs}amix=inputs={count}:duration=longest:dropout_transition={}{trim}[{MIX_OUTPUT_LABEL}]",
        format_fixed(options.dropout_transition_s, 0)
    ));

    MixGraph {
        input_files,
        filter_graph: chains.join(";"),
        has_audio: true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
