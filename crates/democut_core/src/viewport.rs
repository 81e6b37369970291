use crate::expr::{escape_filter_value, piecewise_linear, Expr, Keyframe, Precision};
use crate::types::*;

/// Frames between sampled keyframes when compiling a timeline (0.5s at 30fps).
pub const DEFAULT_KEYFRAME_INTERVAL: usize = 15;

pub const DEFAULT_FPS: f64 = 30.0;

// ---------------------------------------------------------------------------
// Cursor track
// ---------------------------------------------------------------------------

/// Cursor position at `time_ms`.
///
/// Clamps to the first/last sample outside the track and interpolates x and
/// y independently between the bracketing samples inside it. A time that
/// matches a sample exactly returns that sample unmodified. `None` for an
/// empty track.
pub fn cursor_at(track: &[CursorSample], time_ms: f64) -> Option<Point> {
    let first = track.first()?;
    let last = track.last()?;

    if time_ms <= first.timestamp {
        return Some(Point {
            x: first.x,
            y: first.y,
        });
    }
    if time_ms >= last.timestamp {
        return Some(Point {
            x: last.x,
            y: last.y,
        });
    }

    for pair in track.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if time_ms < a.timestamp || time_ms > b.timestamp {
            continue;
        }
        if time_ms == a.timestamp {
            return Some(Point { x: a.x, y: a.y });
        }
        if time_ms == b.timestamp {
            return Some(Point { x: b.x, y: b.y });
        }
        let span = b.timestamp - a.timestamp;
        let f = (time_ms - a.timestamp) / span;
        return Some(Point {
            x: a.x + (b.x - a.x) * f,
            y: a.y + (b.y - a.y) * f,
        });
    }

    Some(Point {
        x: last.x,
        y: last.y,
    })
}

// ---------------------------------------------------------------------------
// Animation phases
// ---------------------------------------------------------------------------

/// Quadratic ease-in-out on `[0, 1]`.
pub fn ease_in_out_quad(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        2.0 * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
    }
}

/// Where `time` falls relative to a command window.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Before,
    /// Eased progress through the window.
    Inside(f64),
    After,
}

impl Phase {
    fn of(time: f64, start: f64, duration: f64) -> Self {
        let end = start + duration.max(0.0);
        if time < start {
            Phase::Before
        } else if time > end {
            Phase::After
        } else if duration <= 0.0 {
            Phase::Inside(1.0)
        } else {
            Phase::Inside(ease_in_out_quad((time - start) / duration))
        }
    }
}

trait Lerp: Copy {
    fn lerp(self, to: Self, p: f64) -> Self;
}

impl Lerp for f64 {
    fn lerp(self, to: Self, p: f64) -> Self {
        if p >= 1.0 {
            to
        } else {
            self + (to - self) * p
        }
    }
}

impl Lerp for Point {
    fn lerp(self, to: Self, p: f64) -> Self {
        Point {
            x: self.x.lerp(to.x, p),
            y: self.y.lerp(to.y, p),
        }
    }
}

/// Three-phase animation of one quantity: untouched before the window,
/// eased inside it, committed to `to` after it.
fn animate<Q: Lerp>(phase: Phase, from: Q, to: Q) -> Q {
    match phase {
        Phase::Before => from,
        Phase::Inside(p) => from.lerp(to, p),
        Phase::After => to,
    }
}

// ---------------------------------------------------------------------------
// Timeline builder
// ---------------------------------------------------------------------------

/// Evaluates a viewport program against a cursor track.
///
/// Commands are sorted by start time (stable, so ties keep declaration
/// order). The state at any instant is a left fold of [`reduce`] over the
/// sorted commands: every command either leaves the prior state alone,
/// interpolates from it, or applies its committed target, so later commands
/// start from wherever the earlier ones left off and the last applicable
/// command wins.
///
/// [`reduce`]: ViewportBuilder::reduce
#[derive(Debug, Clone)]
pub struct ViewportBuilder<'a> {
    commands: Vec<ViewportCommand>,
    /// State each hold pins, indexed like `commands`.
    anchors: Vec<Option<ViewportState>>,
    cursor: &'a [CursorSample],
    resolution: Resolution,
}

impl<'a> ViewportBuilder<'a> {
    pub fn new(
        commands: &[ViewportCommand],
        cursor: &'a [CursorSample],
        resolution: Resolution,
    ) -> Self {
        let mut commands = commands.to_vec();
        commands.sort_by(|a, b| a.start().total_cmp(&b.start()));
        let mut builder = Self {
            anchors: Vec::with_capacity(commands.len()),
            commands,
            cursor,
            resolution,
        };
        // Each anchor folds only the commands before its hold, so earlier
        // anchors are always in place by the time a later one needs them.
        for index in 0..builder.commands.len() {
            let anchor = match builder.commands[index] {
                ViewportCommand::Hold { from, .. } => Some(builder.fold(index, from)),
                _ => None,
            };
            builder.anchors.push(anchor);
        }
        builder
    }

    pub fn initial_state(&self) -> ViewportState {
        let center = self.resolution.center();
        ViewportState {
            time: 0.0,
            zoom: 1.0,
            center_x: center.x,
            center_y: center.y,
        }
    }

    /// Viewport state at `time` seconds.
    pub fn state_at(&self, time: f64) -> ViewportState {
        self.fold(self.commands.len(), time)
    }

    /// One state per frame for `0..ceil(duration * fps)`.
    pub fn build(&self, duration: f64, fps: f64) -> Vec<ViewportState> {
        if fps <= 0.0 || duration <= 0.0 {
            return Vec::new();
        }
        let frames = (duration * fps).ceil() as usize;
        (0..frames)
            .map(|frame| self.state_at(frame as f64 / fps))
            .collect()
    }

    fn fold(&self, upto: usize, time: f64) -> ViewportState {
        let initial = ViewportState {
            time,
            ..self.initial_state()
        };
        self.commands[..upto]
            .iter()
            .enumerate()
            .fold(initial, |state, (index, command)| {
                self.reduce(state, index, command, time)
            })
    }

    fn cursor(&self, time: f64) -> Option<Point> {
        cursor_at(self.cursor, time * 1_000.0)
    }

    /// Apply one command to the state produced by the commands before it.
    fn reduce(
        &self,
        prior: ViewportState,
        index: usize,
        command: &ViewportCommand,
        time: f64,
    ) -> ViewportState {
        match *command {
            ViewportCommand::Follow { from, to, zoom } => {
                if time < from {
                    return prior;
                }
                let inside = time <= to;
                let sample_at = if inside { time } else { to };
                let center = self.cursor(sample_at).unwrap_or(prior.center());
                ViewportState {
                    zoom: match zoom {
                        Some(z) if inside => z.max(1.0),
                        _ => prior.zoom,
                    },
                    center_x: center.x,
                    center_y: center.y,
                    ..prior
                }
            }
            ViewportCommand::Zoom {
                level,
                at,
                duration,
                center,
            } => {
                let phase = Phase::of(time, at, duration);
                if phase == Phase::Before {
                    return prior;
                }
                let target = center
                    .or_else(|| self.cursor(time.min(command.end())))
                    .unwrap_or(prior.center());
                let zoom = animate(phase, prior.zoom, level.max(1.0));
                let center = animate(phase, prior.center(), target);
                ViewportState {
                    zoom,
                    center_x: center.x,
                    center_y: center.y,
                    ..prior
                }
            }
            ViewportCommand::Pan { to, at, duration } => {
                let phase = Phase::of(time, at, duration);
                if phase == Phase::Before {
                    return prior;
                }
                let target = match to {
                    PanTarget::Point(p) => p,
                    PanTarget::Cursor => self
                        .cursor(time.min(command.end()))
                        .unwrap_or(prior.center()),
                };
                let center = animate(phase, prior.center(), target);
                ViewportState {
                    center_x: center.x,
                    center_y: center.y,
                    ..prior
                }
            }
            ViewportCommand::Hold { from, to } => {
                if time < from || time > to {
                    return prior;
                }
                // Pin whatever the earlier commands produced when the hold began.
                let anchor = self.anchors.get(index).copied().flatten();
                ViewportState {
                    time,
                    ..anchor.unwrap_or_else(|| self.fold(index, from))
                }
            }
        }
    }
}

/// Dense per-frame viewport timeline.
pub fn build_timeline(
    commands: &[ViewportCommand],
    cursor: &[CursorSample],
    resolution: Resolution,
    video_duration: f64,
    fps: f64,
) -> Vec<ViewportState> {
    ViewportBuilder::new(commands, cursor, resolution).build(video_duration, fps)
}

// ---------------------------------------------------------------------------
// Filter compilation
// ---------------------------------------------------------------------------

/// Frame indices kept as keyframes: every `interval` frames plus the last.
pub fn keyframe_indices(frame_count: usize, interval: usize) -> Vec<usize> {
    if frame_count == 0 {
        return Vec::new();
    }
    let mut indices: Vec<usize> = (0..frame_count).step_by(interval.max(1)).collect();
    if indices.last() != Some(&(frame_count - 1)) {
        indices.push(frame_count - 1);
    }
    indices
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Crop expressions derived from a keyframed viewport timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportExpressions {
    pub resolution: Resolution,
    pub zoom: Expr,
    pub center_x: Expr,
    pub center_y: Expr,
    pub keyframes: usize,
}

impl ViewportExpressions {
    pub fn from_timeline(
        timeline: &[ViewportState],
        resolution: Resolution,
        keyframe_interval: usize,
    ) -> Self {
        let indices = keyframe_indices(timeline.len(), keyframe_interval);
        let keys = |value: fn(&ViewportState) -> f64| -> Vec<Keyframe> {
            indices
                .iter()
                .map(|&i| Keyframe {
                    time: timeline[i].time,
                    value: value(&timeline[i]),
                })
                .collect()
        };
        let center = resolution.center();

        Self {
            resolution,
            zoom: piecewise_linear(&keys(|s| s.zoom), Precision::VIEWPORT, 1.0),
            center_x: piecewise_linear(&keys(|s| s.center_x), Precision::VIEWPORT, center.x),
            center_y: piecewise_linear(&keys(|s| s.center_y), Precision::VIEWPORT, center.y),
            keyframes: indices.len(),
        }
    }

    /// `frame / max(1, zoom)`; the floor keeps the crop inside the frame
    /// even where rounded slopes dip below 1.0.
    fn crop_size(&self, frame: u32) -> Expr {
        Expr::int(frame as i64) / Expr::max(Expr::int(1), self.zoom.clone())
    }

    /// `max(0, min(frame - size, center - size/2))`
    fn crop_offset(&self, frame: u32, center: &Expr) -> Expr {
        let size = self.crop_size(frame);
        Expr::max(
            Expr::int(0),
            Expr::min(
                Expr::int(frame as i64) - size.clone(),
                center.clone() - size / Expr::int(2),
            ),
        )
    }

    pub fn crop_width(&self) -> Expr {
        self.crop_size(self.resolution.width)
    }

    pub fn crop_height(&self) -> Expr {
        self.crop_size(self.resolution.height)
    }

    pub fn crop_x(&self) -> Expr {
        self.crop_offset(self.resolution.width, &self.center_x)
    }

    pub fn crop_y(&self) -> Expr {
        self.crop_offset(self.resolution.height, &self.center_y)
    }

    /// Crop rectangle the filter would select at `t` seconds.
    pub fn crop_at(&self, t: f64) -> CropRect {
        CropRect {
            x: self.crop_x().eval(t),
            y: self.crop_y().eval(t),
            width: self.crop_width().eval(t),
            height: self.crop_height().eval(t),
        }
    }

    /// `crop=w:h:x:y,scale=W:H` with graph-level escaping applied.
    pub fn to_filter(&self) -> String {
        format!(
            "crop={}:{}:{}:{},scale={}:{}",
            escape_filter_value(&self.crop_width().to_string()),
            escape_filter_value(&self.crop_height().to_string()),
            escape_filter_value(&self.crop_x().to_string()),
            escape_filter_value(&self.crop_y().to_string()),
            self.resolution.width,
            self.resolution.height,
        )
    }
}

/// Compile a dense timeline into a crop/scale filter chain.
pub fn compile_to_filter_expression(
    timeline: &[ViewportState],
    resolution: Resolution,
    keyframe_interval: usize,
) -> String {
    ViewportExpressions::from_timeline(timeline, resolution, keyframe_interval).to_filter()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
