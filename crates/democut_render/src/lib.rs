//! Process-facing half of democut: ffprobe, ffmpeg and the audio timeline
//! manager that records a session and mixes it down.

pub mod error;
pub mod invoke;
pub mod mixdown;
pub mod probe;
pub mod viewport;

pub use error::{RenderError, Result};
pub use invoke::{check_tools, RenderInvoker, RenderPlan, RenderProgress};
pub use mixdown::{AudioTimelineManager, PlayHandle, PlayRequest};
pub use probe::{Ffprobe, MediaInfo, MediaProbe, ProbeCache};
pub use viewport::apply_viewport;
