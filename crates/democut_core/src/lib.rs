//! Timeline compilers for recorded demo videos.
//!
//! Everything in this crate is pure: audio events and viewport commands go
//! in, filter-graph text for ffmpeg comes out. Running ffprobe/ffmpeg lives
//! in `democut_render`.

pub mod audio;
pub mod config;
pub mod error;
pub mod expr;
pub mod types;
pub mod viewport;
