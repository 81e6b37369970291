//! Live audio playback during capture.

pub mod error;
pub mod mpv;

pub use error::{PlaybackError, Result};
pub use mpv::MpvSink;

use std::path::Path;

/// Something that can play a channel's audio while the scene is recorded.
pub trait PlaybackSink {
    /// Start playing `file`, replacing whatever was playing.
    ///
    /// Returns the player's reported duration in milliseconds when known.
    fn play(&mut self, file: &Path) -> Result<Option<u64>>;

    fn stop(&mut self) -> Result<()>;

    /// Set the output level, `0.0..=1.0`.
    fn set_volume(&mut self, _volume: f64) -> Result<()> {
        Ok(())
    }
}
