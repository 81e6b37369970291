use crate::error::Result;
use crate::invoke::{copy_unchanged, RenderInvoker, RenderPlan, RenderProgress};
use crate::probe::{Ffprobe, MediaInfo, MediaProbe, ProbeCache};
use democut_core::audio::{self, MixGraph, MixOptions};
use democut_core::config::{AudioSettings, SessionConfig, ToolPaths};
use democut_core::types::*;
use democut_playback::{PlaybackError, PlaybackSink};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters of a `play` call, as handed over by the scene runner.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub file: String,
    pub channel: ChannelId,
    /// Suspend the caller until playback has finished.
    pub wait: bool,
    pub fade_in: TimeMs,
    pub fade_out: TimeMs,
    /// Timeline position for the recorded event; defaults to the recording clock.
    pub start_at: Option<TimeMs>,
    pub loop_track: bool,
    pub volume: Option<f64>,
}

impl PlayRequest {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            channel: NARRATION_CHANNEL,
            wait: true,
            fade_in: TimeMs::ZERO,
            fade_out: TimeMs::ZERO,
            start_at: None,
            loop_track: false,
            volume: None,
        }
    }

    pub fn channel(mut self, channel: ChannelId) -> Self {
        self.channel = channel;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    pub fn fade_in(mut self, fade: TimeMs) -> Self {
        self.fade_in = fade;
        self
    }

    pub fn fade_out(mut self, fade: TimeMs) -> Self {
        self.fade_out = fade;
        self
    }

    pub fn start_at(mut self, at: TimeMs) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn looped(mut self) -> Self {
        self.loop_track = true;
        self
    }

    pub fn volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume.clamp(0.0, 1.0));
        self
    }
}

/// Result of [`AudioTimelineManager::begin_play`].
///
/// Holds no borrow of the manager, so other channels can be driven while
/// the caller waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct PlayHandle {
    /// Probed length of the file; zero if it could not be probed.
    pub duration: TimeMs,
    /// How long the caller should wait, if it asked to.
    pub wait: Option<Duration>,
}

impl PlayHandle {
    pub async fn finished(self) -> TimeMs {
        if let Some(wait) = self.wait {
            tokio::time::sleep(wait).await;
        }
        self.duration
    }
}

// ---------------------------------------------------------------------------
// Live sinks
// ---------------------------------------------------------------------------

type SharedSink = Arc<Mutex<Box<dyn PlaybackSink + Send>>>;

/// Run one sink call on the blocking pool. Sinks talk to their player
/// synchronously and may sleep while it starts up.
async fn on_sink<T, F>(sink: &SharedSink, call: F) -> democut_playback::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn PlaybackSink) -> democut_playback::Result<T> + Send + 'static,
{
    let sink = Arc::clone(sink);
    tokio::task::spawn_blocking(move || {
        let mut guard = sink
            .lock()
            .map_err(|_| PlaybackError::Worker("sink lock poisoned".to_string()))?;
        call(&mut **guard)
    })
    .await
    .map_err(|e| PlaybackError::Worker(e.to_string()))?
}

// ---------------------------------------------------------------------------
// AudioTimelineManager
// ---------------------------------------------------------------------------

/// Records one session's audio events and mixes them into the capture.
///
/// Owned by the caller for a single recording session; [`reset`] starts a
/// new one.
///
/// [`reset`]: AudioTimelineManager::reset
pub struct AudioTimelineManager {
    session_id: Uuid,
    base_path: PathBuf,
    channels: BTreeMap<ChannelId, Channel>,
    settings: AudioSettings,
    timeline: Vec<AudioEvent>,
    active: BTreeMap<ChannelId, ActiveTrack>,
    resting_volume: BTreeMap<ChannelId, f64>,
    started_at: Option<Instant>,
    probe: Box<dyn MediaProbe + Send + Sync>,
    cache: ProbeCache,
    invoker: RenderInvoker,
    sinks: BTreeMap<ChannelId, SharedSink>,
}

impl AudioTimelineManager {
    pub fn new(probe: Box<dyn MediaProbe + Send + Sync>, invoker: RenderInvoker) -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(NARRATION_CHANNEL, Channel::default_for(NARRATION_CHANNEL));
        Self {
            session_id: Uuid::new_v4(),
            base_path: PathBuf::new(),
            channels,
            settings: AudioSettings::default(),
            timeline: Vec::new(),
            active: BTreeMap::new(),
            resting_volume: BTreeMap::new(),
            started_at: None,
            probe,
            cache: ProbeCache::new(),
            invoker,
            sinks: BTreeMap::new(),
        }
    }

    /// Manager backed by the configured ffprobe/ffmpeg binaries.
    pub fn with_tools(tools: &ToolPaths) -> Self {
        Self::new(
            Box::new(Ffprobe::new(&tools.ffprobe)),
            RenderInvoker::new(&tools.ffmpeg),
        )
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn timeline(&self) -> &[AudioEvent] {
        &self.timeline
    }

    pub fn channels(&self) -> &BTreeMap<ChannelId, Channel> {
        &self.channels
    }

    pub fn active_track(&self, channel: ChannelId) -> Option<&ActiveTrack> {
        self.active.get(&channel)
    }

    /// Level the channel settles at after its volume events so far.
    pub fn resting_volume(&self, channel: ChannelId) -> f64 {
        self.resting_volume
            .get(&channel)
            .copied()
            .unwrap_or_else(|| self.channel(channel).volume)
    }

    /// Progress of the final mix render.
    pub fn render_progress(&self) -> watch::Receiver<RenderProgress> {
        self.invoker.subscribe()
    }

    /// Route a live channel's playback through `sink`.
    pub fn attach_sink(&mut self, channel: ChannelId, sink: Box<dyn PlaybackSink + Send>) {
        self.sinks.insert(channel, Arc::new(Mutex::new(sink)));
    }

    /// Register channels and settings, then schedule the config's tracks.
    pub fn configure(&mut self, config: &SessionConfig) -> Result<()> {
        config.validate()?;
        self.channels = config.resolved_channels()?;
        self.base_path = config.base_path.clone();
        self.settings = config.audio.clone();

        for track in &config.tracks {
            let path = self.resolve_path(&track.file);
            let duration = self.cache.duration(self.probe.as_ref(), &path);
            debug!(
                session = %self.session_id,
                channel = track.channel,
                file = %path.display(),
                at = %track.start_at,
                "scheduled track"
            );
            self.timeline.push(AudioEvent {
                channel: track.channel,
                time: track.start_at,
                kind: AudioEventKind::Play {
                    file: path,
                    fade_in: track.fade_in,
                    fade_out: track.fade_out,
                    loop_track: track.loop_track,
                    volume: track.volume,
                    audio_duration: duration,
                },
            });
        }

        info!(
            session = %self.session_id,
            channels = self.channels.len(),
            tracks = config.tracks.len(),
            "audio session configured"
        );
        Ok(())
    }

    /// Anchor the recording clock at now.
    pub fn start_recording(&mut self) {
        self.started_at = Some(Instant::now());
        info!(session = %self.session_id, "recording clock started");
    }

    /// Milliseconds since [`start_recording`](Self::start_recording), or zero.
    pub fn current_time(&self) -> TimeMs {
        self.started_at
            .map(|start| TimeMs(start.elapsed().as_millis() as u64))
            .unwrap_or(TimeMs::ZERO)
    }

    /// Record a play and start live playback, without waiting for it to end.
    pub async fn begin_play(&mut self, request: PlayRequest) -> PlayHandle {
        let path = self.resolve_path(&request.file);
        let duration = self.cache.duration(self.probe.as_ref(), &path);
        let now = request.start_at.unwrap_or_else(|| self.current_time());
        let id = request.channel;
        let channel = self.channel(id);

        if let Some(previous) = self.active.remove(&id) {
            let fade = request
                .fade_in
                .max(previous.fade_out)
                .max(self.settings.crossfade_min);
            debug!(
                session = %self.session_id,
                channel = id,
                replaced = %previous.file.display(),
                fade_ms = fade.0,
                "crossfading"
            );
            self.timeline.push(AudioEvent {
                channel: id,
                time: now,
                kind: AudioEventKind::Stop { fade_out: fade },
            });
        }

        self.timeline.push(AudioEvent {
            channel: id,
            time: now,
            kind: AudioEventKind::Play {
                file: path.clone(),
                fade_in: request.fade_in,
                fade_out: request.fade_out,
                loop_track: request.loop_track,
                volume: request.volume,
                audio_duration: duration,
            },
        });
        self.active.insert(
            id,
            ActiveTrack {
                file: path.clone(),
                start_time: now,
                duration,
                fade_in: request.fade_in,
                fade_out: request.fade_out,
                volume: request.volume,
            },
        );
        info!(
            session = %self.session_id,
            channel = id,
            file = %path.display(),
            at = %now,
            duration_ms = duration.0,
            "play"
        );

        let mut wait_for = duration;
        if channel.output.is_live() {
            if let Some(sink) = self.sinks.get(&id) {
                let file = path.clone();
                match on_sink(sink, move |sink| sink.play(&file)).await {
                    Ok(reported) => {
                        wait_for = reported.map(TimeMs).unwrap_or(duration) + self.settings.settle_margin;
                    }
                    Err(e) => {
                        warn!(session = %self.session_id, channel = id, error = %e, "live playback failed");
                    }
                }
            }
        }

        PlayHandle {
            duration,
            wait: request.wait.then(|| Duration::from_millis(wait_for.0)),
        }
    }

    /// [`begin_play`](Self::begin_play), then wait if the request asked to.
    ///
    /// Returns the probed duration.
    pub async fn play(&mut self, request: PlayRequest) -> TimeMs {
        self.begin_play(request).await.finished().await
    }

    /// Stop one channel, or every channel with an active track.
    pub async fn stop(&mut self, channel: Option<ChannelId>, fade_out: Option<TimeMs>) {
        let fade_out = fade_out.unwrap_or(self.settings.default_stop_fade);
        let now = self.current_time();
        let targets: Vec<ChannelId> = match channel {
            Some(id) => vec![id],
            None => self.active.keys().copied().collect(),
        };

        for id in targets {
            self.timeline.push(AudioEvent {
                channel: id,
                time: now,
                kind: AudioEventKind::Stop { fade_out },
            });
            self.active.remove(&id);
            debug!(session = %self.session_id, channel = id, at = %now, "stop");

            if self.channel(id).output.is_live() {
                if let Some(sink) = self.sinks.get(&id) {
                    if let Err(e) = on_sink(sink, |sink| sink.stop()).await {
                        warn!(session = %self.session_id, channel = id, error = %e, "live stop failed");
                    }
                }
            }
        }
    }

    /// Set a channel's level, ramping linearly over `duration` when non-zero.
    pub async fn set_volume(&mut self, channel: ChannelId, volume: f64, duration: TimeMs) {
        let volume = volume.clamp(0.0, 1.0);
        let now = self.current_time();
        self.timeline.push(AudioEvent {
            channel,
            time: now,
            kind: AudioEventKind::Volume { volume, duration },
        });
        self.resting_volume.insert(channel, volume);
        debug!(session = %self.session_id, channel, volume, ramp_ms = duration.0, "volume");

        if self.channel(channel).output.is_live() {
            if let Some(sink) = self.sinks.get(&channel) {
                if let Err(e) = on_sink(sink, move |sink| sink.set_volume(volume)).await {
                    warn!(session = %self.session_id, channel, error = %e, "live volume failed");
                }
            }
        }
    }

    /// Compile the session so far against the captured `video`.
    pub fn compile_filter_graph(&self, video: &Path, video_duration: Option<TimeMs>) -> MixGraph {
        let media = self.probe_video(video);
        self.compile_with(&media, video_duration)
    }

    /// Mix the session into `video`, writing `output`.
    ///
    /// With nothing to mix the video is copied unchanged. A failed ffmpeg run
    /// is returned as is and never retried.
    pub async fn render_final_mix(&self, video: &Path, output: &Path) -> Result<PathBuf> {
        let media = self.probe_video(video);
        let duration = (media.duration_ms > 0).then(|| media.duration());
        let graph = self.compile_with(&media, duration);

        if !graph.has_audio {
            info!(session = %self.session_id, "no post-mixed audio, copying video");
            return copy_unchanged(video, output).await;
        }

        let plan = RenderPlan::audio_mix(video, &graph, output);
        info!(
            session = %self.session_id,
            inputs = graph.input_files.len(),
            output = %output.display(),
            "rendering final mix"
        );
        self.invoker
            .execute(&plan, duration.unwrap_or_default())
            .await?;
        Ok(output.to_path_buf())
    }

    /// Forget the session: events, active tracks, clock and probe cache.
    pub async fn reset(&mut self) {
        for (id, sink) in &self.sinks {
            if self.active.contains_key(id) {
                if let Err(e) = on_sink(sink, |sink| sink.stop()).await {
                    warn!(session = %self.session_id, channel = id, error = %e, "live stop failed");
                }
            }
        }
        self.timeline.clear();
        self.active.clear();
        self.resting_volume.clear();
        self.started_at = None;
        if !self.cache.is_empty() {
            debug!(session = %self.session_id, "dropping cached probe results");
            self.cache.clear();
        }
        let previous = std::mem::replace(&mut self.session_id, Uuid::new_v4());
        info!(session = %self.session_id, %previous, "audio session reset");
    }

    /// Absolute and `~/` paths pass through; others are relative to the base path.
    pub fn resolve_path(&self, file: &str) -> PathBuf {
        if let Some(rest) = file.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn channel(&self, id: ChannelId) -> Channel {
        self.channels
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Channel::default_for(id))
    }

    fn probe_video(&self, video: &Path) -> MediaInfo {
        self.probe.probe(video).unwrap_or_else(|e| {
            warn!(session = %self.session_id, video = %video.display(), error = %e, "video probe failed");
            MediaInfo::default()
        })
    }

    fn compile_with(&self, media: &MediaInfo, video_duration: Option<TimeMs>) -> MixGraph {
        let options = MixOptions {
            video_duration,
            source_has_audio: media.has_audio,
            dropout_transition_s: self.settings.dropout_transition_s,
            ..MixOptions::default()
        };
        let graph = audio::compile_filter_graph(&self.timeline, &self.channels, &options);
        debug!(
            session = %self.session_id,
            events = self.timeline.len(),
            has_audio = graph.has_audio,
            filter = %graph.filter_graph,
            "compiled mix"
        );
        graph
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use democut_core::config::{ChannelConfig, ScheduledTrack};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct FakeProbe {
        durations: HashMap<String, u64>,
    }

    impl MediaProbe for FakeProbe {
        fn probe(&self, path: &Path) -> Result<MediaInfo> {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.durations.get(&name) {
                Some(&duration_ms) => Ok(MediaInfo {
                    duration_ms,
                    ..MediaInfo::default()
                }),
                None => Err(RenderError::FileNotFound(path.to_path_buf())),
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<String>>>,
        reported: Option<u64>,
    }

    impl PlaybackSink for RecordingSink {
        fn play(&mut self, file: &Path) -> democut_playback::Result<Option<u64>> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("play {}", file.display()));
            Ok(self.reported)
        }

        fn stop(&mut self) -> democut_playback::Result<()> {
            self.calls.lock().unwrap().push("stop".to_string());
            Ok(())
        }

        fn set_volume(&mut self, volume: f64) -> democut_playback::Result<()> {
            self.calls.lock().unwrap().push(format!("volume {volume:.2}"));
            Ok(())
        }
    }

    fn manager() -> AudioTimelineManager {
        let durations = HashMap::from([
            ("narration.wav".to_string(), 2_000),
            ("intro.mp3".to_string(), 30_000),
            ("outro.mp3".to_string(), 20_000),
            ("click.wav".to_string(), 150),
        ]);
        let mut manager = AudioTimelineManager::new(
            Box::new(FakeProbe { durations }),
            RenderInvoker::new("/nonexistent/democut-ffmpeg"),
        );
        let mut config = SessionConfig::new("/demo");
        config.channels.insert(
            2,
            ChannelConfig {
                role: Some(ChannelRole::Music),
                ..ChannelConfig::default()
            },
        );
        manager.configure(&config).unwrap();
        manager
    }

    fn stops(manager: &AudioTimelineManager, channel: ChannelId) -> Vec<(TimeMs, TimeMs)> {
        manager
            .timeline()
            .iter()
            .filter(|e| e.channel == channel)
            .filter_map(|e| match e.kind {
                AudioEventKind::Stop { fade_out } => Some((e.time, fade_out)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_track_synthesizes_a_crossfade_stop() {
        let mut manager = manager();
        manager.start_recording();

        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;
        tokio::time::advance(Duration::from_millis(4_000)).await;
        let request = PlayRequest::new("outro.mp3")
            .channel(2)
            .fade_in(TimeMs(200))
            .no_wait();
        let _ = manager.begin_play(request).await;

        assert_eq!(stops(&manager, 2), vec![(TimeMs(4_000), TimeMs(500))]);
        assert_eq!(
            manager.active_track(2).unwrap().file,
            PathBuf::from("/demo/outro.mp3")
        );

        let graph = manager.compile_filter_graph(Path::new("/demo/capture.mp4"), None);
        assert!(graph
            .filter_graph
            .contains("[1:a]atrim=end=4.000,adelay=0|0,afade=t=out:st=3.500:d=0.500[a0]"));
        assert!(graph.filter_graph.contains("[2:a]adelay=4000|4000"));
    }

    #[tokio::test(start_paused = true)]
    async fn crossfade_uses_the_longest_fade() {
        let mut manager = manager();
        manager.start_recording();

        let request = PlayRequest::new("intro.mp3")
            .channel(2)
            .fade_out(TimeMs(700))
            .no_wait();
        let _ = manager.begin_play(request).await;
        let request = PlayRequest::new("outro.mp3")
            .channel(2)
            .fade_in(TimeMs(1_200))
            .no_wait();
        let _ = manager.begin_play(request).await;
        assert_eq!(stops(&manager, 2)[0].1, TimeMs(1_200));

        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;
        assert_eq!(stops(&manager, 2)[1].1, TimeMs(500));
    }

    #[tokio::test(start_paused = true)]
    async fn narration_then_stop_at_natural_end() {
        let mut manager = manager();
        let mut config = SessionConfig::new("/demo");
        config.channels.insert(
            1,
            ChannelConfig {
                output: Some(ChannelOutput::PostOnly),
                ..ChannelConfig::default()
            },
        );
        manager.configure(&config).unwrap();
        manager.start_recording();

        let duration = manager.play(PlayRequest::new("narration.wav")).await;
        assert_eq!(duration, TimeMs(2_000));
        assert_eq!(manager.current_time(), TimeMs(2_000));

        manager.stop(None, None).await;
        assert_eq!(stops(&manager, 1), vec![(TimeMs(2_000), TimeMs(500))]);

        let graph = manager.compile_filter_graph(Path::new("/demo/capture.mp4"), None);
        assert_eq!(graph.input_files, vec![PathBuf::from("/demo/narration.wav")]);
        assert!(graph.filter_graph.contains("[1:a]adelay=0|0[a0]"));
        assert!(!graph.filter_graph.contains("afade=t=out"));
    }

    #[tokio::test(start_paused = true)]
    async fn live_channel_waits_for_sink_duration_plus_margin() {
        let mut manager = manager();
        let sink = RecordingSink {
            reported: Some(1_500),
            ..RecordingSink::default()
        };
        let calls = sink.calls.clone();
        manager.attach_sink(NARRATION_CHANNEL, Box::new(sink));

        let handle = manager.begin_play(PlayRequest::new("narration.wav")).await;
        assert_eq!(handle.duration, TimeMs(2_000));
        assert_eq!(handle.wait, Some(Duration::from_millis(1_700)));
        assert_eq!(*calls.lock().unwrap(), vec!["play /demo/narration.wav"]);

        let before = Instant::now();
        handle.finished().await;
        assert!(before.elapsed() >= Duration::from_millis(1_700));
        assert!(before.elapsed() < Duration::from_millis(1_800));
    }

    #[tokio::test(start_paused = true)]
    async fn live_channel_falls_back_to_probed_duration() {
        let mut manager = manager();
        manager.attach_sink(NARRATION_CHANNEL, Box::new(RecordingSink::default()));

        let handle = manager.begin_play(PlayRequest::new("narration.wav")).await;
        assert_eq!(handle.wait, Some(Duration::from_millis(2_200)));
    }

    /// Sink whose player only starts once another task opens the gate.
    struct GatedSink {
        gate: std::sync::mpsc::Receiver<()>,
    }

    impl PlaybackSink for GatedSink {
        fn play(&mut self, _file: &Path) -> democut_playback::Result<Option<u64>> {
            self.gate
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| PlaybackError::SocketTimeout(PathBuf::from("gated")))?;
            Ok(Some(1_000))
        }

        fn stop(&mut self) -> democut_playback::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_player_startup_leaves_the_runtime_free() {
        let mut manager = manager();
        let (open, gate) = std::sync::mpsc::channel();
        manager.attach_sink(NARRATION_CHANNEL, Box::new(GatedSink { gate }));

        // Runs on the same single-threaded runtime as the manager.
        let opener = tokio::spawn(async move { open.send(()).is_ok() });
        let handle = manager.begin_play(PlayRequest::new("narration.wav")).await;

        assert!(opener.await.unwrap());
        assert_eq!(handle.wait, Some(Duration::from_millis(1_200)));
    }

    #[tokio::test]
    async fn post_only_channel_paces_without_margin() {
        let mut manager = manager();
        let handle = manager.begin_play(PlayRequest::new("intro.mp3").channel(2)).await;
        assert_eq!(handle.wait, Some(Duration::from_millis(30_000)));

        let handle = manager.begin_play(PlayRequest::new("click.wav").channel(3).no_wait()).await;
        assert_eq!(handle.wait, None);
        assert_eq!(handle.duration, TimeMs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_on_one_channel_leaves_the_manager_usable() {
        let mut manager = manager();
        manager.start_recording();

        let handle = manager.begin_play(PlayRequest::new("intro.mp3").channel(2)).await;
        let waiting = tokio::spawn(handle.finished());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        manager.set_volume(2, 0.4, TimeMs(500)).await;
        let _ = manager.begin_play(PlayRequest::new("click.wav").channel(3).no_wait()).await;
        assert_eq!(manager.timeline().len(), 3);

        assert_eq!(waiting.await.unwrap(), TimeMs(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_targets_only_active_channels() {
        let mut manager = manager();
        let sink = RecordingSink::default();
        let calls = sink.calls.clone();
        manager.attach_sink(NARRATION_CHANNEL, Box::new(sink));
        manager.start_recording();

        let _ = manager.begin_play(PlayRequest::new("narration.wav").no_wait()).await;
        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;
        manager.stop(None, Some(TimeMs(250))).await;

        assert_eq!(stops(&manager, 1), vec![(TimeMs(1_000), TimeMs(250))]);
        assert_eq!(stops(&manager, 2), vec![(TimeMs(1_000), TimeMs(250))]);
        assert!(stops(&manager, 3).is_empty());
        assert!(manager.active_track(1).is_none());
        assert!(manager.active_track(2).is_none());
        assert_eq!(calls.lock().unwrap().last().unwrap(), "stop");
    }

    #[tokio::test]
    async fn stop_without_fade_uses_default() {
        let mut manager = manager();
        manager.stop(Some(2), None).await;
        assert_eq!(stops(&manager, 2), vec![(TimeMs::ZERO, TimeMs(500))]);
    }

    #[tokio::test]
    async fn set_volume_clamps_and_updates_resting_level() {
        let mut manager = manager();
        let sink = RecordingSink::default();
        let calls = sink.calls.clone();
        manager.attach_sink(NARRATION_CHANNEL, Box::new(sink));

        assert_eq!(manager.resting_volume(2), 1.0);
        manager.set_volume(2, 1.5, TimeMs::ZERO).await;
        manager.set_volume(2, 0.25, TimeMs(1_000)).await;
        manager.set_volume(NARRATION_CHANNEL, 0.5, TimeMs::ZERO).await;

        assert!(matches!(
            manager.timeline()[0].kind,
            AudioEventKind::Volume { volume, .. } if volume == 1.0
        ));
        assert_eq!(manager.resting_volume(2), 0.25);
        assert_eq!(*calls.lock().unwrap(), vec!["volume 0.50"]);
    }

    #[tokio::test]
    async fn missing_file_is_recorded_as_zero_length() {
        let mut manager = manager();
        let handle = manager.begin_play(PlayRequest::new("gone.wav").channel(2)).await;
        assert_eq!(handle.duration, TimeMs::ZERO);
        assert_eq!(handle.wait, Some(Duration::ZERO));
        assert_eq!(manager.timeline().len(), 1);

        let graph = manager.compile_filter_graph(Path::new("/demo/capture.mp4"), None);
        assert!(!graph.has_audio);
    }

    #[tokio::test]
    async fn start_at_overrides_the_clock() {
        let mut manager = manager();
        let request = PlayRequest::new("intro.mp3")
            .channel(2)
            .start_at(TimeMs(12_000))
            .no_wait();
        let _ = manager.begin_play(request).await;
        assert_eq!(manager.timeline()[0].time, TimeMs(12_000));
        assert_eq!(manager.active_track(2).unwrap().start_time, TimeMs(12_000));
    }

    #[test]
    fn configure_schedules_tracks() {
        let mut manager = manager();
        let mut config = SessionConfig::new("/demo");
        config.tracks.push(ScheduledTrack {
            file: "intro.mp3".into(),
            channel: 2,
            start_at: TimeMs(5_000),
            fade_in: TimeMs(1_000),
            fade_out: TimeMs::ZERO,
            loop_track: true,
            volume: Some(0.3),
        });
        manager.configure(&config).unwrap();

        let event = &manager.timeline()[0];
        assert_eq!(event.channel, 2);
        assert_eq!(event.time, TimeMs(5_000));
        assert!(matches!(
            &event.kind,
            AudioEventKind::Play { audio_duration, loop_track: true, .. } if *audio_duration == TimeMs(30_000)
        ));
        assert!(manager.active_track(2).is_none());
    }

    #[test]
    fn configure_rejects_invalid_config() {
        let mut manager = manager();
        let mut config = SessionConfig::default();
        config.viewport.fps = -1.0;
        assert!(matches!(
            manager.configure(&config),
            Err(RenderError::Core(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_starts_a_new_session() {
        let mut manager = manager();
        let first = manager.session_id();
        manager.start_recording();
        tokio::time::advance(Duration::from_millis(3_000)).await;
        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;

        manager.reset().await;
        assert!(manager.timeline().is_empty());
        assert!(manager.active_track(2).is_none());
        assert_eq!(manager.current_time(), TimeMs::ZERO);
        assert_ne!(manager.session_id(), first);

        manager.start_recording();
        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;
        assert_eq!(manager.timeline()[0].time, TimeMs::ZERO);
    }

    #[test]
    fn path_resolution() {
        let manager = manager();
        assert_eq!(
            manager.resolve_path("audio/intro.mp3"),
            PathBuf::from("/demo/audio/intro.mp3")
        );
        assert_eq!(
            manager.resolve_path("/abs/intro.mp3"),
            PathBuf::from("/abs/intro.mp3")
        );
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                manager.resolve_path("~/intro.mp3"),
                PathBuf::from(home).join("intro.mp3")
            );
        }
    }

    #[tokio::test]
    async fn final_mix_without_audio_copies_video() {
        let dir = TempDir::new().unwrap();
        let video = dir.path().join("capture.mp4");
        let output = dir.path().join("final.mp4");
        std::fs::write(&video, b"captured").unwrap();

        let mut manager = manager();
        let _ = manager.begin_play(PlayRequest::new("narration.wav").no_wait()).await;

        let written = manager.render_final_mix(&video, &output).await.unwrap();
        assert_eq!(written, output);
        assert_eq!(std::fs::read(&output).unwrap(), b"captured");
    }

    #[tokio::test]
    async fn final_mix_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let video = dir.path().join("capture.mp4");
        std::fs::write(&video, b"captured").unwrap();

        let mut manager = manager();
        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;

        let result = manager
            .render_final_mix(&video, &dir.path().join("final.mp4"))
            .await;
        assert!(matches!(result, Err(RenderError::FfmpegNotFound)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn final_mix_progress_reaches_subscribers() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let video = dir.path().join("capture.mp4");
        std::fs::write(&video, b"captured").unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(
            &ffmpeg,
            "#!/bin/sh\nprintf 'frame=  90 fps=30 time=00:00:03.00 speed=1.50x\\r' >&2\n",
        )
        .unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let durations = HashMap::from([
            ("capture.mp4".to_string(), 6_000),
            ("intro.mp3".to_string(), 30_000),
        ]);
        let mut manager =
            AudioTimelineManager::new(Box::new(FakeProbe { durations }), RenderInvoker::new(ffmpeg));
        let progress = manager.render_progress();
        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;

        manager
            .render_final_mix(&video, &dir.path().join("final.mp4"))
            .await
            .unwrap();

        let seen = progress.borrow().clone();
        assert_eq!(seen.frame, 90);
        assert!((seen.percent - 50.0).abs() < 1e-9);
        assert_eq!(seen.eta_seconds, Some(2.0));
    }

    #[tokio::test]
    async fn compile_is_deterministic() {
        let mut manager = manager();
        let _ = manager.begin_play(PlayRequest::new("intro.mp3").channel(2).no_wait()).await;
        manager.set_volume(2, 0.2, TimeMs(1_000)).await;
        let _ = manager.begin_play(PlayRequest::new("click.wav").channel(4).no_wait()).await;

        let video = Path::new("/demo/capture.mp4");
        assert_eq!(
            manager.compile_filter_graph(video, Some(TimeMs(10_000))),
            manager.compile_filter_graph(video, Some(TimeMs(10_000)))
        );
    }
}
