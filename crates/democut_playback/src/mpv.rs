use crate::error::{PlaybackError, Result};
use crate::PlaybackSink;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SOCKET_POLLS: u32 = 50;
const DURATION_POLLS: u32 = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Audio-only mpv instance driven over its JSON IPC socket.
///
/// One sink per live channel. The process is started on first use and
/// killed on drop.
pub struct MpvSink {
    binary: PathBuf,
    audio_device: Option<String>,
    process: Option<Child>,
    socket_path: PathBuf,
}

impl MpvSink {
    pub fn new(binary: impl Into<PathBuf>, audio_device: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            audio_device,
            process: None,
            socket_path: socket_path_for(Uuid::new_v4()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    fn spawn_args(&self) -> Vec<String> {
        let mut args = vec![
            "--idle=yes".to_string(),
            "--no-video".to_string(),
            "--no-terminal".to_string(),
            format!("--input-ipc-server={}", self.socket_path.display()),
        ];
        if let Some(device) = &self.audio_device {
            args.push(format!("--audio-device={device}"));
        }
        args
    }

    fn ensure_started(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }

        info!(binary = %self.binary.display(), socket = %self.socket_path.display(), "starting mpv");
        let child = Command::new(&self.binary)
            .args(self.spawn_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(PlaybackError::Spawn)?;
        self.process = Some(child);

        for _ in 0..SOCKET_POLLS {
            if self.socket_path.exists() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        self.shutdown();
        Err(PlaybackError::SocketTimeout(self.socket_path.clone()))
    }

    fn send_command(&self, command: Value) -> Result<Value> {
        if self.process.is_none() {
            return Err(PlaybackError::NotRunning);
        }
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;

        stream.write_all(command_line(&command).as_bytes())?;

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        // mpv interleaves async events with replies; skip until one has "error".
        loop {
            response.clear();
            if reader.read_line(&mut response)? == 0 {
                return Err(PlaybackError::Protocol("connection closed".into()));
            }
            let value: Value = serde_json::from_str(&response)?;
            if value.get("error").is_some() {
                return Ok(value);
            }
        }
    }

    fn query_duration(&self) -> Option<u64> {
        for _ in 0..DURATION_POLLS {
            match self.send_command(json!({ "command": ["get_property", "duration"] })) {
                Ok(reply) => {
                    if let Some(secs) = reply_data(&reply).and_then(Value::as_f64) {
                        return Some((secs * 1_000.0).round() as u64);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "duration query failed");
                    return None;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        None
    }

    fn shutdown(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl PlaybackSink for MpvSink {
    fn play(&mut self, file: &Path) -> Result<Option<u64>> {
        self.ensure_started()?;
        let path = file.to_string_lossy();
        let reply = self.send_command(json!({ "command": ["loadfile", path, "replace"] }))?;
        check_reply(&reply)?;
        let duration = self.query_duration();
        if duration.is_none() {
            warn!(file = %file.display(), "mpv did not report a duration");
        }
        Ok(duration)
    }

    fn stop(&mut self) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }
        let reply = self.send_command(json!({ "command": ["stop"] }))?;
        check_reply(&reply)
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }
        let level = volume.clamp(0.0, 1.0) * 100.0;
        let reply = self.send_command(json!({ "command": ["set_property", "volume", level] }))?;
        check_reply(&reply)
    }
}

impl Drop for MpvSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn socket_path_for(id: Uuid) -> PathBuf {
    std::env::temp_dir().join(format!("democut-mpv-{id}.sock"))
}

fn command_line(command: &Value) -> String {
    format!("{command}\n")
}

fn reply_data(reply: &Value) -> Option<&Value> {
    reply.get("data")
}

fn check_reply(reply: &Value) -> Result<()> {
    match reply.get("error").and_then(Value::as_str) {
        Some("success") => Ok(()),
        Some(other) => Err(PlaybackError::Protocol(other.to_string())),
        None => Err(PlaybackError::Protocol("reply without status".into())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
