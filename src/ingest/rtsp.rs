//! RTSP audio source.
//!
//! This module provides `RtspAdapter` for detecting on the audio track of an
//! RTSP stream (IP cameras, intercoms).
//!
//! The RTSP adapter is responsible for:
//! - Probing the stream's native sample rate (falling back to 16 kHz)
//! - Spawning an ffmpeg decoder that writes mono f32le PCM to its stdout
//! - Reading 100 ms chunks and forwarding them to the classifier
//! - Killing and reaping the decoder on every exit path
//!
//! The ffprobe lookup is abandoned as soon as the run flag clears. A stalled
//! decoder pipe is not interrupted: once streaming, stop latency is bounded
//! by the decoder producing data or closing its output.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use super::{forward_samples, AudioAdapter, DEFAULT_SAMPLE_RATE};
use crate::config::ToolSettings;
use crate::detect::SharedClassifier;
use crate::orchestrator::{DetectionSession, RunFlag};

/// Upper bound on the ffprobe metadata probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const PROBE_POLL: Duration = Duration::from_millis(50);
const BYTES_PER_SAMPLE: usize = 4;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Stream URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub probe_timeout: Duration,
}

impl RtspConfig {
    pub fn new(url: impl Into<String>, tools: &ToolSettings) -> Self {
        Self {
            url: url.into(),
            ffmpeg_path: tools.ffmpeg_path.clone(),
            ffprobe_path: tools.ffprobe_path.clone(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

/// RTSP audio source decoded through an ffmpeg subprocess.
pub struct RtspAdapter {
    config: RtspConfig,
}

impl RtspAdapter {
    pub fn new(config: RtspConfig) -> Self {
        Self { config }
    }

    fn spawn_decoder(&self, sample_rate: u32) -> Result<(DecoderProcess, ChildStdout)> {
        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if is_rtsp_url(&self.config.url) {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-i")
            .arg(&self.config.url)
            .arg("-vn")
            .arg("-f")
            .arg("f32le")
            .arg("-acodec")
            .arg("pcm_f32le")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(sample_rate.to_string())
            .arg("pipe:1");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.ffmpeg_path))?;
        let stdout = child.stdout.take();
        let process = DecoderProcess { child };
        let stdout = stdout.ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        Ok((process, stdout))
    }
}

impl AudioAdapter for RtspAdapter {
    fn resolve_sample_rate(&mut self, run_flag: &RunFlag) -> u32 {
        match probe_sample_rate(&self.config, run_flag) {
            Ok(Some(rate)) => {
                log::info!("sample rate detected from RTSP: {} Hz", rate);
                rate
            }
            Ok(None) => {
                log::warn!(
                    "could not determine sample rate of {}, using fallback {} Hz",
                    self.config.url,
                    DEFAULT_SAMPLE_RATE
                );
                DEFAULT_SAMPLE_RATE
            }
            Err(e) => {
                log::warn!(
                    "sample rate probe failed ({}), using fallback {} Hz",
                    e,
                    DEFAULT_SAMPLE_RATE
                );
                DEFAULT_SAMPLE_RATE
            }
        }
    }

    fn run(&mut self, session: &DetectionSession, classifier: &SharedClassifier) -> Result<()> {
        if !session.is_running() {
            return Ok(());
        }
        let (_process, stdout) = self.spawn_decoder(session.sample_rate)?;
        log::info!("detection started for RTSP source {}", session.source_id);
        pump_pcm(stdout, session, classifier)?;
        log::info!("RTSP detection for {} finished", session.source_id);
        Ok(())
    }
}

/// Decoder subprocess, killed and reaped when dropped.
struct DecoderProcess {
    child: Child,
}

impl Drop for DecoderProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            if e.kind() != ErrorKind::InvalidInput {
                log::warn!("failed to kill ffmpeg decoder: {}", e);
            }
        }
        match self.child.wait() {
            Ok(status) => log::debug!("ffmpeg decoder exited with {}", status),
            Err(e) => log::warn!("failed to reap ffmpeg decoder: {}", e),
        }
    }
}

/// Read 100 ms chunks of f32le PCM and forward them until the session stops.
///
/// End of stream is an error: the session attempt is over and the supervisor
/// decides whether to relaunch.
pub(crate) fn pump_pcm<R: Read>(
    mut reader: R,
    session: &DetectionSession,
    classifier: &SharedClassifier,
) -> Result<()> {
    let mut bytes = vec![0u8; session.block_size() * BYTES_PER_SAMPLE];
    let mut samples = Vec::with_capacity(session.block_size());

    while session.is_running() {
        let filled = read_chunk(&mut reader, &mut bytes)?;
        if filled == 0 {
            return Err(anyhow!("RTSP stream {} reached end of stream", session.source_id));
        }
        decode_f32le(&bytes[..filled], &mut samples);
        if samples.is_empty() {
            continue;
        }
        forward_samples(classifier, &samples, &session.source_id)?;
    }
    Ok(())
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(anyhow!("RTSP pipe read failed: {}", e)),
        }
    }
    Ok(filled)
}

/// Convert little-endian f32 bytes into samples. A trailing partial sample
/// is discarded.
fn decode_f32le(bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
    );
}

fn is_rtsp_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    sample_rate: Option<serde_json::Value>,
}

/// Ask ffprobe for the first audio stream's sample rate. Gives up early
/// when `run_flag` clears.
pub fn probe_sample_rate(config: &RtspConfig, run_flag: &RunFlag) -> Result<Option<u32>> {
    let mut child = Command::new(&config.ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-show_entries",
            "stream=sample_rate",
            "-select_streams",
            "a:0",
            "-of",
            "json",
        ])
        .arg(&config.url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {}", config.ffprobe_path))?;

    let status = wait_for_exit(&mut child, config.probe_timeout, run_flag)?;
    if !status.success() {
        return Err(anyhow!("ffprobe exited with {}", status));
    }

    let mut output = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout
            .read_to_end(&mut output)
            .context("read ffprobe output")?;
    }
    parse_probe_output(&output)
}

/// Poll `child` until it exits. Kills and reaps it when `timeout` passes or
/// the run flag clears first.
fn wait_for_exit(child: &mut Child, timeout: Duration, run_flag: &RunFlag) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("poll ffprobe")? {
            return Ok(status);
        }
        let reason = if !run_flag.is_set() {
            "cancelled by stop".to_string()
        } else if Instant::now() >= deadline {
            format!("timed out after {}s", timeout.as_secs())
        } else {
            std::thread::sleep(PROBE_POLL);
            continue;
        };
        let _ = child.kill();
        let _ = child.wait();
        return Err(anyhow!("ffprobe {}", reason));
    }
}

fn parse_probe_output(output: &[u8]) -> Result<Option<u32>> {
    let probe: ProbeOutput =
        serde_json::from_slice(output).map_err(|e| anyhow!("invalid ffprobe output: {}", e))?;
    let rate = probe.streams.iter().find_map(|stream| {
        match stream.sample_rate.as_ref()? {
            serde_json::Value::String(s) => s.trim().parse::<u32>().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        }
    });
    Ok(rate.filter(|rate| *rate > 0))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingClassifier;
    use std::io::Cursor;

    fn pcm(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn probe_output_with_string_rate() -> Result<()> {
        let json = br#"{ "programs": [], "streams": [{ "sample_rate": "44100" }] }"#;
        assert_eq!(parse_probe_output(json)?, Some(44_100));
        Ok(())
    }

    #[test]
    fn probe_output_without_usable_rate() -> Result<()> {
        assert_eq!(parse_probe_output(br#"{ "streams": [] }"#)?, None);
        assert_eq!(parse_probe_output(br#"{}"#)?, None);
        assert_eq!(
            parse_probe_output(br#"{ "streams": [{ "sample_rate": "N/A" }] }"#)?,
            None
        );
        assert!(parse_probe_output(b"not json").is_err());
        Ok(())
    }

    #[test]
    fn missing_ffprobe_falls_back_to_default_rate() {
        let tools = ToolSettings {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
        };
        let mut adapter = RtspAdapter::new(RtspConfig::new("rtsp://camera/audio", &tools));
        assert_eq!(adapter.resolve_sample_rate(&RunFlag::new(true)), DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn missing_ffmpeg_fails_the_session() {
        let tools = ToolSettings {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
        };
        let (classifier, _) = RecordingClassifier::shared();
        let session = DetectionSession::new("rtsp_x", 16_000, RunFlag::new(true));
        let mut adapter = RtspAdapter::new(RtspConfig::new("rtsp://camera/audio", &tools));
        assert!(adapter.run(&session, &classifier).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn stop_cancels_a_hung_metadata_lookup() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let run_flag = RunFlag::new(true);
        let stopper = run_flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            stopper.clear();
        });

        let started = Instant::now();
        let err = wait_for_exit(&mut child, Duration::from_secs(10), &run_flag).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(format!("{err}").contains("cancelled"));
        assert!(child.try_wait().expect("reaped").is_some());
    }

    #[test]
    fn stopped_session_never_spawns_the_decoder() -> Result<()> {
        let tools = ToolSettings {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
        };
        let (classifier, calls) = RecordingClassifier::shared();
        let session = DetectionSession::new("rtsp_x", 16_000, RunFlag::new(false));
        let mut adapter = RtspAdapter::new(RtspConfig::new("rtsp://camera/audio", &tools));
        adapter.run(&session, &classifier)?;
        assert!(calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn pump_forwards_100ms_chunks_until_eof() {
        let (classifier, calls) = RecordingClassifier::shared();
        // 1000 Hz -> 100 samples per chunk; 250 samples = 2 full chunks + 1 partial.
        let session = DetectionSession::new("rtsp_A", 1000, RunFlag::new(true));
        let bytes = pcm(&vec![0.25f32; 250]);

        let err = pump_pcm(Cursor::new(bytes), &session, &classifier).unwrap_err();
        assert!(format!("{err}").contains("end of stream"));

        let calls = calls.lock().unwrap();
        let sizes: Vec<usize> = calls.iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert!(calls.iter().all(|(id, _)| id == "rtsp_A"));
    }

    #[test]
    fn pump_returns_ok_when_stopped() -> Result<()> {
        let (classifier, calls) = RecordingClassifier::shared();
        let session = DetectionSession::new("rtsp_A", 1000, RunFlag::new(false));
        pump_pcm(Cursor::new(pcm(&[0.5; 400])), &session, &classifier)?;
        assert!(calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn decode_drops_trailing_partial_sample() {
        let mut bytes = pcm(&[1.0, -0.5]);
        bytes.extend_from_slice(&[0, 0]);
        let mut out = Vec::new();
        decode_f32le(&bytes, &mut out);
        assert_eq!(out, vec![1.0, -0.5]);
    }

    #[test]
    fn rtsp_transport_only_for_rtsp_urls() {
        assert!(is_rtsp_url("rtsp://cam/stream"));
        assert!(is_rtsp_url("RTSPS://cam/stream"));
        assert!(!is_rtsp_url("http://cam/audio.mp3"));
    }
}
