use std::collections::{BTreeSet, HashMap};
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::OnceCell;

use crate::config;
use crate::conversion::VideoCodec;
use crate::process_control;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// General track stream provided by FFprobe
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FFprobeStream {
    pub index: i64,
    pub codec_name: Option<String>,
    pub codec_type: String,
    pub profile: Option<String>,
    pub pix_fmt: Option<String>,
    pub color_space: Option<String>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub channels: Option<i64>,
    pub channel_layout: Option<String>,
    pub sample_rate: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub avg_frame_rate: Option<String>,
    pub bit_rate: Option<String>,
    pub tags: Option<FFprobeTags>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FFprobeTags {
    pub language: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FFprobeFormat {
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
    pub format_name: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FFprobeOutput {
    #[serde(default)]
    pub streams: Vec<FFprobeStream>,
    pub format: FFprobeFormat,
}

impl FFprobeOutput {
    pub fn video_streams(&self) -> impl Iterator<Item = &FFprobeStream> {
        self.streams.iter().filter(|s| s.codec_type == "video")
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &FFprobeStream> {
        self.streams.iter().filter(|s| s.codec_type == "audio")
    }

    pub fn subtitle_streams(&self) -> impl Iterator<Item = &FFprobeStream> {
        self.streams.iter().filter(|s| s.codec_type == "subtitle")
    }

    pub fn duration(&self) -> Option<f64> {
        self.format.duration.as_deref()?.parse().ok()
    }
}

/// Run ffprobe over a file and parse its JSON report.
///
/// Pure function of the file bytes and the ffprobe build; callers may
/// cache the result.
pub async fn probe(path: impl AsRef<Path>) -> anyhow::Result<FFprobeOutput> {
    let path = path.as_ref();
    tracing::trace!("Probing {}", path.display());
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(config::ffprobe_path())
            .args([
                "-v".as_ref(),
                "quiet".as_ref(),
                "-print_format".as_ref(),
                "json".as_ref(),
                "-show_format".as_ref(),
                "-show_streams".as_ref(),
                path.as_os_str(),
            ])
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .context("ffprobe timed out")?
    .context("spawn ffprobe")?;
    anyhow::ensure!(
        output.status.success(),
        "ffprobe exited with {}",
        output.status
    );
    serde_json::from_slice(&output.stdout).context("parse ffprobe output")
}

/// Distilled probe result handed to the UI and to argument synthesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    /// Absent for live or otherwise unbounded inputs.
    pub duration_seconds: Option<f64>,
    pub bitrate: Option<u64>,
    pub video: Option<VideoStreamInfo>,
    pub audio_tracks: Vec<AudioTrackInfo>,
    pub subtitle_tracks: Vec<SubtitleTrackInfo>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoStreamInfo {
    pub codec: String,
    pub profile: Option<String>,
    pub pixel_format: Option<String>,
    pub color_space: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
}

/// `index` is the position among audio streams, i.e. what `-map 0:a:<i>`
/// selects.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackInfo {
    pub index: u32,
    pub codec: String,
    pub channels: Option<u32>,
    pub channel_layout: Option<String>,
    pub sample_rate: Option<u32>,
    pub bitrate: Option<u64>,
    pub language: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleTrackInfo {
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
    pub label: Option<String>,
}

fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (frames, base) = raw.split_once('/')?;
    let frames: f64 = frames.parse().ok()?;
    let base: f64 = base.parse().ok()?;
    (base != 0.0).then(|| frames / base)
}

impl SourceMetadata {
    pub fn from_probe(probe: &FFprobeOutput) -> Self {
        let video = probe.video_streams().next().map(|s| VideoStreamInfo {
            codec: s.codec_name.clone().unwrap_or_default(),
            profile: s.profile.clone(),
            pixel_format: s.pix_fmt.clone(),
            color_space: s.color_space.clone(),
            width: s.width.unwrap_or(0).max(0) as u32,
            height: s.height.unwrap_or(0).max(0) as u32,
            frame_rate: s.avg_frame_rate.as_deref().and_then(parse_frame_rate),
        });
        let audio_tracks = probe
            .audio_streams()
            .enumerate()
            .map(|(i, s)| AudioTrackInfo {
                index: i as u32,
                codec: s.codec_name.clone().unwrap_or_default(),
                channels: s.channels.and_then(|c| u32::try_from(c).ok()),
                channel_layout: s.channel_layout.clone(),
                sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
                bitrate: s.bit_rate.as_deref().and_then(|r| r.parse().ok()),
                language: s.tags.as_ref().and_then(|t| t.language.clone()),
                label: s.tags.as_ref().and_then(|t| t.title.clone()),
            })
            .collect();
        let subtitle_tracks = probe
            .subtitle_streams()
            .enumerate()
            .map(|(i, s)| SubtitleTrackInfo {
                index: i as u32,
                codec: s.codec_name.clone().unwrap_or_default(),
                language: s.tags.as_ref().and_then(|t| t.language.clone()),
                label: s.tags.as_ref().and_then(|t| t.title.clone()),
            })
            .collect();
        let tags = probe
            .format
            .tags
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect();
        Self {
            duration_seconds: probe.duration(),
            bitrate: probe.format.bit_rate.as_deref().and_then(|b| b.parse().ok()),
            video,
            audio_tracks,
            subtitle_tracks,
            tags,
        }
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        !self.audio_tracks.is_empty()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_seconds
            .filter(|d| *d > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Hardware encoders (and the ML upscale filter) linked into the
/// ffmpeg build we were pointed at.
#[derive(Debug, Clone, Copy, Default, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AvailableEncoders {
    pub h264_videotoolbox: bool,
    pub h264_nvenc: bool,
    pub hevc_videotoolbox: bool,
    pub hevc_nvenc: bool,
    pub av1_nvenc: bool,
    pub ml_upscale: bool,
}

impl AvailableEncoders {
    pub fn supports(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264VideoToolbox => self.h264_videotoolbox,
            VideoCodec::H264Nvenc => self.h264_nvenc,
            VideoCodec::HevcVideoToolbox => self.hevc_videotoolbox,
            VideoCodec::HevcNvenc => self.hevc_nvenc,
            VideoCodec::Av1Nvenc => self.av1_nvenc,
            _ => true,
        }
    }

    fn from_listings(encoders: &str, filters: &str) -> Self {
        let encoders = parse_encoder_names(encoders);
        let filters = parse_filter_names(filters);
        Self {
            h264_videotoolbox: encoders.contains("h264_videotoolbox"),
            h264_nvenc: encoders.contains("h264_nvenc"),
            hevc_videotoolbox: encoders.contains("hevc_videotoolbox"),
            hevc_nvenc: encoders.contains("hevc_nvenc"),
            av1_nvenc: encoders.contains("av1_nvenc"),
            // DNN super resolution filter
            ml_upscale: filters.contains("sr"),
        }
    }
}

/// Parse `ffmpeg -encoders` output into encoder names.
///
/// Lines look like ` V..... libx264    libx264 H.264 / AVC ...`; the
/// first column is a flag block of fixed width.
fn parse_encoder_names(output: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for line in output.lines() {
        let trimmed = line.trim_start();
        if trimmed.len() < 8 {
            continue;
        }
        let (flags, rest) = trimmed.split_at(7);
        if !matches!(flags.chars().next(), Some('V') | Some('A')) {
            continue;
        }
        if let Some(name) = rest.split_whitespace().next() {
            names.insert(name.to_string());
        }
    }
    names
}

/// Parse `ffmpeg -filters` output into filter names. Entries prefixed
/// with `*` are compiled out and skipped.
fn parse_filter_names(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| line.trim_start().split_whitespace().next())
        .filter(|name| !name.is_empty() && !name.starts_with('*'))
        .map(|name| name.to_string())
        .collect()
}

static AVAILABLE_ENCODERS: OnceCell<AvailableEncoders> = OnceCell::const_new();

/// One-shot hardware capability scan, cached for the process lifetime.
pub async fn available_encoders() -> AvailableEncoders {
    *AVAILABLE_ENCODERS
        .get_or_init(|| async {
            match detect_encoders().await {
                Ok(encoders) => {
                    tracing::info!("Detected encoder capabilities: {encoders:?}");
                    encoders
                }
                Err(e) => {
                    tracing::warn!("Capability scan failed, assuming software only: {e}");
                    AvailableEncoders::default()
                }
            }
        })
        .await
}

async fn detect_encoders() -> anyhow::Result<AvailableEncoders> {
    let ffmpeg = config::ffmpeg_path();
    let run = |listing: &'static str| {
        let ffmpeg = ffmpeg.clone();
        async move {
            let output = tokio::time::timeout(
                PROBE_TIMEOUT,
                Command::new(ffmpeg)
                    .args(["-hide_banner", listing])
                    .stdin(Stdio::null())
                    .output(),
            )
            .await
            .context("ffmpeg listing timed out")?
            .context("spawn ffmpeg")?;
            Ok::<_, anyhow::Error>(String::from_utf8_lossy(&output.stdout).to_string())
        }
    };
    let (encoders, filters) = tokio::try_join!(run("-encoders"), run("-filters"))?;
    Ok(AvailableEncoders::from_listings(&encoders, &filters))
}

/// One classified line of supervised ffmpeg stderr, driven by
/// `-progress pipe:2 -nostats`.
#[derive(Debug, Clone, PartialEq)]
pub enum StderrEvent {
    /// Current output timestamp of the running encode.
    Progress { out_time: Duration },
    /// `progress=end`: the pass is about to finish.
    PassEnd,
    /// Diagnostic output worth keeping in the task log.
    Log(String),
    /// Progress-block bookkeeping of no interest.
    Noise,
}

const PROGRESS_BLOCK_KEYS: [&str; 9] = [
    "frame",
    "fps",
    "bitrate",
    "total_size",
    "out_time_us",
    "dup_frames",
    "drop_frames",
    "speed",
    "stream_0_0_q",
];

pub fn classify_stderr_line(line: &str) -> StderrEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return StderrEvent::Noise;
    }
    let Some((key, value)) = trimmed.split_once('=') else {
        return StderrEvent::Log(trimmed.to_string());
    };
    match key.trim() {
        // Despite the name, out_time_ms carries microseconds.
        "out_time_ms" => match value.trim().parse::<i64>() {
            Ok(us) => StderrEvent::Progress {
                out_time: Duration::from_micros(us.max(0) as u64),
            },
            Err(_) => StderrEvent::Noise,
        },
        "out_time" => match parse_timecode(value.trim()) {
            Some(out_time) => StderrEvent::Progress { out_time },
            None => StderrEvent::Noise,
        },
        "progress" if value.trim() == "end" => StderrEvent::PassEnd,
        "progress" => StderrEvent::Noise,
        key if PROGRESS_BLOCK_KEYS.contains(&key) => StderrEvent::Noise,
        _ => StderrEvent::Log(trimmed.to_string()),
    }
}

/// Parse `HH:MM:SS[.fraction]` timecodes.
pub fn parse_timecode(raw: &str) -> Option<Duration> {
    let mut parts = raw.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if !(0.0..60.0).contains(&seconds) || minutes >= 60 {
        return None;
    }
    Some(Duration::from_secs_f64(
        (hours * 3600 + minutes * 60) as f64 + seconds,
    ))
}

/// One spawned ffmpeg child with its stderr stream.
///
/// stdin is piped and kept open for the whole run (some builds exit on
/// stdin EOF), stdout is discarded, stderr carries the progress
/// contract.
#[derive(Debug)]
pub struct FFmpegRunningJob {
    child: Child,
    pid: Option<u32>,
    stderr: Lines<BufReader<ChildStderr>>,
    _stdin: Option<ChildStdin>,
}

impl FFmpegRunningJob {
    pub fn spawn<I, S>(ffmpeg: &Path, args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S> + std::fmt::Debug,
        S: AsRef<OsStr>,
    {
        tracing::debug!("Spawning ffmpeg with args: {:?}", args);
        let mut child = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stderr = BufReader::new(child.stderr.take().expect("stderr is piped")).lines();
        let stdin = child.stdin.take();
        let pid = child.id();
        Ok(Self {
            pid,
            stderr,
            _stdin: stdin,
            child,
        })
    }

    /// Next stderr line. Cancellation safe.
    pub async fn next_stderr_line(&mut self) -> io::Result<Option<String>> {
        self.stderr.next_line().await
    }

    /// Wait until the process fully completes or is terminated.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub fn suspend(&self) -> io::Result<()> {
        match self.pid {
            Some(pid) => process_control::suspend(pid),
            None => Err(io::Error::other("process already reaped")),
        }
    }

    pub fn resume(&self) -> io::Result<()> {
        match self.pid {
            Some(pid) => process_control::resume(pid),
            None => Err(io::Error::other("process already reaped")),
        }
    }

    /// Ask the process to exit, escalating to a hard kill after the
    /// grace window.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(pid) = self.pid {
            if process_control::interrupt(pid).is_ok() {
                if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                    return status;
                }
                tracing::warn!("ffmpeg ignored termination request, killing");
            }
        }
        self.child.kill().await?;
        self.child.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_out_time_ms_as_progress() {
        let event = classify_stderr_line("out_time_ms=3755250000");
        assert_eq!(
            event,
            StderrEvent::Progress {
                out_time: Duration::from_micros(3_755_250_000)
            }
        );
    }

    #[test]
    fn classifies_out_time_timecode() {
        let event = classify_stderr_line("out_time=01:02:35.250000");
        let StderrEvent::Progress { out_time } = event else {
            panic!("expected progress, got {event:?}");
        };
        assert!((out_time.as_secs_f64() - 3755.25).abs() < 1e-6);
    }

    #[test]
    fn classifies_progress_end() {
        assert_eq!(classify_stderr_line("progress=end"), StderrEvent::PassEnd);
        assert_eq!(classify_stderr_line("progress=continue"), StderrEvent::Noise);
    }

    #[test]
    fn progress_block_noise_stays_out_of_logs() {
        for line in ["frame=100", "fps=25.0", "speed=1.5x", "total_size=1024"] {
            assert_eq!(classify_stderr_line(line), StderrEvent::Noise, "{line}");
        }
    }

    #[test]
    fn diagnostics_become_log_lines() {
        let event = classify_stderr_line("[libx264 @ 0x7f] frame I:12 Avg QP:20.43");
        assert!(matches!(event, StderrEvent::Log(_)));
        // unknown key=value lines are diagnostics, not progress
        let event = classify_stderr_line("Metadata=edit list detected");
        assert!(matches!(event, StderrEvent::Log(_)));
    }

    #[test]
    fn na_out_time_is_tolerated() {
        assert_eq!(classify_stderr_line("out_time_ms=N/A"), StderrEvent::Noise);
    }

    #[test]
    fn parses_timecodes() {
        assert_eq!(
            parse_timecode("00:00:10.5"),
            Some(Duration::from_secs_f64(10.5))
        );
        assert_eq!(parse_timecode("01:00:00"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_timecode("00:99:00"), None);
        assert_eq!(parse_timecode("garbage"), None);
    }

    #[test]
    fn parses_encoder_listing() {
        let sample = "
 V..... libx264        libx264 H.264 / AVC / MPEG-4 AVC
 V....D h264_nvenc     NVIDIA NVENC H.264 encoder
 A..... aac            AAC (Advanced Audio Coding)
 S..... ass            ASS (Advanced SSA) subtitle
";
        let names = parse_encoder_names(sample);
        assert!(names.contains("libx264"));
        assert!(names.contains("h264_nvenc"));
        assert!(names.contains("aac"));
        assert!(!names.contains("ass"));
    }

    #[test]
    fn parses_filter_listing() {
        let sample = "
 scale             V->V       Scale the input video size.
 *sr               V->V       Apply DNN-based image super resolution.
 transpose         V->V       Transpose rows with columns.
";
        let names = parse_filter_names(sample);
        assert!(names.contains("scale"));
        assert!(names.contains("transpose"));
        assert!(!names.contains("sr"));
    }

    #[test]
    fn capability_snapshot_from_listings() {
        let encoders = "
 V..... libx264        libx264
 V....D h264_videotoolbox VideoToolbox H.264
 V....D av1_nvenc      NVIDIA NVENC AV1
";
        let filters = " sr                V->V       DNN super resolution\n";
        let caps = AvailableEncoders::from_listings(encoders, filters);
        assert!(caps.h264_videotoolbox);
        assert!(caps.av1_nvenc);
        assert!(!caps.hevc_nvenc);
        assert!(caps.ml_upscale);
        assert!(caps.supports(VideoCodec::Libx264));
        assert!(caps.supports(VideoCodec::Av1Nvenc));
        assert!(!caps.supports(VideoCodec::HevcNvenc));
    }

    #[test]
    fn metadata_distills_probe_output() {
        let raw = serde_json::json!({
            "streams": [
                {
                    "index": 0,
                    "codec_name": "h264",
                    "codec_type": "video",
                    "profile": "High",
                    "pix_fmt": "yuv420p",
                    "width": 1920,
                    "height": 1080,
                    "avg_frame_rate": "24000/1001"
                },
                {
                    "index": 1,
                    "codec_name": "aac",
                    "codec_type": "audio",
                    "channels": 2,
                    "channel_layout": "stereo",
                    "sample_rate": "48000",
                    "bit_rate": "192000",
                    "tags": { "language": "eng", "title": "Stereo" }
                },
                {
                    "index": 2,
                    "codec_name": "subrip",
                    "codec_type": "subtitle",
                    "tags": { "language": "ger" }
                }
            ],
            "format": {
                "duration": "3600.250000",
                "bit_rate": "5000000",
                "format_name": "matroska,webm",
                "tags": { "title": "Example" }
            }
        });
        let probe: FFprobeOutput = serde_json::from_value(raw).unwrap();
        let meta = SourceMetadata::from_probe(&probe);
        assert_eq!(meta.duration_seconds, Some(3600.25));
        assert_eq!(meta.bitrate, Some(5_000_000));
        let video = meta.video.as_ref().unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));
        assert!((video.frame_rate.unwrap() - 23.976).abs() < 0.001);
        assert_eq!(meta.audio_tracks.len(), 1);
        assert_eq!(meta.audio_tracks[0].index, 0);
        assert_eq!(meta.audio_tracks[0].language.as_deref(), Some("eng"));
        assert_eq!(meta.subtitle_tracks[0].language.as_deref(), Some("ger"));
        assert_eq!(meta.tags.get("title").map(String::as_str), Some("Example"));
    }
}
