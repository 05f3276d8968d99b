//! Deterministic synthesis of the FFmpeg argument vector from a probed
//! source and a normalized [`ConversionConfig`]. No I/O happens here;
//! the plan is built once when a task is queued and never mutated
//! afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::ffmpeg::SourceMetadata;

use super::{
    BitrateMode, Container, ConversionConfig, MetadataMode, Preset, Resolution, Rotation,
    VideoCodec,
};

/// EBU R128 targets shared by both loudnorm passes.
const LOUDNORM_TARGET: &str = "I=-16:LRA=11:TP=-1.5";

/// Everything the supervisor needs to run one conversion: the argv of
/// the first (possibly only) invocation, and enough context to derive
/// the second loudnorm pass once measurements are in.
#[derive(Debug, Clone)]
pub struct ConversionPlan {
    pub output_path: PathBuf,
    pub first_pass: Vec<String>,
    /// Two sequential ffmpeg runs: loudness measurement, then encode.
    pub two_pass: bool,
    pub audio_only: bool,
    input: PathBuf,
    config: ConversionConfig,
    source: SourceMetadata,
}

impl ConversionPlan {
    pub fn duration(&self) -> Option<Duration> {
        self.source.duration()
    }

    /// Argv of the encoding pass, with measured loudness folded into
    /// the filter chain.
    pub fn second_pass(&self, measurement: &LoudnessMeasurement) -> Vec<String> {
        build_args(
            &self.source,
            &self.config,
            &self.input,
            &self.output_path,
            LoudnormStage::Apply(*measurement),
        )
    }
}

/// Build the full conversion plan.
///
/// Normalization runs first, so `build_plan(normalize(c)) ==
/// build_plan(c)`. Fails only when the source carries no stream the
/// configured output can use.
pub fn build_plan(
    source: &SourceMetadata,
    config: &ConversionConfig,
    input: &Path,
    output: &Path,
) -> anyhow::Result<ConversionPlan> {
    let config = config.normalize();
    let audio_only = config.container.is_audio_only();

    if audio_only && !source.has_audio() {
        anyhow::bail!(
            "container {} is audio-only but the source has no audio streams",
            config.container
        );
    }
    if !source.has_audio() && !source.has_video() {
        anyhow::bail!("source has no audio or video streams");
    }

    let two_pass = config.audio_normalize && source.has_audio();
    let first_stage = if two_pass {
        LoudnormStage::Measure
    } else {
        LoudnormStage::Off
    };
    let first_pass = build_args(source, &config, input, output, first_stage);

    Ok(ConversionPlan {
        output_path: output.to_path_buf(),
        first_pass,
        two_pass,
        audio_only,
        input: input.to_path_buf(),
        config,
        source: source.clone(),
    })
}

/// Where the output lands: next to the source, named after the
/// requested stem or `<source>_converted`, with the container's
/// extension.
pub fn resolve_output_path(input: &Path, container: Container, output_name: Option<&str>) -> PathBuf {
    let parent = input.parent().unwrap_or_else(|| Path::new(""));
    let stem = output_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let source_stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "output".to_string());
            format!("{source_stem}_converted")
        });
    parent.join(stem).with_extension(container.extension())
}

#[derive(Debug, Clone, Copy)]
enum LoudnormStage {
    Off,
    Measure,
    Apply(LoudnessMeasurement),
}

fn build_args(
    source: &SourceMetadata,
    config: &ConversionConfig,
    input: &Path,
    output: &Path,
    stage: LoudnormStage,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-progress".into(),
        "pipe:2".into(),
        "-nostats".into(),
    ];

    // Before -i for keyframe-accurate fast seek.
    if let Some(start) = &config.start_time {
        args.push("-ss".into());
        args.push(start.clone());
    }
    if let Some(end) = &config.end_time {
        args.push("-to".into());
        args.push(end.clone());
    }

    args.push("-i".into());
    args.push(input.to_string_lossy().into_owned());

    if let LoudnormStage::Measure = stage {
        // Measurement-only invocation: analyze the first mapped audio
        // track and throw the decode away.
        let track = config.selected_audio_tracks.first().copied().unwrap_or(0);
        args.push("-map".into());
        args.push(format!("0:a:{track}"));
        args.push("-af".into());
        args.push(format!("loudnorm={LOUDNORM_TARGET}:print_format=json"));
        args.push("-f".into());
        args.push("null".into());
        args.push("-".into());
        return args;
    }

    if let Some(burn) = &config.subtitle_burn_path {
        args.push("-i".into());
        args.push(burn.to_string_lossy().into_owned());
    }

    if config.container.is_audio_only() {
        args.push("-vn".into());
        args.push("-sn".into());
    } else if source.has_video() {
        push_video_args(&mut args, source, config);
    }

    if source.has_audio() {
        push_audio_args(&mut args, config, &stage);
    }

    if !config.container.is_audio_only()
        && config.container.supports_soft_subtitles()
        && !source.subtitle_tracks.is_empty()
    {
        if config.selected_subtitle_tracks.is_empty() {
            args.push("-map".into());
            args.push("0:s".into());
        } else {
            for track in &config.selected_subtitle_tracks {
                args.push("-map".into());
                args.push(format!("0:s:{track}"));
            }
        }
        args.push("-c:s".into());
        args.push("copy".into());
    }

    match config.metadata.mode {
        MetadataMode::Preserve => {
            args.push("-map_metadata".into());
            args.push("0".into());
        }
        MetadataMode::Clean => {
            args.push("-map_metadata".into());
            args.push("-1".into());
        }
        MetadataMode::Replace => {
            args.push("-map_metadata".into());
            args.push("-1".into());
            for (key, value) in config.metadata.tags.entries() {
                args.push("-metadata".into());
                args.push(format!("{key}={value}"));
            }
        }
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

fn push_video_args(args: &mut Vec<String>, source: &SourceMetadata, config: &ConversionConfig) {
    args.push("-map".into());
    args.push("0:v:0".into());
    args.push("-c:v".into());
    args.push(config.video_codec.encoder_name().into());

    let bitrate = || format!("{}k", config.video_bitrate);
    match config.video_codec {
        VideoCodec::Libx264 | VideoCodec::Libx265 => {
            args.push("-preset".into());
            args.push(config.preset.as_str().into());
            match config.video_bitrate_mode {
                BitrateMode::Crf => {
                    args.push("-crf".into());
                    args.push(config.crf.to_string());
                }
                BitrateMode::Bitrate => {
                    args.push("-b:v".into());
                    args.push(bitrate());
                }
            }
        }
        VideoCodec::Libsvtav1 => {
            args.push("-preset".into());
            args.push(svtav1_preset(config.preset).into());
            match config.video_bitrate_mode {
                BitrateMode::Crf => {
                    args.push("-crf".into());
                    args.push(config.crf.to_string());
                }
                BitrateMode::Bitrate => {
                    args.push("-b:v".into());
                    args.push(bitrate());
                }
            }
        }
        VideoCodec::Vp9 => match config.video_bitrate_mode {
            BitrateMode::Crf => {
                // Constant quality needs an explicit zero bitrate.
                args.push("-crf".into());
                args.push(config.crf.to_string());
                args.push("-b:v".into());
                args.push("0".into());
            }
            BitrateMode::Bitrate => {
                args.push("-b:v".into());
                args.push(bitrate());
            }
        },
        VideoCodec::Prores => {
            args.push("-profile:v".into());
            args.push(prores_profile(config.quality).into());
        }
        VideoCodec::H264Nvenc | VideoCodec::HevcNvenc | VideoCodec::Av1Nvenc => {
            args.push("-preset".into());
            args.push(config.preset.as_str().into());
            match config.video_bitrate_mode {
                BitrateMode::Crf => {
                    args.push("-rc:v".into());
                    args.push("vbr".into());
                    args.push("-cq:v".into());
                    args.push(nvenc_cq(config.quality).to_string());
                }
                BitrateMode::Bitrate => {
                    args.push("-b:v".into());
                    args.push(bitrate());
                }
            }
            if config.nvenc_spatial_aq {
                args.push("-spatial_aq".into());
                args.push("1".into());
            }
            if config.nvenc_temporal_aq {
                args.push("-temporal_aq".into());
                args.push("1".into());
            }
        }
        VideoCodec::H264VideoToolbox | VideoCodec::HevcVideoToolbox => {
            match config.video_bitrate_mode {
                BitrateMode::Crf => {
                    args.push("-q:v".into());
                    args.push(config.quality.to_string());
                }
                BitrateMode::Bitrate => {
                    args.push("-b:v".into());
                    args.push(bitrate());
                }
            }
            if config.videotoolbox_allow_sw {
                args.push("-allow_sw".into());
                args.push("1".into());
            }
        }
    }

    let filters = build_video_filters(source, config);
    if !filters.is_empty() {
        args.push("-vf".into());
        args.push(filters.join(","));
    }
}

fn push_audio_args(args: &mut Vec<String>, config: &ConversionConfig, stage: &LoudnormStage) {
    if config.selected_audio_tracks.is_empty() {
        args.push("-map".into());
        args.push("0:a".into());
    } else {
        for track in &config.selected_audio_tracks {
            args.push("-map".into());
            args.push(format!("0:a:{track}"));
        }
    }
    args.push("-c:a".into());
    args.push(config.audio_codec.encoder_name().into());
    if !config.audio_codec.is_lossless() {
        args.push("-b:a".into());
        args.push(format!("{}k", config.audio_bitrate));
    }
    if let Some(channels) = config.audio_channels {
        args.push("-ac".into());
        args.push(channels.to_string());
    }

    let mut audio_filters = Vec::new();
    if (config.audio_volume - 1.0).abs() > f64::EPSILON {
        audio_filters.push(format!("volume={}", config.audio_volume));
    }
    if let LoudnormStage::Apply(m) = stage {
        audio_filters.push(format!(
            "loudnorm={LOUDNORM_TARGET}:measured_I={}:measured_LRA={}:measured_TP={}:measured_thresh={}:offset={}:linear=true",
            m.input_i, m.input_lra, m.input_tp, m.input_thresh, m.target_offset
        ));
    }
    if !audio_filters.is_empty() {
        args.push("-af".into());
        args.push(audio_filters.join(","));
    }
}

/// Filter graph in fixed order:
/// crop, rotation, flips, scale, pad, fps, subtitle burn-in.
fn build_video_filters(source: &SourceMetadata, config: &ConversionConfig) -> Vec<String> {
    let mut filters = Vec::new();

    if let Some(crop) = &config.crop {
        filters.push(format!(
            "crop={}:{}:{}:{}",
            crop.width, crop.height, crop.x, crop.y
        ));
    }

    match config.rotation {
        Rotation::None => {}
        Rotation::Clockwise90 => filters.push("transpose=1".into()),
        Rotation::Half => {
            filters.push("transpose=1".into());
            filters.push("transpose=1".into());
        }
        Rotation::CounterClockwise90 => filters.push("transpose=2".into()),
    }

    if config.flip_horizontal {
        filters.push("hflip".into());
    }
    if config.flip_vertical {
        filters.push("vflip".into());
    }

    let flags = config.scaling_algorithm.flags();
    match config.resolution {
        Resolution::Original => {}
        Resolution::Custom => match (config.custom_width, config.custom_height) {
            (Some(width), Some(height)) => {
                // Fit inside the box preserving source aspect ratio,
                // centered on a black canvas.
                if fits_by_width(source, config, width, height) {
                    filters.push(format!("scale={width}:-2:flags={flags}"));
                } else {
                    filters.push(format!("scale=-2:{height}:flags={flags}"));
                }
                filters.push(format!("pad={width}:{height}:(ow-iw)/2:(oh-ih)/2:black"));
            }
            (Some(width), None) => filters.push(format!("scale={width}:-2:flags={flags}")),
            (None, Some(height)) => filters.push(format!("scale=-2:{height}:flags={flags}")),
            (None, None) => {}
        },
        preset => {
            if let Some(height) = preset.target_height() {
                filters.push(format!("scale=-2:{height}:flags={flags}"));
            }
        }
    }

    if let Some(fps) = config.fps.value() {
        filters.push(format!("fps={fps}"));
    }

    if let Some(burn) = &config.subtitle_burn_path {
        filters.push(format!(
            "subtitles={}",
            escape_subtitle_path(&burn.to_string_lossy())
        ));
    }

    filters
}

/// Whether the source is wider than the target box, accounting for an
/// orientation-swapping rotation.
fn fits_by_width(
    source: &SourceMetadata,
    config: &ConversionConfig,
    width: u32,
    height: u32,
) -> bool {
    let Some(video) = &source.video else {
        return true;
    };
    let (mut src_w, mut src_h) = (video.width.max(1) as f64, video.height.max(1) as f64);
    if matches!(
        config.rotation,
        Rotation::Clockwise90 | Rotation::CounterClockwise90
    ) {
        std::mem::swap(&mut src_w, &mut src_h);
    }
    src_w / src_h >= width as f64 / height as f64
}

/// Escape a path for the subtitles filter: backslashes and colons are
/// filter-option syntax (Windows drive letters hit both).
fn escape_subtitle_path(path: &str) -> String {
    let escaped = path.replace('\\', r"\\").replace(':', r"\:");
    format!("'{escaped}'")
}

/// Map the quality slider onto NVENC's constant-quality scale, where
/// lower is better.
fn nvenc_cq(quality: u32) -> u32 {
    (52.0 - quality as f64 / 2.0).round().clamp(1.0, 51.0) as u32
}

/// Quality slider buckets for prores_ks profiles.
fn prores_profile(quality: u32) -> &'static str {
    match quality {
        85.. => "3",
        60.. => "2",
        35.. => "1",
        _ => "0",
    }
}

/// SVT-AV1 takes numeric presets; bucket the x264 vocabulary onto its
/// 0..13 scale.
fn svtav1_preset(preset: Preset) -> &'static str {
    match preset {
        Preset::Ultrafast => "12",
        Preset::Superfast => "11",
        Preset::Veryfast => "10",
        Preset::Faster => "9",
        Preset::Fast => "8",
        Preset::Medium => "6",
        Preset::Slow => "4",
        Preset::Slower => "2",
        Preset::Veryslow => "1",
    }
}

fn de_f64_from_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.trim().parse().map_err(serde::de::Error::custom)
}

/// Measured loudness values printed by pass 1, fed into pass 2.
/// FFmpeg prints every number as a JSON string.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LoudnessMeasurement {
    #[serde(deserialize_with = "de_f64_from_string")]
    pub input_i: f64,
    #[serde(deserialize_with = "de_f64_from_string")]
    pub input_tp: f64,
    #[serde(deserialize_with = "de_f64_from_string")]
    pub input_lra: f64,
    #[serde(deserialize_with = "de_f64_from_string")]
    pub input_thresh: f64,
    #[serde(deserialize_with = "de_f64_from_string")]
    pub target_offset: f64,
}

impl LoudnessMeasurement {
    /// Extract the measurement block from the stderr tail of pass 1.
    /// The JSON object is the last `{ ... }` block ffmpeg prints.
    pub fn from_stderr_tail(lines: &[String]) -> Option<Self> {
        let joined = lines.join("\n");
        let start = joined.rfind('{')?;
        let end = joined[start..].find('}')? + start;
        serde_json::from_str(&joined[start..=end]).ok()
    }
}
