//! Declarative description of one conversion and the normalization
//! rules that keep it legal for the selected container and encoder.

use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod args;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mkv,
    Webm,
    Mov,
    Mp3,
    M4a,
    Wav,
    Flac,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Mov => "mov",
            Container::Mp3 => "mp3",
            Container::M4a => "m4a",
            Container::Wav => "wav",
            Container::Flac => "flac",
        }
    }

    pub fn is_audio_only(&self) -> bool {
        matches!(
            self,
            Container::Mp3 | Container::M4a | Container::Wav | Container::Flac
        )
    }

    pub fn supports_soft_subtitles(&self) -> bool {
        matches!(self, Container::Mp4 | Container::Mkv | Container::Mov)
    }

    /// Legal video codecs in fallback order: the first entry is what an
    /// illegal selection is rewritten to.
    pub fn legal_video_codecs(&self) -> &'static [VideoCodec] {
        use VideoCodec::*;
        match self {
            Container::Mp4 => &[
                Libx264,
                Libx265,
                Vp9,
                Libsvtav1,
                H264VideoToolbox,
                HevcVideoToolbox,
                H264Nvenc,
                HevcNvenc,
                Av1Nvenc,
            ],
            Container::Mkv => &[
                Libx264,
                Libx265,
                Vp9,
                Libsvtav1,
                Prores,
                H264VideoToolbox,
                HevcVideoToolbox,
                H264Nvenc,
                HevcNvenc,
                Av1Nvenc,
            ],
            Container::Webm => &[Vp9],
            Container::Mov => &[
                Libx264,
                Libx265,
                Prores,
                H264VideoToolbox,
                HevcVideoToolbox,
                H264Nvenc,
                HevcNvenc,
            ],
            _ => &[],
        }
    }

    /// Legal audio codecs in fallback order.
    pub fn legal_audio_codecs(&self) -> &'static [AudioCodec] {
        use AudioCodec::*;
        match self {
            Container::Mp3 => &[Mp3],
            Container::Wav => &[PcmS16le],
            Container::Flac => &[Flac],
            Container::M4a => &[Aac, Alac],
            Container::Mp4 => &[Aac, Ac3, LibOpus, Mp3, Alac],
            Container::Mov | Container::Mkv => &[Aac, Ac3, LibOpus, Mp3, Alac, Flac, PcmS16le],
            Container::Webm => &[LibOpus],
        }
    }
}

impl Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    Libx264,
    Libx265,
    Vp9,
    Prores,
    Libsvtav1,
    #[serde(rename = "h264_videotoolbox")]
    H264VideoToolbox,
    #[serde(rename = "h264_nvenc")]
    H264Nvenc,
    #[serde(rename = "hevc_videotoolbox")]
    HevcVideoToolbox,
    #[serde(rename = "hevc_nvenc")]
    HevcNvenc,
    #[serde(rename = "av1_nvenc")]
    Av1Nvenc,
}

impl VideoCodec {
    /// Encoder name passed to `-c:v`.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            VideoCodec::Libx264 => "libx264",
            VideoCodec::Libx265 => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Prores => "prores_ks",
            VideoCodec::Libsvtav1 => "libsvtav1",
            VideoCodec::H264VideoToolbox => "h264_videotoolbox",
            VideoCodec::H264Nvenc => "h264_nvenc",
            VideoCodec::HevcVideoToolbox => "hevc_videotoolbox",
            VideoCodec::HevcNvenc => "hevc_nvenc",
            VideoCodec::Av1Nvenc => "av1_nvenc",
        }
    }

    pub fn is_nvenc(&self) -> bool {
        matches!(
            self,
            VideoCodec::H264Nvenc | VideoCodec::HevcNvenc | VideoCodec::Av1Nvenc
        )
    }

    pub fn is_videotoolbox(&self) -> bool {
        matches!(
            self,
            VideoCodec::H264VideoToolbox | VideoCodec::HevcVideoToolbox
        )
    }

    pub fn is_hardware(&self) -> bool {
        self.is_nvenc() || self.is_videotoolbox()
    }
}

impl Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encoder_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Ac3,
    #[serde(rename = "libopus")]
    LibOpus,
    Mp3,
    Alac,
    Flac,
    #[serde(rename = "pcm_s16le")]
    PcmS16le,
}

impl AudioCodec {
    /// Encoder name passed to `-c:a`.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Ac3 => "ac3",
            AudioCodec::LibOpus => "libopus",
            // ffmpeg resolves the codec name to its default encoder
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Alac => "alac",
            AudioCodec::Flac => "flac",
            AudioCodec::PcmS16le => "pcm_s16le",
        }
    }

    /// Lossless codecs never get a `-b:a`.
    pub fn is_lossless(&self) -> bool {
        matches!(
            self,
            AudioCodec::Alac | AudioCodec::Flac | AudioCodec::PcmS16le
        )
    }
}

impl Display for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encoder_name())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Superfast => "superfast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Slower => "slower",
            Preset::Veryslow => "veryslow",
        }
    }

    /// NVENC only understands a reduced preset vocabulary.
    pub fn legal_for_nvenc(&self) -> bool {
        matches!(self, Preset::Fast | Preset::Medium | Preset::Slow)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[default]
    Original,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    Custom,
}

impl Resolution {
    pub fn target_height(&self) -> Option<u32> {
        match self {
            Resolution::P1080 => Some(1080),
            Resolution::P720 => Some(720),
            Resolution::P480 => Some(480),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ScalingAlgorithm {
    #[default]
    Bicubic,
    Lanczos,
    Bilinear,
    Nearest,
}

impl ScalingAlgorithm {
    /// Value of the scale filter's `flags` option.
    pub fn flags(&self) -> &'static str {
        match self {
            ScalingAlgorithm::Bicubic => "bicubic",
            ScalingAlgorithm::Lanczos => "lanczos",
            ScalingAlgorithm::Bilinear => "bilinear",
            ScalingAlgorithm::Nearest => "neighbor",
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
pub enum Fps {
    #[default]
    #[serde(rename = "original")]
    Original,
    #[serde(rename = "24")]
    F24,
    #[serde(rename = "30")]
    F30,
    #[serde(rename = "60")]
    F60,
}

impl Fps {
    pub fn value(&self) -> Option<u32> {
        match self {
            Fps::Original => None,
            Fps::F24 => Some(24),
            Fps::F30 => Some(30),
            Fps::F60 => Some(60),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Half,
    CounterClockwise90,
}

impl TryFrom<u32> for Rotation {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Clockwise90),
            180 => Ok(Rotation::Half),
            270 => Ok(Rotation::CounterClockwise90),
            other => Err(format!("rotation must be one of 0/90/180/270, got {other}")),
        }
    }
}

impl From<Rotation> for u32 {
    fn from(value: Rotation) -> Self {
        match value {
            Rotation::None => 0,
            Rotation::Clockwise90 => 90,
            Rotation::Half => 180,
            Rotation::CounterClockwise90 => 270,
        }
    }
}

/// Pixel rectangle in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum MetadataMode {
    #[default]
    Preserve,
    Clean,
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MetadataTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub date: Option<String>,
    pub comment: Option<String>,
}

impl MetadataTags {
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("title", &self.title),
            ("artist", &self.artist),
            ("album", &self.album),
            ("genre", &self.genre),
            ("date", &self.date),
            ("comment", &self.comment),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MetadataConfig {
    #[serde(default)]
    pub mode: MetadataMode,
    #[serde(default)]
    pub tags: MetadataTags,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    #[default]
    Crf,
    Bitrate,
}

/// The user's conversion intent, snapshotted per task.
///
/// Unknown fields are rejected so schema drift between UI and backend
/// fails loudly instead of silently dropping options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct ConversionConfig {
    pub container: Container,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub video_bitrate_mode: BitrateMode,
    /// Constant rate factor for software encoders, 0..=51.
    pub crf: u8,
    /// Hardware encoder quality slider, 1..=100, higher is better.
    pub quality: u32,
    /// kbps, used when `video_bitrate_mode` is `bitrate`.
    pub video_bitrate: u32,
    pub preset: Preset,
    pub resolution: Resolution,
    pub custom_width: Option<u32>,
    pub custom_height: Option<u32>,
    pub scaling_algorithm: ScalingAlgorithm,
    pub fps: Fps,
    pub rotation: Rotation,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub crop: Option<CropRect>,
    /// `HH:MM:SS[.fraction]` timecodes applied before the input.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// kbps, skipped for lossless codecs.
    pub audio_bitrate: u32,
    /// Downmix target; `None` keeps the source layout.
    pub audio_channels: Option<u8>,
    /// Linear gain, 0.0..=2.0.
    pub audio_volume: f64,
    /// EBU R128 two-pass loudness normalization.
    pub audio_normalize: bool,
    /// Audio stream positions to keep; empty keeps all.
    pub selected_audio_tracks: Vec<u32>,
    /// Subtitle stream positions to copy; empty keeps all.
    pub selected_subtitle_tracks: Vec<u32>,
    /// External subtitle file hard-burned into the video.
    #[schema(value_type = Option<String>)]
    pub subtitle_burn_path: Option<PathBuf>,
    pub metadata: MetadataConfig,
    pub nvenc_spatial_aq: bool,
    pub nvenc_temporal_aq: bool,
    pub videotoolbox_allow_sw: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            container: Container::Mp4,
            video_codec: VideoCodec::Libx264,
            audio_codec: AudioCodec::Aac,
            video_bitrate_mode: BitrateMode::Crf,
            crf: 23,
            quality: 50,
            video_bitrate: 5000,
            preset: Preset::Medium,
            resolution: Resolution::Original,
            custom_width: None,
            custom_height: None,
            scaling_algorithm: ScalingAlgorithm::Bicubic,
            fps: Fps::Original,
            rotation: Rotation::None,
            flip_horizontal: false,
            flip_vertical: false,
            crop: None,
            start_time: None,
            end_time: None,
            audio_bitrate: 128,
            audio_channels: None,
            audio_volume: 1.0,
            audio_normalize: false,
            selected_audio_tracks: Vec::new(),
            selected_subtitle_tracks: Vec::new(),
            subtitle_burn_path: None,
            metadata: MetadataConfig::default(),
            nvenc_spatial_aq: false,
            nvenc_temporal_aq: false,
            videotoolbox_allow_sw: false,
        }
    }
}

impl ConversionConfig {
    /// Rewrite the config into a legal one. Idempotent; never fails.
    ///
    /// This is the single point resolving the container/codec/preset
    /// compatibility matrix: illegal selections fall back to the first
    /// legal value instead of erroring.
    pub fn normalize(&self) -> Self {
        let mut config = self.clone();

        let legal_video = config.container.legal_video_codecs();
        if !legal_video.is_empty() && !legal_video.contains(&config.video_codec) {
            config.video_codec = legal_video[0];
        }
        let legal_audio = config.container.legal_audio_codecs();
        if !legal_audio.contains(&config.audio_codec) {
            config.audio_codec = legal_audio[0];
        }

        if config.video_codec.is_nvenc() && !config.preset.legal_for_nvenc() {
            config.preset = Preset::Medium;
        }

        config.crf = config.crf.min(51);
        config.quality = config.quality.clamp(1, 100);
        config.audio_volume = if config.audio_volume.is_finite() {
            config.audio_volume.clamp(0.0, 2.0)
        } else {
            1.0
        };

        if config.container.is_audio_only() {
            config.selected_subtitle_tracks.clear();
            config.subtitle_burn_path = None;
        }

        if !config.video_codec.is_nvenc() {
            config.nvenc_spatial_aq = false;
            config.nvenc_temporal_aq = false;
        }
        if !config.video_codec.is_videotoolbox() {
            config.videotoolbox_allow_sw = false;
        }

        config
    }

    /// Reject genuinely malformed input that normalization cannot fix.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resolution == Resolution::Custom
            && self.custom_width.is_none()
            && self.custom_height.is_none()
        {
            anyhow::bail!("custom resolution requires a width or a height");
        }
        for dim in [self.custom_width, self.custom_height].into_iter().flatten() {
            anyhow::ensure!(dim > 0, "resolution dimensions cannot be zero");
        }
        if let Some(crop) = &self.crop {
            anyhow::ensure!(
                crop.width > 0 && crop.height > 0,
                "crop rectangle cannot be empty"
            );
        }
        let parse = |label: &str, value: &Option<String>| -> anyhow::Result<Option<f64>> {
            match value.as_deref() {
                None => Ok(None),
                Some(raw) => match crate::ffmpeg::parse_timecode(raw) {
                    Some(t) => Ok(Some(t.as_secs_f64())),
                    None => anyhow::bail!("invalid {label} timecode: {raw}"),
                },
            }
        };
        let start = parse("start", &self.start_time)?;
        let end = parse("end", &self.end_time)?;
        if let (Some(start), Some(end)) = (start, end) {
            anyhow::ensure!(end > start, "end time must be after start time");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let configs = [
            ConversionConfig::default(),
            ConversionConfig {
                container: Container::Webm,
                video_codec: VideoCodec::Libx264,
                audio_codec: AudioCodec::Aac,
                ..Default::default()
            },
            ConversionConfig {
                container: Container::Mp3,
                video_codec: VideoCodec::Libx264,
                audio_codec: AudioCodec::Flac,
                selected_subtitle_tracks: vec![0, 1],
                ..Default::default()
            },
            ConversionConfig {
                video_codec: VideoCodec::H264Nvenc,
                preset: Preset::Veryslow,
                crf: 99,
                audio_volume: 7.5,
                ..Default::default()
            },
        ];
        for config in configs {
            let once = config.normalize();
            assert_eq!(once, once.normalize());
        }
    }

    #[test]
    fn audio_only_container_rewrites_codecs() {
        let config = ConversionConfig {
            container: Container::Mp3,
            video_codec: VideoCodec::Libx264,
            audio_codec: AudioCodec::Flac,
            ..Default::default()
        };
        let normalized = config.normalize();
        assert_eq!(normalized.audio_codec, AudioCodec::Mp3);
        assert!(normalized.container.legal_video_codecs().is_empty());
    }

    #[test]
    fn audio_only_container_zeroes_subtitle_fields() {
        let config = ConversionConfig {
            container: Container::Flac,
            selected_subtitle_tracks: vec![0],
            subtitle_burn_path: Some("subs.srt".into()),
            ..Default::default()
        };
        let normalized = config.normalize();
        assert!(normalized.selected_subtitle_tracks.is_empty());
        assert!(normalized.subtitle_burn_path.is_none());
    }

    #[test]
    fn nvenc_preset_coercion() {
        let config = ConversionConfig {
            video_codec: VideoCodec::H264Nvenc,
            preset: Preset::Veryslow,
            ..Default::default()
        };
        assert_eq!(config.normalize().preset, Preset::Medium);

        let config = ConversionConfig {
            video_codec: VideoCodec::HevcNvenc,
            preset: Preset::Slow,
            ..Default::default()
        };
        assert_eq!(config.normalize().preset, Preset::Slow);
    }

    #[test]
    fn webm_only_allows_vp9_and_opus() {
        let config = ConversionConfig {
            container: Container::Webm,
            video_codec: VideoCodec::Libx265,
            audio_codec: AudioCodec::Mp3,
            ..Default::default()
        };
        let normalized = config.normalize();
        assert_eq!(normalized.video_codec, VideoCodec::Vp9);
        assert_eq!(normalized.audio_codec, AudioCodec::LibOpus);
    }

    #[test]
    fn hardware_toggles_cleared_for_software_encoders() {
        let config = ConversionConfig {
            video_codec: VideoCodec::Libx264,
            nvenc_spatial_aq: true,
            nvenc_temporal_aq: true,
            videotoolbox_allow_sw: true,
            ..Default::default()
        };
        let normalized = config.normalize();
        assert!(!normalized.nvenc_spatial_aq);
        assert!(!normalized.nvenc_temporal_aq);
        assert!(!normalized.videotoolbox_allow_sw);
    }

    #[test]
    fn prores_falls_back_outside_mkv_and_mov() {
        let config = ConversionConfig {
            container: Container::Mp4,
            video_codec: VideoCodec::Prores,
            ..Default::default()
        };
        assert_eq!(config.normalize().video_codec, VideoCodec::Libx264);

        let config = ConversionConfig {
            container: Container::Mov,
            video_codec: VideoCodec::Prores,
            ..Default::default()
        };
        assert_eq!(config.normalize().video_codec, VideoCodec::Prores);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = serde_json::json!({
            "container": "mp4",
            "upscaleFactor": 2
        });
        let parsed: Result<ConversionConfig, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = ConversionConfig {
            container: Container::Mkv,
            video_codec: VideoCodec::HevcNvenc,
            rotation: Rotation::Clockwise90,
            fps: Fps::F30,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"hevc_nvenc\""));
        assert!(json.contains("\"rotation\":90"));
        assert!(json.contains("\"fps\":\"30\""));
        let back: ConversionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn validate_rejects_bad_timecodes_and_empty_custom() {
        let config = ConversionConfig {
            start_time: Some("nonsense".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ConversionConfig {
            resolution: Resolution::Custom,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ConversionConfig {
            start_time: Some("00:10:00".into()),
            end_time: Some("00:05:00".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
