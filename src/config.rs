use std::{
    any::{Any, TypeId},
    collections::HashMap,
    env::consts::EXE_SUFFIX,
    path::PathBuf,
    sync::{LazyLock, Mutex},
};

use anyhow::Context;
use clap::Parser;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::orchestrator::Error;

pub static CONFIG: LazyLock<ConfigStore> = LazyLock::new(ConfigStore::new);

/// Target triple the binary was built for, stamped in by the build script.
/// Sidecar executables carry it as a file name suffix.
pub const TARGET_TRIPLE: &str = env!("TARGET");

/// A single typed configuration setting.
///
/// Resolution order is environment > cli > config file > default.
pub trait ConfigValue:
    'static + Send + Sync + Default + Clone + Serialize + DeserializeOwned
{
    /// Key of this setting in the toml config file.
    const KEY: &'static str;
    const ENV_KEY: Option<&'static str> = None;

    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ConfigStore {
    file: Mutex<toml::Table>,
    cli: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl ConfigStore {
    fn new() -> Self {
        Self::default()
    }

    /// Replace the config-file layer with freshly read settings.
    pub fn apply_toml_settings(&self, table: toml::Table) {
        *self.file.lock().unwrap() = table;
    }

    pub fn set_cli_value<T: ConfigValue>(&self, value: T) {
        self.cli
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Resolve a setting. Invalid layers are skipped with a warning so a
    /// malformed config file can never take the process down.
    pub fn get_value<T: ConfigValue>(&self) -> T {
        if let Some(value) = self.env_value::<T>() {
            return value;
        }
        if let Some(value) = self.cli.lock().unwrap().get(&TypeId::of::<T>()) {
            let value = value.downcast_ref::<T>().expect("cli layer stores T by TypeId");
            return value.clone();
        }
        if let Some(value) = self.file.lock().unwrap().get(T::KEY) {
            match value.clone().try_into::<T>() {
                Ok(value) if value.validate().is_ok() => return value,
                Ok(_) => tracing::warn!("Config value {} failed validation", T::KEY),
                Err(e) => tracing::warn!("Config value {} has wrong shape: {e}", T::KEY),
            }
        }
        T::default()
    }

    fn env_value<T: ConfigValue>(&self) -> Option<T> {
        let raw = std::env::var(T::ENV_KEY?).ok()?;
        // Numbers and bools come in undecorated, everything else is a string.
        let value = raw
            .parse::<i64>()
            .map(toml::Value::from)
            .or_else(|_| raw.parse::<bool>().map(toml::Value::from))
            .unwrap_or_else(|_| toml::Value::String(raw));
        value.try_into().ok().filter(|v: &T| v.validate().is_ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port(pub u16);

impl Default for Port {
    fn default() -> Self {
        Self(8723)
    }
}

impl ConfigValue for Port {
    const KEY: &'static str = "port";
    const ENV_KEY: Option<&'static str> = Some("MEDIA_CONVERTER_PORT");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxConcurrency(pub usize);

impl Default for MaxConcurrency {
    fn default() -> Self {
        Self(2)
    }
}

impl ConfigValue for MaxConcurrency {
    const KEY: &'static str = "max_concurrency";
    const ENV_KEY: Option<&'static str> = Some("MEDIA_CONVERTER_MAX_CONCURRENCY");

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.0 >= 1, "max_concurrency must be at least 1");
        Ok(())
    }
}

/// Directory holding the ffmpeg / ffprobe sidecars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinariesDir(pub PathBuf);

impl Default for BinariesDir {
    fn default() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));
        Self(exe_dir.unwrap_or_else(|| PathBuf::from(".")).join("binaries"))
    }
}

impl ConfigValue for BinariesDir {
    const KEY: &'static str = "binaries_dir";
    const ENV_KEY: Option<&'static str> = Some("MEDIA_CONVERTER_BINARIES");
}

/// Explicit ffmpeg override, bypassing sidecar discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FFmpegPath(pub Option<PathBuf>);

impl ConfigValue for FFmpegPath {
    const KEY: &'static str = "ffmpeg_path";
    const ENV_KEY: Option<&'static str> = Some("MEDIA_CONVERTER_FFMPEG");
}

/// Explicit ffprobe override, bypassing sidecar discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FFprobePath(pub Option<PathBuf>);

impl ConfigValue for FFprobePath {
    const KEY: &'static str = "ffprobe_path";
    const ENV_KEY: Option<&'static str> = Some("MEDIA_CONVERTER_FFPROBE");
}

pub fn sidecar_file_name(base: &str) -> String {
    format!("{base}-{TARGET_TRIPLE}{EXE_SUFFIX}")
}

pub fn ffmpeg_path() -> PathBuf {
    let FFmpegPath(explicit) = CONFIG.get_value();
    explicit.unwrap_or_else(|| {
        let BinariesDir(dir) = CONFIG.get_value();
        dir.join(sidecar_file_name("ffmpeg"))
    })
}

pub fn ffprobe_path() -> PathBuf {
    let FFprobePath(explicit) = CONFIG.get_value();
    explicit.unwrap_or_else(|| {
        let BinariesDir(dir) = CONFIG.get_value();
        dir.join(sidecar_file_name("ffprobe"))
    })
}

/// Resolved sidecar locations, checked once at startup.
#[derive(Debug, Clone)]
pub struct Sidecars {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Sidecars {
    /// Locate both sidecars. The orchestrator refuses to start when
    /// either one is missing.
    pub fn locate() -> Result<Self, Error> {
        let ffmpeg = ffmpeg_path();
        let ffprobe = ffprobe_path();
        for path in [&ffmpeg, &ffprobe] {
            if !path.is_file() {
                return Err(Error::BinaryMissing(path.clone()));
            }
        }
        Ok(Self { ffmpeg, ffprobe })
    }
}

pub struct AppResources;

impl AppResources {
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("media-converter")
    }

    pub fn config_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    pub fn initiate() -> anyhow::Result<()> {
        std::fs::create_dir_all(Self::data_dir()).context("create app data directory")?;
        Ok(())
    }
}

pub struct ConfigFile;

impl ConfigFile {
    pub async fn open_and_read() -> anyhow::Result<toml::Table> {
        let path = AppResources::config_path();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read config file: {}", path.display()))?;
        contents.parse().context("parse config file")
    }
}

#[derive(Debug, Parser)]
#[command(name = "media-converter", about = "Media conversion orchestrator")]
pub struct Args {
    /// Port the HTTP/SSE boundary listens on
    #[arg(long)]
    pub port: Option<u16>,
    /// How many conversions may run at once
    #[arg(long)]
    pub max_concurrency: Option<usize>,
    /// Directory holding the ffmpeg/ffprobe sidecars
    #[arg(long)]
    pub binaries_dir: Option<PathBuf>,
    /// Explicit ffmpeg binary, bypassing sidecar discovery
    #[arg(long)]
    pub ffmpeg_path: Option<PathBuf>,
    /// Explicit ffprobe binary, bypassing sidecar discovery
    #[arg(long)]
    pub ffprobe_path: Option<PathBuf>,
}

impl Args {
    pub fn apply_configuration(self) {
        if let Some(port) = self.port {
            CONFIG.set_cli_value(Port(port));
        }
        if let Some(n) = self.max_concurrency {
            CONFIG.set_cli_value(MaxConcurrency(n));
        }
        if let Some(dir) = self.binaries_dir {
            CONFIG.set_cli_value(BinariesDir(dir));
        }
        if let Some(path) = self.ffmpeg_path {
            CONFIG.set_cli_value(FFmpegPath(Some(path)));
        }
        if let Some(path) = self.ffprobe_path {
            CONFIG.set_cli_value(FFprobePath(Some(path)));
        }
    }
}
