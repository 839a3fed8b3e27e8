use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub const DEFAULT_MCU: &str = "esp32";
pub const DEFAULT_APP_OFFSET: u32 = 0x10000;
pub const DEFAULT_UPLOAD_PROTOCOL: &str = "esptool";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read board descriptor {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse board descriptor: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid flash size '{0}'")]
    InvalidFlashSize(String),
}

/// Read-only description of one target board, loaded once per invocation.
///
/// The descriptor is a TOML document whose tables mirror the board keys:
///
/// ```toml
/// name = "esp32dev"
///
/// [build]
/// mcu = "esp32"
/// variant = "esp32"
/// partitions = "huge_app.csv"
///
/// [upload]
/// flash_size = "4MB"
/// speed = 921600
///
/// [debug.tools.esp-prog.server]
/// arguments = ["-f", "$PACKAGE_DIR/share/openocd/scripts/interface/ftdi/esp32_devkitj_v1.cfg"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub name: String,
    pub build: BuildSection,
    pub upload: UploadSection,
    pub debug: DebugSection,
}

impl BoardConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn mcu(&self) -> &str {
        &self.build.mcu
    }

    pub fn variant(&self) -> Option<&str> {
        non_empty(self.build.variant.as_deref())
    }

    /// The custom partition table name, treating an empty value as unset.
    pub fn partitions_name(&self) -> Option<&str> {
        non_empty(self.build.partitions.as_deref())
    }

    pub fn custom_bootloader(&self) -> Option<&str> {
        non_empty(self.build.custom_bootloader.as_deref())
    }

    pub fn flash_size(&self) -> FlashSize {
        self.upload.flash_size
    }

    pub fn app_offset(&self) -> u32 {
        self.upload.offset.unwrap_or(DEFAULT_APP_OFFSET)
    }

    pub fn upload_protocol(&self) -> &str {
        non_empty(self.upload.protocol.as_deref()).unwrap_or(DEFAULT_UPLOAD_PROTOCOL)
    }

    pub fn debug_tool(&self, name: &str) -> Option<&DebugTool> {
        self.debug.tools.get(name)
    }

    /// Whether the selected partition scheme reserves room for a TinyUF2 bootloader.
    pub fn uses_tinyuf2(&self) -> bool {
        self.partitions_name()
            .map_or(false, |name| name.ends_with("tinyuf2.csv"))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    #[default]
    Arduino,
    Espidf,
}

impl Framework {
    /// Name of the precompiled framework archive, without the `lib` prefix and `.a` suffix.
    pub fn library_name(&self) -> &'static str {
        match self {
            Framework::Arduino => "espforge_arduino",
            Framework::Espidf => "espforge_espidf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreSource {
    #[default]
    Precompiled,
    Source,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub mcu: String,
    pub variant: Option<String>,
    pub variants_dir: Option<PathBuf>,
    pub partitions: Option<String>,
    pub flash_mode: String,
    pub f_flash: u64,
    pub f_image: Option<u64>,
    pub f_boot: Option<u64>,
    pub boot: Option<String>,
    pub memory_type: Option<String>,
    pub custom_bootloader: Option<String>,
    pub framework: Framework,
    pub core: CoreSource,
    pub hwids: Vec<[String; 2]>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            mcu: DEFAULT_MCU.to_string(),
            variant: None,
            variants_dir: None,
            partitions: None,
            flash_mode: "dio".to_string(),
            f_flash: 40_000_000,
            f_image: None,
            f_boot: None,
            boot: None,
            memory_type: None,
            custom_bootloader: None,
            framework: Framework::default(),
            core: CoreSource::default(),
            hwids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    pub flash_size: FlashSize,
    pub speed: u32,
    #[serde(deserialize_with = "deserialize_opt_hex_u32")]
    pub offset: Option<u32>,
    pub protocol: Option<String>,
    pub before_reset: String,
    pub after_reset: String,
    pub use_1200bps_touch: bool,
    pub wait_for_upload_port: bool,
    pub maximum_size: Option<u64>,
    pub maximum_ram_size: Option<u64>,
    pub extra_images: Vec<ExtraImage>,
    pub tinyuf2_image: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_opt_hex_u32")]
    pub uf2_bootloader_offset: Option<u32>,
    pub command: Option<String>,
    #[serde(deserialize_with = "deserialize_opt_hex_u32")]
    pub fs_offset: Option<u32>,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            flash_size: FlashSize::default(),
            speed: 460_800,
            offset: None,
            protocol: None,
            before_reset: "default_reset".to_string(),
            after_reset: "hard_reset".to_string(),
            use_1200bps_touch: false,
            wait_for_upload_port: false,
            maximum_size: None,
            maximum_ram_size: None,
            extra_images: Vec::new(),
            tinyuf2_image: None,
            uf2_bootloader_offset: None,
            command: None,
            fs_offset: None,
        }
    }
}

/// A board-declared image written after the fixed entries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtraImage {
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub offset: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugSection {
    /// Adapter speed in kHz
    pub speed: u32,
    pub tools: BTreeMap<String, DebugTool>,
}

impl Default for DebugSection {
    fn default() -> Self {
        Self {
            speed: 5000,
            tools: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugTool {
    pub server: DebugServer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugServer {
    pub arguments: Vec<String>,
}

/// Flash capacity of the target, parsed from values such as `4MB` or `512KB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlashSize(u64);

impl FlashSize {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;

    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl Default for FlashSize {
    fn default() -> Self {
        Self(4 * Self::MIB)
    }
}

impl FromStr for FlashSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidFlashSize(s.to_string());
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();

        let (digits, unit) = if let Some(d) = upper.strip_suffix("MB").or(upper.strip_suffix('M')) {
            (d, Self::MIB)
        } else if let Some(d) = upper.strip_suffix("KB").or(upper.strip_suffix('K')) {
            (d, Self::KIB)
        } else {
            return parse_u64(trimmed).map(Self).ok_or_else(invalid);
        };

        let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
        if value == 0 {
            return Err(invalid());
        }
        Ok(Self(value * unit))
    }
}

impl fmt::Display for FlashSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % Self::MIB == 0 {
            write!(f, "{}MB", self.0 / Self::MIB)
        } else if self.0 % Self::KIB == 0 {
            write!(f, "{}KB", self.0 / Self::KIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl<'de> Deserialize<'de> for FlashSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match HexOrInt::deserialize(deserializer)? {
            HexOrInt::Int(n) => Ok(Self(n)),
            HexOrInt::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HexOrInt {
    Int(u64),
    Str(String),
}

/// Parse a number that can be hex (0x...) or decimal
pub fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn hex_u32<E: serde::de::Error>(value: HexOrInt) -> Result<u32, E> {
    let n = match value {
        HexOrInt::Int(n) => n,
        HexOrInt::Str(s) => {
            parse_u64(&s).ok_or_else(|| E::custom(format!("invalid offset '{}'", s)))?
        }
    };
    u32::try_from(n).map_err(|_| E::custom(format!("offset {:#x} exceeds 32 bits", n)))
}

fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    hex_u32(HexOrInt::deserialize(deserializer)?)
}

fn deserialize_opt_hex_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<HexOrInt>::deserialize(deserializer)? {
        Some(value) => hex_u32(value).map(Some),
        None => Ok(None),
    }
}
