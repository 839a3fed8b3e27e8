//! Deterministic flash image assembly and upload for ESP32 family chips.
//!
//! The pieces run in a fixed order: [`ArtifactLocator`] and [`PartitionTableResolver`] pick the
//! binaries, [`FlashLayoutBuilder`] places and validates them, and [`UploadDispatcher`] writes
//! the resulting [`FlashLayout`] to a device.

use thiserror::Error;

pub mod artifact;
pub mod config;
pub mod flash_params;
pub mod image;
pub mod layout;
pub mod partitions;
pub mod pipeline;
pub mod platform;
pub mod size;
pub mod tool;
pub mod upload;

#[cfg(test)]
mod test_util;

pub use artifact::{Artifact, ArtifactError, ArtifactKind, ArtifactLocator};
pub use config::{BoardConfig, ConfigError, FlashSize};
pub use image::{write_combined, ImageError};
pub use layout::{bootloader_offset, FlashEntry, FlashLayout, FlashLayoutBuilder, LayoutError};
pub use partitions::{PartitionError, PartitionTableResolver};
pub use pipeline::{BuildError, BuildOutput, CoreBuildStrategy, LinkPlan, LinkedElf, Pipeline, Toolchain};
pub use platform::PlatformPaths;
pub use size::{SizeError, SizeReport};
pub use tool::{ToolError, ToolRunner};
pub use upload::{UploadDispatcher, UploadError, UploadProtocol, UploadTarget};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Size(#[from] SizeError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl Error {
    /// Whether the same invocation may succeed when simply run again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Upload(err) if err.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootloader_offset_depends_on_family() {
        for mcu in ["esp32", "esp32s2", "ESP32"] {
            assert_eq!(bootloader_offset(mcu), 0x1000, "{}", mcu);
        }
        assert_eq!(bootloader_offset("esp32p4"), 0x2000);
        for mcu in ["esp32s3", "esp32c3", "esp32c6", "esp32h2"] {
            assert_eq!(bootloader_offset(mcu), 0x0, "{}", mcu);
        }
    }

    #[test]
    fn busy_port_is_retryable_through_crate_error() {
        let err: Error = UploadError::PortBusy {
            port: "COM3".to_string(),
            diagnostic: String::new(),
        }
        .into();
        assert!(err.is_retryable());

        let err: Error = UploadError::UnsupportedProtocol("xmodem".to_string()).into();
        assert!(!err.is_retryable());
    }
}
