use std::{fmt, path::Path};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    artifact::{extra_image_name, Artifact, ArtifactError, ArtifactKind, ArtifactLocator},
    config::{BoardConfig, FlashSize},
    platform::PlatformPaths,
};

pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
pub const BOOT_STUB_OFFSET: u32 = 0xe000;

pub const TINYUF2_IMAGE: &str = "tinyuf2.bin";
const TINYUF2_OFFSET_ADAFRUIT: u32 = 0x2d0000;
const TINYUF2_OFFSET: u32 = 0x410000;

/// Where the first stage bootloader lives, this is fixed by the chip's ROM.
pub fn bootloader_offset(mcu: &str) -> u32 {
    match mcu.to_ascii_lowercase().as_str() {
        "esp32" | "esp32s2" => 0x1000,
        "esp32p4" => 0x2000,
        _ => 0x0000,
    }
}

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error(
        "{first} ({first_start:#x}..{first_end:#x}) overlaps {second} ({second_start:#x}..{second_end:#x})"
    )]
    Overlap {
        first: String,
        first_start: u64,
        first_end: u64,
        second: String,
        second_start: u64,
        second_end: u64,
    },
    #[error("{name} at {offset:#x} is empty")]
    EmptyImage { name: String, offset: u32 },
    #[error("{name} ends at {end:#x}, beyond the end of the {flash_size} flash")]
    ExceedsFlash {
        name: String,
        end: u64,
        flash_size: FlashSize,
    },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashEntry {
    pub offset: u32,
    pub artifact: Artifact,
    pub size: u64,
}

impl FlashEntry {
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + self.size
    }
}

/// One complete device image, entries sorted by offset and free of overlaps.
#[derive(Debug, Clone)]
pub struct FlashLayout {
    entries: Vec<FlashEntry>,
    mcu: String,
    flash_size: FlashSize,
}

impl FlashLayout {
    pub fn entries(&self) -> &[FlashEntry] {
        &self.entries
    }

    pub fn mcu(&self) -> &str {
        &self.mcu
    }

    pub fn flash_size(&self) -> FlashSize {
        self.flash_size
    }

    pub fn application(&self) -> Option<&FlashEntry> {
        self.entries
            .iter()
            .find(|entry| *entry.artifact.kind() == ArtifactKind::Application)
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<FlashEntry>, flash_size: FlashSize) -> Self {
        Self {
            entries,
            mcu: "esp32".to_string(),
            flash_size,
        }
    }

    /// End of the highest entry, the length of a combined image.
    pub fn end(&self) -> u64 {
        self.entries.iter().map(FlashEntry::end).max().unwrap_or(0)
    }
}

impl fmt::Display for FlashLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let path = entry.artifact.path();
            let file = path
                .file_name()
                .map(|name| name.to_string_lossy())
                .unwrap_or_else(|| path.to_string_lossy());
            writeln!(
                f,
                "  {:<8} -> {:<25} ({})",
                format!("{:#x}", entry.offset),
                file,
                path.display()
            )?;
        }
        Ok(())
    }
}

/// Every artifact a layout needs, already resolved to concrete files.
#[derive(Debug, Clone)]
pub struct ResolvedArtifacts {
    pub bootloader: Artifact,
    pub partitions: Artifact,
    pub boot_stub: Artifact,
    pub application: Artifact,
    /// Board-declared images with their offsets, in declaration order
    pub extra: Vec<(u32, Artifact)>,
}

/// Resolves the board's extra images, plus the TinyUF2 image when the board asks for one.
pub fn resolve_extra_images(
    locator: &mut ArtifactLocator<'_>,
    board: &BoardConfig,
    paths: &PlatformPaths,
) -> Result<Vec<(u32, Artifact)>, ArtifactError> {
    let mut extra = Vec::new();
    for image in &board.upload.extra_images {
        let artifact = locator.resolve(&ArtifactKind::Extra(extra_image_name(&image.path)))?;
        extra.push((image.offset, artifact));
    }

    if board.uses_tinyuf2() || board.upload.tinyuf2_image.is_some() {
        if let Some(tinyuf2) = tinyuf2_image(board, paths, &extra) {
            extra.push(tinyuf2);
        }
    }

    Ok(extra)
}

fn tinyuf2_image(
    board: &BoardConfig,
    paths: &PlatformPaths,
    extra: &[(u32, Artifact)],
) -> Option<(u32, Artifact)> {
    let image = match &board.upload.tinyuf2_image {
        Some(image) => paths.project_dir().join(image),
        None => paths
            .variants_dir(board)
            .join(board.variant().unwrap_or_default())
            .join(TINYUF2_IMAGE),
    };

    if !image.is_file() {
        warn!(
            "The `{}` UF2 bootloader image doesn't exist",
            image.display()
        );
        return None;
    }

    if extra
        .iter()
        .any(|(_, artifact)| file_name_is(artifact.path(), TINYUF2_IMAGE))
    {
        warn!("An extra UF2 bootloader image is already added");
        return None;
    }

    let offset = board.upload.uf2_bootloader_offset.unwrap_or_else(|| {
        if board.name.starts_with("adafruit") {
            TINYUF2_OFFSET_ADAFRUIT
        } else {
            TINYUF2_OFFSET
        }
    });

    Some((
        offset,
        Artifact::new(ArtifactKind::Extra(TINYUF2_IMAGE.to_string()), image),
    ))
}

fn file_name_is(path: &Path, name: &str) -> bool {
    path.file_name().map_or(false, |file| file == name)
}

/// Places resolved artifacts at their flash offsets.
pub struct FlashLayoutBuilder<'a> {
    board: &'a BoardConfig,
}

impl<'a> FlashLayoutBuilder<'a> {
    pub fn new(board: &'a BoardConfig) -> Self {
        Self { board }
    }

    pub fn build(&self, artifacts: ResolvedArtifacts) -> Result<FlashLayout, LayoutError> {
        let ResolvedArtifacts {
            bootloader,
            partitions,
            boot_stub,
            application,
            extra,
        } = artifacts;

        let placed = [
            (bootloader_offset(self.board.mcu()), bootloader),
            (PARTITION_TABLE_OFFSET, partitions),
            (BOOT_STUB_OFFSET, boot_stub),
            (self.board.app_offset(), application),
        ]
        .into_iter()
        .chain(extra);

        let mut entries = Vec::new();
        for (offset, artifact) in placed {
            let size = artifact.size()?;
            if size == 0 {
                return Err(LayoutError::EmptyImage {
                    name: artifact.name().to_string(),
                    offset,
                });
            }
            entries.push(FlashEntry {
                offset,
                artifact,
                size,
            });
        }

        // Stable, so equal offsets keep declaration order for the overlap report.
        entries.sort_by_key(|entry| entry.offset);

        let flash_size = self.board.flash_size();
        for entry in &entries {
            if entry.end() > flash_size.bytes() {
                return Err(LayoutError::ExceedsFlash {
                    name: entry.artifact.name().to_string(),
                    end: entry.end(),
                    flash_size,
                });
            }
        }

        // Sorted by start and never empty, so any overlap shows up against the previous entry.
        let mut previous: Option<&FlashEntry> = None;
        for entry in &entries {
            if let Some(first) = previous {
                if u64::from(entry.offset) < first.end() {
                    return Err(LayoutError::Overlap {
                        first: first.artifact.name().to_string(),
                        first_start: first.offset.into(),
                        first_end: first.end(),
                        second: entry.artifact.name().to_string(),
                        second_start: entry.offset.into(),
                        second_end: entry.end(),
                    });
                }
            }
            previous = Some(entry);
        }

        for entry in &entries {
            debug!(
                "{:#08x}..{:#08x} {}",
                entry.offset,
                entry.end(),
                entry.artifact.name()
            );
        }

        Ok(FlashLayout {
            entries,
            mcu: self.board.mcu().to_string(),
            flash_size,
        })
    }
}
