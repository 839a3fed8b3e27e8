use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use thiserror::Error;

use crate::{
    config::BoardConfig,
    flash_params::{self, FlashParams},
    platform::PlatformPaths,
    tool::{ConversionRequest, ImageConverter, ToolError},
};

/// Logical name of a binary placed in flash. Variants of the same kind are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    Bootloader,
    Partitions,
    BootStub,
    Application,
    Filesystem,
    /// Board-declared extra image, identified by its file name
    Extra(String),
}

impl ArtifactKind {
    pub fn name(&self) -> &str {
        match self {
            ArtifactKind::Bootloader => "bootloader",
            ArtifactKind::Partitions => "partitions",
            ArtifactKind::BootStub => "boot_stub",
            ArtifactKind::Application => "application",
            ArtifactKind::Filesystem => "filesystem",
            ArtifactKind::Extra(name) => name,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("No {name} image found, tried:{}", list_candidates(.candidates))]
    NotFound {
        name: String,
        candidates: Vec<PathBuf>,
    },
    #[error("Failed to read {name} image {path}")]
    Unreadable {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to generate {name} image")]
    Generation {
        name: String,
        #[source]
        source: ToolError,
    },
}

pub(crate) fn list_candidates(candidates: &[PathBuf]) -> String {
    candidates
        .iter()
        .map(|path| format!("\n  {}", path.display()))
        .collect()
}

/// A binary with a resolved path. Its size is read from disk on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    kind: ArtifactKind,
    path: PathBuf,
}

impl Artifact {
    pub fn new<P: Into<PathBuf>>(kind: ArtifactKind, path: P) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Result<u64, ArtifactError> {
        fs::metadata(&self.path)
            .map(|meta| meta.len())
            .map_err(|source| ArtifactError::Unreadable {
                name: self.name().to_string(),
                path: self.path.clone(),
                source,
            })
    }
}

/// Picks the one binary to use for each logical artifact.
///
/// Candidates are tried in a fixed order, first existing file wins:
///
/// 1. the path named for this artifact in the board configuration
/// 2. `<variants>/<variant>/<default file name>`
/// 3. `<precompiled dir>/<default file name>`
/// 4. generation from an ELF, for the artifacts that support it
///
/// Generated images are remembered, a second lookup in the same invocation does not convert again.
pub struct ArtifactLocator<'a> {
    board: &'a BoardConfig,
    paths: &'a PlatformPaths,
    converter: &'a dyn ImageConverter,
    generated: HashMap<ArtifactKind, PathBuf>,
}

impl<'a> ArtifactLocator<'a> {
    pub fn new(
        board: &'a BoardConfig,
        paths: &'a PlatformPaths,
        converter: &'a dyn ImageConverter,
    ) -> Self {
        Self {
            board,
            paths,
            converter,
            generated: HashMap::new(),
        }
    }

    pub fn default_filename_for(&self, kind: &ArtifactKind) -> String {
        match kind {
            ArtifactKind::Bootloader if self.board.uses_tinyuf2() => {
                "bootloader-tinyuf2.bin".to_string()
            }
            ArtifactKind::Bootloader => "bootloader.bin".to_string(),
            ArtifactKind::Partitions => "partitions.bin".to_string(),
            ArtifactKind::BootStub => "boot_app0.bin".to_string(),
            ArtifactKind::Application => "firmware.bin".to_string(),
            ArtifactKind::Filesystem => "littlefs.bin".to_string(),
            ArtifactKind::Extra(name) => name.clone(),
        }
    }

    fn explicit_path(&self, kind: &ArtifactKind) -> Option<PathBuf> {
        match kind {
            ArtifactKind::Bootloader => {
                let custom = self.board.custom_bootloader()?;
                // Relative names are looked up in the variant, absolute paths replace it.
                Some(match self.paths.variant_dir(self.board) {
                    Some(variant) => variant.join(custom),
                    None => self.paths.project_dir().join(custom),
                })
            }
            ArtifactKind::Extra(name) => self
                .board
                .upload
                .extra_images
                .iter()
                .find(|image| extra_image_name(&image.path) == *name)
                .map(|image| self.paths.framework_dir().join(&image.path)),
            _ => None,
        }
    }

    fn precompiled_dir(&self, kind: &ArtifactKind) -> PathBuf {
        match kind {
            ArtifactKind::Bootloader => self
                .paths
                .framework_libs_dir()
                .join(self.board.mcu())
                .join("bin"),
            ArtifactKind::BootStub => self.paths.partition_tools_dir(),
            ArtifactKind::Extra(_) => self.paths.framework_dir(),
            ArtifactKind::Partitions | ArtifactKind::Application | ArtifactKind::Filesystem => {
                self.paths.build_dir().to_owned()
            }
        }
    }

    pub fn resolve(&mut self, kind: &ArtifactKind) -> Result<Artifact, ArtifactError> {
        let filename = self.default_filename_for(kind);
        let mut candidates = Vec::new();

        let variant_path = self
            .paths
            .variant_dir(self.board)
            .map(|variant| variant.join(&filename));
        let ordered = self
            .explicit_path(kind)
            .into_iter()
            .chain(variant_path)
            .chain(Some(self.precompiled_dir(kind).join(&filename)));

        for candidate in ordered {
            if candidate.is_file() {
                debug!("Using {} image {}", kind, candidate.display());
                return Ok(Artifact::new(kind.clone(), candidate));
            }
            candidates.push(candidate);
        }

        if let Some(path) = self.generated.get(kind) {
            return Ok(Artifact::new(kind.clone(), path.clone()));
        }

        match kind {
            ArtifactKind::Bootloader => {
                let path = self.generate_bootloader(&mut candidates)?;
                self.generated.insert(kind.clone(), path.clone());
                Ok(Artifact::new(kind.clone(), path))
            }
            _ => Err(ArtifactError::NotFound {
                name: kind.to_string(),
                candidates,
            }),
        }
    }

    fn generate_bootloader(&self, candidates: &mut Vec<PathBuf>) -> Result<PathBuf, ArtifactError> {
        let elf = self.paths.bootloader_elf(
            self.board.mcu(),
            flash_params::boot_mode(self.board),
            &flash_params::boot_frequency(self.board),
        );
        if !elf.is_file() {
            candidates.push(elf);
            return Err(ArtifactError::NotFound {
                name: ArtifactKind::Bootloader.to_string(),
                candidates: candidates.clone(),
            });
        }

        let output = self.paths.bootloader_bin();
        info!("Building {}", output.display());
        let params = FlashParams::from_board(self.board);
        self.converter
            .convert(&ConversionRequest {
                chip: self.board.mcu(),
                elf: &elf,
                output: &output,
                params: &params,
                elf_sha256_offset: None,
            })
            .map_err(|source| ArtifactError::Generation {
                name: ArtifactKind::Bootloader.to_string(),
                source,
            })
    }
}

pub(crate) fn extra_image_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
