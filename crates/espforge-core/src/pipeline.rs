//! The `build` flow: link plan, ELF, application image, partition table, layout.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use thiserror::Error;

use crate::{
    artifact::{Artifact, ArtifactError, ArtifactKind, ArtifactLocator},
    config::{BoardConfig, CoreSource},
    flash_params::FlashParams,
    layout::{resolve_extra_images, FlashLayout, FlashLayoutBuilder, LayoutError, ResolvedArtifacts},
    partitions::{PartitionError, PartitionTableResolver},
    platform::PlatformPaths,
    tool::{ConversionRequest, ImageConverter, PartitionCompiler, ToolError, APP_ELF_SHA256_OFFSET},
};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Precompiled framework library {0} not found, build the framework libraries first")]
    MissingLibrary(PathBuf),
    #[error("Framework core sources {0} not found")]
    MissingCoreSources(PathBuf),
    #[error("Firmware ELF {0} not found")]
    MissingElf(PathBuf),
    #[error("Failed to create build directory {path}")]
    BuildDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to convert {elf} into a flash image")]
    Convert {
        elf: PathBuf,
        #[source]
        source: ToolError,
    },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Inputs handed to the external toolchain. Every stage returns a new plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPlan {
    pub libraries: Vec<String>,
    pub library_paths: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub source_dirs: Vec<PathBuf>,
}

impl LinkPlan {
    pub fn with_library<S: Into<String>>(mut self, library: S) -> Self {
        self.libraries.push(library.into());
        self
    }

    pub fn with_library_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn with_include_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.include_dirs.push(path.into());
        self
    }

    pub fn with_source_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.source_dirs.push(path.into());
        self
    }
}

/// How the framework core reaches the link, chosen once from `build.core`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreBuildStrategy {
    UsePrecompiled { name: String, archive: PathBuf },
    CompileFromSource { core_dir: PathBuf },
}

impl CoreBuildStrategy {
    pub fn select(board: &BoardConfig, paths: &PlatformPaths) -> Self {
        match board.build.core {
            CoreSource::Precompiled => {
                let name = board.build.framework.library_name();
                CoreBuildStrategy::UsePrecompiled {
                    name: name.to_string(),
                    archive: paths.prebuilt_library(name),
                }
            }
            CoreSource::Source => CoreBuildStrategy::CompileFromSource {
                core_dir: paths.framework_core_dir(),
            },
        }
    }

    pub fn configure(&self, plan: LinkPlan) -> Result<LinkPlan, BuildError> {
        match self {
            CoreBuildStrategy::UsePrecompiled { name, archive } => {
                if !archive.is_file() {
                    return Err(BuildError::MissingLibrary(archive.clone()));
                }
                let dir = archive.parent().unwrap_or_else(|| Path::new("."));
                Ok(plan.with_library(name.as_str()).with_library_path(dir))
            }
            CoreBuildStrategy::CompileFromSource { core_dir } => {
                if !core_dir.is_dir() {
                    return Err(BuildError::MissingCoreSources(core_dir.clone()));
                }
                Ok(plan
                    .with_include_dir(core_dir.as_path())
                    .with_source_dir(core_dir.as_path()))
            }
        }
    }
}

/// The compiler and linker. Produces one ELF per call, or fails.
pub trait Toolchain {
    fn link(&self, plan: &LinkPlan, output: &Path) -> Result<PathBuf, BuildError>;
}

/// Accepts an ELF the external toolchain already produced.
#[derive(Debug, Clone)]
pub struct LinkedElf {
    path: PathBuf,
}

impl LinkedElf {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl Toolchain for LinkedElf {
    fn link(&self, plan: &LinkPlan, _output: &Path) -> Result<PathBuf, BuildError> {
        debug!("Link plan {:?}", plan);
        if self.path.is_file() {
            Ok(self.path.clone())
        } else {
            Err(BuildError::MissingElf(self.path.clone()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub elf: PathBuf,
    pub partitions_csv: PathBuf,
    pub layout: FlashLayout,
}

pub struct Pipeline<'a> {
    board: &'a BoardConfig,
    paths: &'a PlatformPaths,
    converter: &'a dyn ImageConverter,
    compiler: &'a dyn PartitionCompiler,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        board: &'a BoardConfig,
        paths: &'a PlatformPaths,
        converter: &'a dyn ImageConverter,
        compiler: &'a dyn PartitionCompiler,
    ) -> Self {
        Self {
            board,
            paths,
            converter,
            compiler,
        }
    }

    pub fn link_plan(&self) -> Result<LinkPlan, BuildError> {
        let plan = match self.paths.variant_dir(self.board) {
            Some(variant) => LinkPlan::default().with_include_dir(variant),
            None => LinkPlan::default(),
        };
        CoreBuildStrategy::select(self.board, self.paths).configure(plan)
    }

    /// Produces every binary artifact and the validated layout. Nothing is written to a device.
    pub fn build(&self, toolchain: &dyn Toolchain) -> Result<BuildOutput, BuildError> {
        let build_dir = self.paths.build_dir();
        fs::create_dir_all(build_dir).map_err(|source| BuildError::BuildDir {
            path: build_dir.to_owned(),
            source,
        })?;

        let plan = self.link_plan()?;
        let elf = toolchain.link(&plan, &self.paths.firmware_elf())?;

        let output = self.paths.firmware_bin();
        info!("Building {}", output.display());
        let params = FlashParams::from_board(self.board);
        let application = self
            .converter
            .convert(&ConversionRequest {
                chip: self.board.mcu(),
                elf: &elf,
                output: &output,
                params: &params,
                elf_sha256_offset: Some(APP_ELF_SHA256_OFFSET),
            })
            .map_err(|source| BuildError::Convert {
                elf: elf.clone(),
                source,
            })?;

        let resolver = PartitionTableResolver::new(self.board, self.paths);
        let table = resolver.resolve_table()?;
        let partitions = resolver.generate(&table, self.compiler)?;
        let partitions_csv = table.csv;

        let layout = self.layout(
            Artifact::new(ArtifactKind::Application, application),
            partitions,
        )?;

        Ok(BuildOutput {
            elf,
            partitions_csv,
            layout,
        })
    }

    /// Layout over the images of a previous build, without running any tool but the bootloader
    /// conversion.
    pub fn existing_layout(&self) -> Result<FlashLayout, BuildError> {
        let mut locator = ArtifactLocator::new(self.board, self.paths, self.converter);
        let application = locator.resolve(&ArtifactKind::Application)?;
        let partitions = locator.resolve(&ArtifactKind::Partitions)?;
        self.layout(application, partitions)
    }

    fn layout(&self, application: Artifact, partitions: Artifact) -> Result<FlashLayout, BuildError> {
        let mut locator = ArtifactLocator::new(self.board, self.paths, self.converter);
        let artifacts = ResolvedArtifacts {
            bootloader: locator.resolve(&ArtifactKind::Bootloader)?,
            partitions,
            boot_stub: locator.resolve(&ArtifactKind::BootStub)?,
            application,
            extra: resolve_extra_images(&mut locator, self.board, self.paths)?,
        };
        Ok(FlashLayoutBuilder::new(self.board).build(artifacts)?)
    }
}
