use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::{
    artifact::{list_candidates, Artifact, ArtifactKind},
    config::BoardConfig,
    platform::PlatformPaths,
    tool::{PartitionCompiler, ToolError},
};

pub const DEFAULT_PARTITIONS_CSV: &str = "default.csv";
pub const VARIANT_PARTITIONS_CSV: &str = "partitions.csv";

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Partition table '{name}' not found, tried:{}", list_candidates(.candidates))]
    NotFound {
        name: String,
        candidates: Vec<PathBuf>,
    },
    #[error("Failed to generate partition table from {csv}")]
    Compile {
        csv: PathBuf,
        #[source]
        source: ToolError,
    },
}

/// Where the authoritative partition CSV was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSource {
    /// Custom name found in the variant directory
    Variant,
    /// Custom name used as a path, relative to the project
    Explicit,
    /// Custom name found among the shared partition tables
    SharedTools,
    /// `partitions.csv` shipped by the variant
    VariantDefault,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTable {
    pub csv: PathBuf,
    pub source: PartitionSource,
}

/// Decides which CSV describes the partition table. The CSV itself is never interpreted here.
pub struct PartitionTableResolver<'a> {
    board: &'a BoardConfig,
    paths: &'a PlatformPaths,
}

impl<'a> PartitionTableResolver<'a> {
    pub fn new(board: &'a BoardConfig, paths: &'a PlatformPaths) -> Self {
        Self { board, paths }
    }

    /// Resolution only depends on the configuration and the files on disk, so repeated calls
    /// agree. The compiled table is cached by the returned path.
    pub fn resolve_table(&self) -> Result<ResolvedTable, PartitionError> {
        let variant_dir = self.paths.variant_dir(self.board);

        let Some(name) = self.board.partitions_name() else {
            if let Some(csv) = variant_dir
                .map(|dir| dir.join(VARIANT_PARTITIONS_CSV))
                .filter(|csv| csv.is_file())
            {
                return Ok(ResolvedTable {
                    csv,
                    source: PartitionSource::VariantDefault,
                });
            }

            let csv = self.paths.partition_tools_dir().join(DEFAULT_PARTITIONS_CSV);
            if !csv.is_file() {
                return Err(PartitionError::NotFound {
                    name: DEFAULT_PARTITIONS_CSV.to_string(),
                    candidates: vec![csv],
                });
            }
            return Ok(ResolvedTable {
                csv,
                source: PartitionSource::BuiltIn,
            });
        };

        let candidates: Vec<(PathBuf, PartitionSource)> = if Path::new(name).is_absolute() {
            vec![(PathBuf::from(name), PartitionSource::Explicit)]
        } else {
            variant_dir
                .map(|dir| (dir.join(name), PartitionSource::Variant))
                .into_iter()
                .chain([
                    (self.paths.project_dir().join(name), PartitionSource::Explicit),
                    (
                        self.paths.partition_tools_dir().join(name),
                        PartitionSource::SharedTools,
                    ),
                ])
                .collect()
        };

        let mut existing = candidates.iter().filter(|(path, _)| path.is_file());
        let Some((csv, source)) = existing.next() else {
            return Err(PartitionError::NotFound {
                name: name.to_string(),
                candidates: candidates.iter().map(|(path, _)| path.clone()).collect(),
            });
        };

        let shadowed: Vec<_> = existing.map(|(path, _)| path.display().to_string()).collect();
        if !shadowed.is_empty() {
            warn!(
                "Partition table '{}' matches several files, using {} over {}",
                name,
                csv.display(),
                shadowed.join(", ")
            );
        }

        Ok(ResolvedTable {
            csv: csv.clone(),
            source: *source,
        })
    }

    /// Compiles a resolved table into `<build_dir>/partitions.bin`.
    pub fn generate(
        &self,
        table: &ResolvedTable,
        compiler: &dyn PartitionCompiler,
    ) -> Result<Artifact, PartitionError> {
        let output = self.paths.partitions_bin();

        info!("Generating partitions {}", output.display());
        let path = compiler
            .compile(&table.csv, &output)
            .map_err(|source| PartitionError::Compile {
                csv: table.csv.clone(),
                source,
            })?;

        Ok(Artifact::new(ArtifactKind::Partitions, path))
    }
}
