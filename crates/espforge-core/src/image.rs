use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::PathBuf,
};

use log::debug;
use thiserror::Error;

use crate::layout::FlashLayout;

/// Value of erased NOR flash, used for the gaps between entries.
pub const ERASED_BYTE: u8 = 0xff;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} changed size since the layout was built (expected {expected} bytes, found {found})")]
    SizeChanged {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
    #[error("{path} at {offset:#x} starts before the previous image ends at {position:#x}")]
    Unordered {
        path: PathBuf,
        offset: u32,
        position: u64,
    },
    #[error("Failed to write to output")]
    FailedToWrite(#[source] io::Error),
}

/// Writes the layout as a single image meant to be flashed at address 0.
///
/// Returns the number of bytes written, which equals [`FlashLayout::end`].
pub fn write_combined(layout: &FlashLayout, mut output: impl Write) -> Result<u64, ImageError> {
    let mut position = 0u64;

    for entry in layout.entries() {
        let path = entry.artifact.path();
        let start = u64::from(entry.offset);
        let gap = start
            .checked_sub(position)
            .ok_or_else(|| ImageError::Unordered {
                path: path.to_owned(),
                offset: entry.offset,
                position,
            })?;
        fill(&mut output, gap)?;
        position = start;

        debug!("{:#08x} {}", entry.offset, path.display());

        let file = File::open(path).map_err(|source| ImageError::Read {
            path: path.to_owned(),
            source,
        })?;
        let copied = io::copy(&mut BufReader::new(file).take(entry.size), &mut output)
            .map_err(ImageError::FailedToWrite)?;
        if copied != entry.size {
            return Err(ImageError::SizeChanged {
                path: path.to_owned(),
                expected: entry.size,
                found: copied,
            });
        }
        position += copied;
    }

    output.flush().map_err(ImageError::FailedToWrite)?;
    Ok(position)
}

fn fill(output: &mut impl Write, mut len: u64) -> Result<(), ImageError> {
    let block = [ERASED_BYTE; 4096];
    while len > 0 {
        let n = len.min(block.len() as u64) as usize;
        output
            .write_all(&block[..n])
            .map_err(ImageError::FailedToWrite)?;
        len -= n as u64;
    }
    Ok(())
}
