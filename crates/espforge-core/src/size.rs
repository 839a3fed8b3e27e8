use std::{fmt, fs::File, io::BufReader, path::Path};

use elf::{endian::AnyEndian, ElfStream, ParseError};
use log::warn;
use thiserror::Error;

use crate::config::BoardConfig;

/// Sections stored in flash or loaded into instruction RAM.
pub const PROGRAM_SECTIONS: &[&str] = &[
    ".iram0.text",
    ".iram0.vectors",
    ".dram0.data",
    ".flash.text",
    ".flash.rodata",
];

/// Sections occupying data RAM at runtime.
pub const DATA_SECTIONS: &[&str] = &[".dram0.data", ".dram0.bss", ".noinit"];

#[derive(Error, Debug)]
pub enum SizeError {
    #[error("Failed to open {0}")]
    Open(String, #[source] std::io::Error),
    #[error("Failed to parse elf file")]
    Parse(#[from] ParseError),
    #[error("ELF file has no section names")]
    NoSectionNames,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSize {
    pub name: String,
    pub size: u64,
}

pub fn section_sizes<P: AsRef<Path>>(path: P) -> Result<Vec<SectionSize>, SizeError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| SizeError::Open(path.display().to_string(), e))?;
    let mut elf = ElfStream::<AnyEndian, _>::open_stream(BufReader::new(file))?;

    let (headers, strtab) = elf.section_headers_with_strtab()?;
    let strtab = strtab.ok_or(SizeError::NoSectionNames)?;

    let mut sections = Vec::new();
    for header in headers {
        let name = strtab.get(header.sh_name as usize)?;
        sections.push(SectionSize {
            name: name.to_string(),
            size: header.sh_size,
        });
    }
    Ok(sections)
}

/// Memory use of a linked program against the board's limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeReport {
    pub program: u64,
    pub data: u64,
    pub max_program: Option<u64>,
    pub max_data: Option<u64>,
}

impl SizeReport {
    pub fn new(sections: &[SectionSize], board: &BoardConfig) -> Self {
        let total = |wanted: &[&str]| -> u64 {
            sections
                .iter()
                .filter(|section| wanted.contains(&section.name.as_str()))
                .map(|section| section.size)
                .sum()
        };

        Self {
            program: total(PROGRAM_SECTIONS),
            data: total(DATA_SECTIONS),
            max_program: board.upload.maximum_size,
            max_data: board.upload.maximum_ram_size,
        }
    }

    pub fn program_exceeded(&self) -> bool {
        self.max_program.map_or(false, |max| self.program > max)
    }

    pub fn data_exceeded(&self) -> bool {
        self.max_data.map_or(false, |max| self.data > max)
    }

    /// Logs a warning for every exceeded limit. The report itself never fails.
    pub fn warn_if_exceeded(&self) {
        if self.program_exceeded() {
            warn!(
                "Program size {} exceeds the maximum of {} bytes",
                self.program,
                self.max_program.unwrap_or_default()
            );
        }
        if self.data_exceeded() {
            warn!(
                "Data size {} exceeds the maximum of {} bytes",
                self.data,
                self.max_data.unwrap_or_default()
            );
        }
    }
}

fn usage(used: u64, max: Option<u64>) -> String {
    match max {
        Some(max) if max > 0 => format!(
            "{:5.1}% (used {} bytes from {} bytes)",
            used as f64 * 100.0 / max as f64,
            used,
            max
        ),
        _ => format!("used {} bytes", used),
    }
}

impl fmt::Display for SizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RAM:   {}", usage(self.data, self.max_data))?;
        write!(f, "Flash: {}", usage(self.program, self.max_program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str, size: u64) -> SectionSize {
        SectionSize {
            name: name.to_string(),
            size,
        }
    }

    #[test]
    fn sums_program_and_data_sections() {
        let sections = [
            section(".iram0.vectors", 0x400),
            section(".iram0.text", 0x1000),
            section(".dram0.data", 0x200),
            section(".dram0.bss", 0x800),
            section(".noinit", 0x10),
            section(".flash.text", 0x20000),
            section(".flash.rodata", 0x8000),
            section(".debug_info", 0x99999),
        ];
        let board = BoardConfig::from_toml_str("").unwrap();

        let report = SizeReport::new(&sections, &board);

        assert_eq!(report.program, 0x400 + 0x1000 + 0x200 + 0x20000 + 0x8000);
        assert_eq!(report.data, 0x200 + 0x800 + 0x10);
        assert!(!report.program_exceeded());
        assert!(report.to_string().contains("used 2576 bytes"));
    }

    #[test]
    fn limits_come_from_board() {
        let board = BoardConfig::from_toml_str(
            "[upload]\nmaximum_size = 1310720\nmaximum_ram_size = 327680\n",
        )
        .unwrap();
        let report = SizeReport::new(&[section(".flash.text", 1_400_000)], &board);

        assert!(report.program_exceeded());
        assert!(!report.data_exceeded());
        assert!(report
            .to_string()
            .contains("(used 1400000 bytes from 1310720 bytes)"));
    }

    #[test]
    fn missing_elf_is_an_open_error() {
        assert!(matches!(
            section_sizes("/nonexistent/firmware.elf"),
            Err(SizeError::Open(..))
        ));
    }
}
