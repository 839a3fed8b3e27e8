//! Seams to the external programs this crate drives.
//!
//! Every subprocess goes through a [`ToolRunner`], so the image converter, the partition table
//! compiler and the upload tools can all be replaced with fakes.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use log::debug;
use thiserror::Error;

use crate::flash_params::FlashParams;

/// Offset inside the application image where the converter stores the ELF SHA-256.
pub const APP_ELF_SHA256_OFFSET: u32 = 0xb0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    if s.is_empty() || s.contains(char::is_whitespace) {
        format!("\"{}\"", s)
    } else {
        s.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// The tool's own diagnostic text, stderr preferred.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    fn status_text(&self) -> String {
        match self.status {
            Some(code) => format!("exit code {}", code),
            None => "a signal".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to launch `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with {status}:\n{diagnostic}")]
    Failed {
        command: String,
        status: String,
        diagnostic: String,
    },
}

pub trait ToolRunner {
    /// Runs the command to completion. A non-zero exit is reported through [`ToolOutput`], not
    /// as an error.
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError>;
}

/// Runs the command and turns a non-zero exit into [`ToolError::Failed`].
pub fn run_checked(runner: &dyn ToolRunner, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
    let output = runner.run(command)?;
    if output.success() {
        Ok(output)
    } else {
        Err(ToolError::Failed {
            command: command.to_string(),
            status: output.status_text(),
            diagnostic: output.diagnostic().to_string(),
        })
    }
}

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    passthrough: bool,
}

impl ProcessRunner {
    /// When `passthrough` is set the tool's stdout goes straight to the terminal, so progress
    /// output stays live. Stderr is always captured.
    pub fn new(passthrough: bool) -> Self {
        Self { passthrough }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        debug!("Running {}", command);

        let spawn_error = |source| ToolError::Spawn {
            program: command.program.to_string_lossy().into_owned(),
            source,
        };

        let output = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(if self.passthrough {
                Stdio::inherit()
            } else {
                Stdio::piped()
            })
            .stderr(Stdio::piped())
            .output()
            .map_err(spawn_error)?;

        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Turns an ELF into a flashable image: `convert(elf_path, flash_mode, flash_freq, flash_size)`.
pub trait ImageConverter {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<PathBuf, ToolError>;
}

#[derive(Debug, Clone)]
pub struct ConversionRequest<'a> {
    pub chip: &'a str,
    pub elf: &'a Path,
    pub output: &'a Path,
    pub params: &'a FlashParams,
    pub elf_sha256_offset: Option<u32>,
}

/// Compiles a partition table CSV into its binary form.
pub trait PartitionCompiler {
    fn compile(&self, csv: &Path, output: &Path) -> Result<PathBuf, ToolError>;
}

/// `esptool.py elf2image`
pub struct Esptool<'a> {
    runner: &'a dyn ToolRunner,
    python: PathBuf,
    script: PathBuf,
}

impl<'a> Esptool<'a> {
    pub fn new(runner: &'a dyn ToolRunner, python: &Path, script: &Path) -> Self {
        Self {
            runner,
            python: python.to_owned(),
            script: script.to_owned(),
        }
    }
}

impl ImageConverter for Esptool<'_> {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<PathBuf, ToolError> {
        let mut command = ToolCommand::new(&self.python)
            .path_arg(&self.script)
            .args(["--chip", request.chip, "elf2image"])
            .args(["--flash_mode", request.params.mode.as_str()])
            .args(["--flash_freq", request.params.freq.as_str()])
            .arg("--flash_size")
            .arg(request.params.size.to_string());
        if let Some(offset) = request.elf_sha256_offset {
            command = command
                .arg("--elf-sha256-offset")
                .arg(format!("{:#x}", offset));
        }
        let command = command
            .arg("-o")
            .path_arg(request.output)
            .path_arg(request.elf);

        run_checked(self.runner, &command)?;
        Ok(request.output.to_owned())
    }
}

/// `gen_esp32part.py`
pub struct GenEsp32Part<'a> {
    runner: &'a dyn ToolRunner,
    python: PathBuf,
    script: PathBuf,
}

impl<'a> GenEsp32Part<'a> {
    pub fn new(runner: &'a dyn ToolRunner, python: &Path, script: &Path) -> Self {
        Self {
            runner,
            python: python.to_owned(),
            script: script.to_owned(),
        }
    }
}

impl PartitionCompiler for GenEsp32Part<'_> {
    fn compile(&self, csv: &Path, output: &Path) -> Result<PathBuf, ToolError> {
        let command = ToolCommand::new(&self.python)
            .path_arg(&self.script)
            .arg("-q")
            .path_arg(csv)
            .path_arg(output);

        run_checked(self.runner, &command)?;
        Ok(output.to_owned())
    }
}
