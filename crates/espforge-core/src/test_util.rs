//! Scratch directories and recording fakes shared by the unit tests.

use std::{
    cell::{Cell, RefCell},
    fs,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    platform::PlatformPaths,
    tool::{
        ConversionRequest, ImageConverter, PartitionCompiler, ToolCommand, ToolError, ToolOutput,
        ToolRunner,
    },
    upload::{open_error, PortInfo, PortScanner, UploadError},
};

static NEXT_SCRATCH: AtomicUsize = AtomicUsize::new(0);

/// A directory under the OS temp dir, unique per test and removed on drop.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!(
            "espforge-test-{}-{}",
            process::id(),
            NEXT_SCRATCH.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn join<P: AsRef<Path>>(&self, rel: P) -> PathBuf {
        self.path.join(rel)
    }

    /// Writes `len` filler bytes at `rel`, creating parent directories.
    pub fn file<P: AsRef<Path>>(&self, rel: P, len: usize) -> PathBuf {
        let path = self.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0xa5; len]).unwrap();
        path
    }

    pub fn text<P: AsRef<Path>>(&self, rel: P, contents: &str) -> PathBuf {
        let path = self.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// Platform rooted at `platform/`, project at `project/`, build outputs in `project/.build`.
    pub fn platform(&self) -> PlatformPaths {
        let build_dir = self.join("project/.build");
        fs::create_dir_all(&build_dir).unwrap();
        PlatformPaths::new(self.join("platform"), self.join("project"), build_dir)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Records every command and answers with a canned output.
pub struct RecordingRunner {
    commands: RefCell<Vec<ToolCommand>>,
    output: ToolOutput,
}

impl RecordingRunner {
    pub fn succeeding() -> Self {
        Self {
            commands: RefCell::new(Vec::new()),
            output: ToolOutput {
                status: Some(0),
                ..ToolOutput::default()
            },
        }
    }

    pub fn failing(code: i32, stderr: &str) -> Self {
        Self {
            commands: RefCell::new(Vec::new()),
            output: ToolOutput {
                status: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        }
    }

    pub fn commands(&self) -> Vec<ToolCommand> {
        self.commands.borrow().clone()
    }
}

impl ToolRunner for RecordingRunner {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        self.commands.borrow_mut().push(command.clone());
        Ok(self.output.clone())
    }
}

/// Writes a fixed-size image for every conversion and counts the calls.
pub struct FakeConverter {
    image_len: usize,
    calls: Cell<usize>,
    requests: RefCell<Vec<(PathBuf, PathBuf, Option<u32>)>>,
}

impl FakeConverter {
    pub fn new(image_len: usize) -> Self {
        Self {
            image_len,
            calls: Cell::new(0),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// `(elf, output, sha256 offset)` of every conversion
    pub fn requests(&self) -> Vec<(PathBuf, PathBuf, Option<u32>)> {
        self.requests.borrow().clone()
    }
}

impl ImageConverter for FakeConverter {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<PathBuf, ToolError> {
        self.calls.set(self.calls.get() + 1);
        self.requests.borrow_mut().push((
            request.elf.to_owned(),
            request.output.to_owned(),
            request.elf_sha256_offset,
        ));
        fs::create_dir_all(request.output.parent().unwrap()).unwrap();
        fs::write(request.output, vec![0xe9; self.image_len]).unwrap();
        Ok(request.output.to_owned())
    }
}

/// Writes a 3 KiB table, or fails like a compiler rejecting the CSV.
pub struct FakeCompiler {
    fail: bool,
    sources: RefCell<Vec<PathBuf>>,
}

impl FakeCompiler {
    pub fn new() -> Self {
        Self {
            fail: false,
            sources: RefCell::new(Vec::new()),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            fail: true,
            sources: RefCell::new(Vec::new()),
        }
    }

    pub fn sources(&self) -> Vec<PathBuf> {
        self.sources.borrow().clone()
    }
}

impl PartitionCompiler for FakeCompiler {
    fn compile(&self, csv: &Path, output: &Path) -> Result<PathBuf, ToolError> {
        self.sources.borrow_mut().push(csv.to_owned());
        if self.fail {
            return Err(ToolError::Failed {
                command: format!("gen_esp32part.py -q {}", csv.display()),
                status: "exit code 2".to_string(),
                diagnostic: "Partition table is malformed".to_string(),
            });
        }
        fs::write(output, vec![0xaa; 0xc00]).unwrap();
        Ok(output.to_owned())
    }
}

/// Answers port scans from a script, repeating the last answer once it runs out.
pub struct FakeScanner {
    answers: Vec<Vec<PortInfo>>,
    scans: Cell<usize>,
    touches: RefCell<Vec<(String, u32)>>,
    touch_failure: Option<String>,
}

impl FakeScanner {
    pub fn new(answers: Vec<Vec<PortInfo>>) -> Self {
        Self {
            answers,
            scans: Cell::new(0),
            touches: RefCell::new(Vec::new()),
            touch_failure: None,
        }
    }

    /// Fails every touch with `diagnostic`, the way the serial driver reports it.
    pub fn failing_touch(mut self, diagnostic: &str) -> Self {
        self.touch_failure = Some(diagnostic.to_string());
        self
    }

    pub fn scans(&self) -> usize {
        self.scans.get()
    }

    pub fn touches(&self) -> Vec<(String, u32)> {
        self.touches.borrow().clone()
    }
}

impl PortScanner for FakeScanner {
    fn available_ports(&self) -> Result<Vec<PortInfo>, UploadError> {
        let scan = self.scans.get();
        self.scans.set(scan + 1);
        Ok(self
            .answers
            .get(scan)
            .or_else(|| self.answers.last())
            .cloned()
            .unwrap_or_default())
    }

    fn touch(&self, port: &str, baud_rate: u32) -> Result<(), UploadError> {
        self.touches.borrow_mut().push((port.to_string(), baud_rate));
        match &self.touch_failure {
            Some(diagnostic) => Err(open_error(port, diagnostic.clone())),
            None => Ok(()),
        }
    }
}
