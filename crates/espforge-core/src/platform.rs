use std::path::{Path, PathBuf};

use crate::config::BoardConfig;

/// Every documented location of the platform install and of the build outputs.
#[derive(Debug, Clone)]
pub struct PlatformPaths {
    root: PathBuf,
    project_dir: PathBuf,
    build_dir: PathBuf,
    python: PathBuf,
}

impl PlatformPaths {
    pub fn new<R, P, B>(root: R, project_dir: P, build_dir: B) -> Self
    where
        R: Into<PathBuf>,
        P: Into<PathBuf>,
        B: Into<PathBuf>,
    {
        Self {
            root: root.into(),
            project_dir: project_dir.into(),
            build_dir: build_dir.into(),
            python: PathBuf::from("python3"),
        }
    }

    pub fn with_python<P: Into<PathBuf>>(self, python: P) -> Self {
        Self {
            python: python.into(),
            ..self
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    pub fn prebuilt_dir(&self) -> PathBuf {
        self.root.join("prebuilt")
    }

    pub fn prebuilt_library(&self, name: &str) -> PathBuf {
        self.prebuilt_dir().join(format!("lib{}.a", name))
    }

    /// Arduino core headers, variants and tools
    pub fn framework_dir(&self) -> PathBuf {
        self.prebuilt_dir().join("include").join("arduino")
    }

    /// Per-chip ESP-IDF headers and bootloader ELFs
    pub fn framework_libs_dir(&self) -> PathBuf {
        self.prebuilt_dir().join("include").join("esp-idf")
    }

    pub fn framework_core_dir(&self) -> PathBuf {
        self.framework_dir().join("cores").join("esp32")
    }

    pub fn partition_tools_dir(&self) -> PathBuf {
        self.framework_dir().join("tools").join("partitions")
    }

    pub fn partition_generator(&self) -> PathBuf {
        self.framework_dir().join("tools").join("gen_esp32part.py")
    }

    pub fn espota_script(&self) -> PathBuf {
        self.framework_dir().join("tools").join("espota.py")
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.root.join("packages").join(package)
    }

    pub fn esptool_script(&self) -> PathBuf {
        self.package_dir("tool-esptoolpy").join("esptool.py")
    }

    pub fn openocd_dir(&self) -> PathBuf {
        self.package_dir("tool-openocd-esp32")
    }

    pub fn dfu_util(&self) -> PathBuf {
        self.package_dir("tool-dfuutil-arduino").join("dfu-util")
    }

    /// Board-specific overrides live under `build.variants_dir` relative to the project when set.
    pub fn variants_dir(&self, board: &BoardConfig) -> PathBuf {
        match &board.build.variants_dir {
            Some(dir) => self.project_dir.join(dir),
            None => self.framework_dir().join("variants"),
        }
    }

    pub fn variant_dir(&self, board: &BoardConfig) -> Option<PathBuf> {
        board
            .variant()
            .map(|variant| self.variants_dir(board).join(variant))
    }

    pub fn bootloader_elf(&self, mcu: &str, boot_mode: &str, boot_freq: &str) -> PathBuf {
        self.framework_libs_dir()
            .join(mcu)
            .join("bin")
            .join(format!("bootloader_{}_{}.elf", boot_mode, boot_freq))
    }

    pub fn firmware_elf(&self) -> PathBuf {
        self.build_dir.join("firmware.elf")
    }

    pub fn firmware_bin(&self) -> PathBuf {
        self.build_dir.join("firmware.bin")
    }

    pub fn partitions_bin(&self) -> PathBuf {
        self.build_dir.join("partitions.bin")
    }

    pub fn bootloader_bin(&self) -> PathBuf {
        self.build_dir.join("bootloader.bin")
    }

    pub fn factory_image(&self) -> PathBuf {
        self.build_dir.join("firmware.factory.bin")
    }
}
