use std::path::{Path, PathBuf};

use crate::{
    config::BoardConfig,
    flash_params::{image_flash_mode, image_frequency},
    layout::FlashLayout,
    platform::PlatformPaths,
    tool::ToolCommand,
};

use super::{UploadError, UploadProtocol};

/// What a session writes to the device.
#[derive(Debug, Clone, Copy)]
pub enum UploadTarget<'a> {
    Firmware(&'a FlashLayout),
    /// Erase the whole chip first, then write the layout
    EraseAndFirmware(&'a FlashLayout),
    /// A filesystem image at `upload.fs_offset`
    Filesystem(&'a Path),
    Erase,
}

impl UploadTarget<'_> {
    pub fn layout(&self) -> Option<&FlashLayout> {
        match self {
            UploadTarget::Firmware(layout) | UploadTarget::EraseAndFirmware(layout) => Some(layout),
            UploadTarget::Filesystem(_) | UploadTarget::Erase => None,
        }
    }
}

enum Payload<'p> {
    Layout(&'p FlashLayout),
    Filesystem(&'p Path),
}

impl Payload<'_> {
    /// `(offset, file)` pairs for tools that write several images in one go.
    fn images(&self, board: &BoardConfig) -> Result<Vec<(u32, PathBuf)>, UploadError> {
        match self {
            Payload::Layout(layout) => Ok(layout
                .entries()
                .iter()
                .map(|entry| (entry.offset, entry.artifact.path().to_owned()))
                .collect()),
            Payload::Filesystem(image) => {
                let offset = board
                    .upload
                    .fs_offset
                    .ok_or(UploadError::MissingFilesystemOffset)?;
                Ok(vec![(offset, image.to_path_buf())])
            }
        }
    }

    /// The one file written by tools that only take a single image.
    fn single(&self) -> Result<&Path, UploadError> {
        match self {
            Payload::Layout(layout) => layout
                .application()
                .map(|entry| entry.artifact.path())
                .ok_or(UploadError::MissingApplication),
            Payload::Filesystem(image) => Ok(image),
        }
    }
}

/// Builds the command lines for one protocol and target. Nothing is run here.
pub struct CommandSet<'a> {
    board: &'a BoardConfig,
    paths: &'a PlatformPaths,
    verbose: bool,
}

impl<'a> CommandSet<'a> {
    pub fn new(board: &'a BoardConfig, paths: &'a PlatformPaths, verbose: bool) -> Self {
        Self {
            board,
            paths,
            verbose,
        }
    }

    /// `port` is the resolved serial port, or `None` when the protocol needs none.
    pub fn build(
        &self,
        protocol: &UploadProtocol,
        port: Option<&str>,
        target: &UploadTarget<'_>,
    ) -> Result<Vec<ToolCommand>, UploadError> {
        match target {
            UploadTarget::Firmware(layout) => {
                Ok(vec![self.write(protocol, port, &Payload::Layout(layout))?])
            }
            UploadTarget::EraseAndFirmware(layout) => Ok(vec![
                self.erase(protocol, port)?,
                self.write(protocol, port, &Payload::Layout(layout))?,
            ]),
            UploadTarget::Filesystem(image) => {
                Ok(vec![self.write(protocol, port, &Payload::Filesystem(image))?])
            }
            UploadTarget::Erase => Ok(vec![self.erase(protocol, port)?]),
        }
    }

    fn erase(&self, protocol: &UploadProtocol, port: Option<&str>) -> Result<ToolCommand, UploadError> {
        match protocol {
            UploadProtocol::Serial { .. } => Ok(self.esptool(port)?.arg("erase_flash")),
            other => Err(UploadError::UnsupportedOperation {
                protocol: other.name().to_string(),
                operation: "erase",
            }),
        }
    }

    fn write(
        &self,
        protocol: &UploadProtocol,
        port: Option<&str>,
        payload: &Payload<'_>,
    ) -> Result<ToolCommand, UploadError> {
        match protocol {
            UploadProtocol::Serial { speed, .. } => {
                let upload = &self.board.upload;
                let mut command = self
                    .esptool(port)?
                    .args(["--baud".to_string(), speed.to_string()])
                    .args(["--before", upload.before_reset.as_str()])
                    .args(["--after", upload.after_reset.as_str()])
                    .args(["write_flash", "-z"])
                    .args(["--flash_mode", image_flash_mode(self.board)])
                    .arg("--flash_freq")
                    .arg(image_frequency(self.board))
                    .args(["--flash_size", "detect"]);
                for (offset, path) in payload.images(self.board)? {
                    command = command.arg(format!("{:#x}", offset)).path_arg(&path);
                }
                Ok(command)
            }
            UploadProtocol::Ota { host } => {
                let script = existing(self.paths.espota_script())?;
                let mut command = ToolCommand::new(self.paths.python())
                    .path_arg(&script)
                    .args(["--debug", "--progress", "-i", host.as_str()]);
                if matches!(payload, Payload::Filesystem(_)) {
                    command = command.arg("--spiffs");
                }
                Ok(command.arg("-f").path_arg(payload.single()?))
            }
            UploadProtocol::Debugger {
                server_args, speed, ..
            } => {
                let mut args = vec![format!("-d{}", if self.verbose { 2 } else { 1 })];
                args.extend(server_args.iter().cloned());
                args.push("-c".to_string());
                args.push(format!("adapter speed {}", speed));
                for (offset, path) in payload.images(self.board)? {
                    args.push("-c".to_string());
                    args.push(format!(
                        "program_esp {{{{{}}}}} {:#x} verify",
                        unix_slashes(&path),
                        offset
                    ));
                }
                args.push("-c".to_string());
                args.push("reset run; shutdown".to_string());

                let package_dir = unix_slashes(&self.paths.openocd_dir());
                Ok(ToolCommand::new("openocd")
                    .args(args.iter().map(|arg| arg.replace("$PACKAGE_DIR", &package_dir))))
            }
            UploadProtocol::Dfu { hwids } => {
                if matches!(payload, Payload::Filesystem(_)) {
                    return Err(UploadError::UnsupportedOperation {
                        protocol: protocol.name().to_string(),
                        operation: "filesystem upload",
                    });
                }
                let devices = hwids
                    .iter()
                    .map(|(vid, pid)| format!("{}:{}", vid, pid))
                    .collect::<Vec<_>>()
                    .join(",");
                Ok(ToolCommand::new(existing(self.paths.dfu_util())?)
                    .args(["-d".to_string(), devices])
                    .args(["-Q", "-D"])
                    .path_arg(payload.single()?))
            }
            UploadProtocol::Custom {
                command,
                port: custom_port,
                speed,
            } => {
                let line = command
                    .replace("$SOURCE", &payload.single()?.to_string_lossy())
                    .replace("$UPLOAD_PORT", port.or(custom_port.as_deref()).unwrap_or(""))
                    .replace("$UPLOAD_SPEED", &speed.to_string());
                Ok(shell(line))
            }
        }
    }

    fn esptool(&self, port: Option<&str>) -> Result<ToolCommand, UploadError> {
        let port = port.ok_or_else(|| UploadError::NoPortFound {
            protocol: "esptool".to_string(),
            key: super::UPLOAD_PORT_KEY,
        })?;
        let script = existing(self.paths.esptool_script())?;
        Ok(ToolCommand::new(self.paths.python())
            .path_arg(&script)
            .args(["--chip", self.board.mcu(), "--port", port]))
    }
}

fn existing(path: PathBuf) -> Result<PathBuf, UploadError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(UploadError::UploaderNotFound(path))
    }
}

fn unix_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn shell(line: String) -> ToolCommand {
    if cfg!(windows) {
        ToolCommand::new("cmd").args(["/C".to_string(), line])
    } else {
        ToolCommand::new("sh").args(["-c".to_string(), line])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::{Artifact, ArtifactKind},
        layout::{FlashLayoutBuilder, ResolvedArtifacts},
        test_util::ScratchDir,
    };

    fn layout(scratch: &ScratchDir, board: &BoardConfig) -> FlashLayout {
        let image = |kind: ArtifactKind, name: &str| {
            Artifact::new(kind, scratch.file(format!("project/.build/{}", name), 0x100))
        };
        FlashLayoutBuilder::new(board)
            .build(ResolvedArtifacts {
                bootloader: image(ArtifactKind::Bootloader, "bootloader.bin"),
                partitions: image(ArtifactKind::Partitions, "partitions.bin"),
                boot_stub: image(ArtifactKind::BootStub, "boot_app0.bin"),
                application: image(ArtifactKind::Application, "firmware.bin"),
                extra: Vec::new(),
            })
            .unwrap()
    }

    fn serial() -> UploadProtocol {
        UploadProtocol::Serial {
            port: None,
            speed: 921600,
        }
    }

    #[test]
    fn esptool_writes_every_entry_in_offset_order() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        scratch.file("platform/packages/tool-esptoolpy/esptool.py", 1);
        let board = BoardConfig::from_toml_str("[build]\nmcu = \"esp32\"\nflash_mode = \"qio\"\n").unwrap();
        let layout = layout(&scratch, &board);

        let commands = CommandSet::new(&board, &paths, false)
            .build(&serial(), Some("/dev/ttyUSB0"), &UploadTarget::Firmware(&layout))
            .unwrap();

        assert_eq!(commands.len(), 1);
        let args = &commands[0].args;
        assert_eq!(
            args[1..19],
            [
                "--chip", "esp32", "--port", "/dev/ttyUSB0", "--baud", "921600", "--before",
                "default_reset", "--after", "hard_reset", "write_flash", "-z", "--flash_mode",
                "dio", "--flash_freq", "40m", "--flash_size", "detect",
            ]
        );
        assert_eq!(args[19], "0x1000");
        assert_eq!(args[20], paths.bootloader_bin().to_string_lossy());
        let offsets: Vec<&str> = args
            .iter()
            .filter(|arg| arg.starts_with("0x"))
            .map(String::as_str)
            .collect();
        assert_eq!(offsets, ["0x1000", "0x8000", "0xe000", "0x10000"]);
        assert!(args.last().unwrap().ends_with("firmware.bin"));
    }

    #[test]
    fn erase_and_upload_erases_first() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        scratch.file("platform/packages/tool-esptoolpy/esptool.py", 1);
        let board = BoardConfig::from_toml_str("[build]\nmcu = \"esp32s3\"\n").unwrap();
        let layout = layout(&scratch, &board);

        let commands = CommandSet::new(&board, &paths, false)
            .build(&serial(), Some("COM3"), &UploadTarget::EraseAndFirmware(&layout))
            .unwrap();

        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0].args[1..],
            ["--chip", "esp32s3", "--port", "COM3", "erase_flash"]
        );
        assert!(commands[1].args.contains(&"write_flash".to_string()));
    }

    #[test]
    fn ota_sends_only_the_application() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        scratch.file("platform/prebuilt/include/arduino/tools/espota.py", 1);
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let ota = UploadProtocol::Ota {
            host: "192.168.1.5".to_string(),
        };

        let commands = CommandSet::new(&board, &paths, false)
            .build(&ota, None, &UploadTarget::Firmware(&layout))
            .unwrap();

        let args = &commands[0].args;
        assert_eq!(args[1..6], ["--debug", "--progress", "-i", "192.168.1.5", "-f"]);
        assert_eq!(args.len(), 7);
        assert!(args[6].ends_with("firmware.bin"));
    }

    #[test]
    fn ota_needs_espota_script() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let ota = UploadProtocol::Ota {
            host: "lamp.local".to_string(),
        };

        let err = CommandSet::new(&board, &paths, false)
            .build(&ota, None, &UploadTarget::Filesystem(Path::new("fs.bin")))
            .unwrap_err();
        assert!(matches!(err, UploadError::UploaderNotFound(path) if path.ends_with("espota.py")));
    }

    #[test]
    fn openocd_programs_each_entry() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let debugger = UploadProtocol::Debugger {
            tool: "esp-prog".to_string(),
            server_args: vec!["-s".to_string(), "$PACKAGE_DIR/share/openocd/scripts".to_string()],
            speed: 5000,
        };

        let commands = CommandSet::new(&board, &paths, true)
            .build(&debugger, None, &UploadTarget::Firmware(&layout))
            .unwrap();

        let command = &commands[0];
        assert_eq!(command.program, PathBuf::from("openocd"));
        assert_eq!(command.args[0], "-d2");
        assert_eq!(
            command.args[2],
            format!("{}/share/openocd/scripts", unix_slashes(&paths.openocd_dir()))
        );
        assert_eq!(command.args[3..5], ["-c", "adapter speed 5000"]);
        let programs: Vec<&String> = command
            .args
            .iter()
            .filter(|arg| arg.starts_with("program_esp"))
            .collect();
        assert_eq!(programs.len(), 4);
        assert_eq!(
            *programs[0],
            format!(
                "program_esp {{{{{}}}}} 0x1000 verify",
                unix_slashes(&paths.bootloader_bin())
            )
        );
        assert_eq!(command.args.last().unwrap(), "reset run; shutdown");
    }

    #[test]
    fn filesystem_needs_offset_for_multi_image_tools() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        scratch.file("platform/packages/tool-esptoolpy/esptool.py", 1);
        let image = scratch.file("project/.build/littlefs.bin", 0x1000);
        let commands = CommandSet::new(
            &BoardConfig::from_toml_str("").unwrap(),
            &paths,
            false,
        )
        .build(&serial(), Some("COM3"), &UploadTarget::Filesystem(&image));
        assert!(matches!(commands, Err(UploadError::MissingFilesystemOffset)));

        let board = BoardConfig::from_toml_str("[upload]\nfs_offset = \"0x290000\"\n").unwrap();
        let commands = CommandSet::new(&board, &paths, false)
            .build(&serial(), Some("COM3"), &UploadTarget::Filesystem(&image))
            .unwrap();
        let args = &commands[0].args;
        assert_eq!(args[args.len() - 2], "0x290000");
        assert_eq!(args[args.len() - 1], image.to_string_lossy());
    }

    #[test]
    fn erase_is_esptool_only() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let dfu = UploadProtocol::Dfu {
            hwids: vec![("0x2341".to_string(), "0x0070".to_string())],
        };

        let err = CommandSet::new(&board, &paths, false)
            .build(&dfu, None, &UploadTarget::Erase)
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::UnsupportedOperation {
                operation: "erase",
                ..
            }
        ));
    }

    #[test]
    fn dfu_joins_hardware_ids() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        scratch.file("platform/packages/tool-dfuutil-arduino/dfu-util", 1);
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let dfu = UploadProtocol::Dfu {
            hwids: vec![
                ("0x2341".to_string(), "0x0070".to_string()),
                ("0x303a".to_string(), "0x1001".to_string()),
            ],
        };

        let commands = CommandSet::new(&board, &paths, false)
            .build(&dfu, None, &UploadTarget::Firmware(&layout))
            .unwrap();

        assert_eq!(commands[0].program, paths.dfu_util());
        assert_eq!(
            commands[0].args[..4],
            ["-d", "0x2341:0x0070,0x303a:0x1001", "-Q", "-D"]
        );
    }

    #[test]
    fn custom_template_is_substituted() {
        let scratch = ScratchDir::new();
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let custom = UploadProtocol::Custom {
            command: "flasher -p $UPLOAD_PORT -b $UPLOAD_SPEED $SOURCE".to_string(),
            port: Some("/dev/ttyACM1".to_string()),
            speed: 115200,
        };

        let commands = CommandSet::new(&board, &paths, false)
            .build(&custom, None, &UploadTarget::Firmware(&layout))
            .unwrap();

        let line = commands[0].args.last().unwrap();
        assert_eq!(
            *line,
            format!(
                "flasher -p /dev/ttyACM1 -b 115200 {}",
                paths.firmware_bin().display()
            )
        );
    }
}
