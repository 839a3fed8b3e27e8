use std::sync::atomic::AtomicBool;

use log::{debug, info, warn};

use crate::{
    config::BoardConfig,
    platform::PlatformPaths,
    tool::{ToolCommand, ToolRunner},
};

use super::{
    command::{CommandSet, UploadTarget},
    port::{is_port_busy, wait_for_new_port, PortInfo, PortScanner, WaitPolicy},
    UploadError, UploadProtocol, UPLOAD_PORT_KEY,
};

const TOUCH_BAUD_RATE: u32 = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    PortDetection,
    PreflightAction,
    Transfer,
    Done,
    Failed,
}

/// Shared collaborators for every upload of one invocation.
pub struct UploadDispatcher<'a> {
    board: &'a BoardConfig,
    paths: &'a PlatformPaths,
    runner: &'a dyn ToolRunner,
    scanner: &'a dyn PortScanner,
    abort: Option<&'a AtomicBool>,
    wait: WaitPolicy,
    verbose: bool,
}

impl<'a> UploadDispatcher<'a> {
    pub fn new(
        board: &'a BoardConfig,
        paths: &'a PlatformPaths,
        runner: &'a dyn ToolRunner,
        scanner: &'a dyn PortScanner,
    ) -> Self {
        Self {
            board,
            paths,
            runner,
            scanner,
            abort: None,
            wait: WaitPolicy::default(),
            verbose: false,
        }
    }

    /// Raised by the invoker to cancel the wait for a new port.
    pub fn with_abort_flag(self, abort: &'a AtomicBool) -> Self {
        Self {
            abort: Some(abort),
            ..self
        }
    }

    pub fn with_wait_policy(self, wait: WaitPolicy) -> Self {
        Self { wait, ..self }
    }

    pub fn with_verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }

    pub fn session<'s>(
        &'s self,
        protocol: UploadProtocol,
        target: UploadTarget<'s>,
    ) -> UploadSession<'s, 'a> {
        UploadSession {
            dispatcher: self,
            port: match &protocol {
                UploadProtocol::Serial { port, .. } => port.clone(),
                _ => None,
            },
            protocol,
            target,
            state: UploadState::Idle,
            commands: Vec::new(),
        }
    }

    pub fn dispatch(&self, protocol: UploadProtocol, target: UploadTarget<'_>) -> Result<(), UploadError> {
        self.session(protocol, target).run()
    }
}

/// One pass through the upload state machine.
///
/// `Idle -> PortDetection -> PreflightAction -> Transfer -> Done`, with `Failed` reachable from
/// every step. Protocols without a port skip `PortDetection`.
pub struct UploadSession<'s, 'a> {
    dispatcher: &'s UploadDispatcher<'a>,
    protocol: UploadProtocol,
    target: UploadTarget<'s>,
    state: UploadState,
    port: Option<String>,
    commands: Vec<ToolCommand>,
}

impl UploadSession<'_, '_> {
    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn protocol(&self) -> &UploadProtocol {
        &self.protocol
    }

    /// The serial port in use, once detected.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Commands built on entering `Transfer`.
    pub fn commands(&self) -> &[ToolCommand] {
        &self.commands
    }

    pub fn run(mut self) -> Result<(), UploadError> {
        while !matches!(self.state, UploadState::Done | UploadState::Failed) {
            self.step()?;
        }
        Ok(())
    }

    /// Advances by one state. Terminal states stay where they are.
    pub fn step(&mut self) -> Result<UploadState, UploadError> {
        let next = match self.state {
            UploadState::Idle if self.protocol.needs_port() => Ok(UploadState::PortDetection),
            UploadState::Idle => Ok(UploadState::PreflightAction),
            UploadState::PortDetection => self.detect_port().map(|_| UploadState::PreflightAction),
            UploadState::PreflightAction => self.preflight().map(|_| UploadState::Transfer),
            UploadState::Transfer => self.transfer().map(|_| UploadState::Done),
            UploadState::Done | UploadState::Failed => return Ok(self.state),
        };

        let (next, result) = match next {
            Ok(next) => (next, Ok(next)),
            Err(err) => (UploadState::Failed, Err(err)),
        };
        debug!("Upload {:?} -> {:?}", self.state, next);
        self.state = next;
        result
    }

    fn detect_port(&mut self) -> Result<(), UploadError> {
        if !matches!(self.protocol, UploadProtocol::Serial { .. }) {
            debug!("{} locates its adapter itself", self.protocol.name());
            return Ok(());
        }
        if let Some(port) = &self.port {
            debug!("Using configured port {}", port);
            return Ok(());
        }

        info!("Looking for upload port...");
        let ports = self.dispatcher.scanner.available_ports()?;
        let port = ports
            .iter()
            .find(|port| port.usb)
            .or_else(|| ports.first())
            .ok_or_else(|| UploadError::NoPortFound {
                protocol: self.protocol.name().to_string(),
                key: UPLOAD_PORT_KEY,
            })?;

        info!("Auto-detected: {}", port.name);
        self.port = Some(port.name.clone());
        Ok(())
    }

    fn preflight(&mut self) -> Result<(), UploadError> {
        if let Some(port) = self.port.clone() {
            self.reset_into_bootloader(&port)?;
        }

        if let Some(layout) = self.target.layout() {
            info!("Uploading with {}:\n{}", self.protocol.name(), layout);
        }

        self.commands = CommandSet::new(
            self.dispatcher.board,
            self.dispatcher.paths,
            self.dispatcher.verbose,
        )
        .build(&self.protocol, self.port.as_deref(), &self.target)?;
        Ok(())
    }

    /// 1200 bps touch and wait for the port to come back, as requested by the board.
    fn reset_into_bootloader(&mut self, port: &str) -> Result<(), UploadError> {
        let upload = &self.dispatcher.board.upload;
        if !upload.use_1200bps_touch && !upload.wait_for_upload_port {
            return Ok(());
        }

        let scanner = self.dispatcher.scanner;
        let before: Vec<PortInfo> = scanner.available_ports()?;

        if upload.use_1200bps_touch {
            debug!("Touching {} at {} baud", port, TOUCH_BAUD_RATE);
            scanner.touch(port, TOUCH_BAUD_RATE)?;
        }

        if upload.wait_for_upload_port {
            let never = AtomicBool::new(false);
            let abort = self.dispatcher.abort.unwrap_or(&never);
            match wait_for_new_port(scanner, &before, self.dispatcher.wait, abort)? {
                Some(new_port) => {
                    info!("Upload port changed to {}", new_port.name);
                    self.port = Some(new_port.name);
                }
                None => warn!("No new port appeared, staying on {}", port),
            }
        }
        Ok(())
    }

    fn transfer(&mut self) -> Result<(), UploadError> {
        for command in &self.commands {
            let output = self.dispatcher.runner.run(command)?;
            if output.success() {
                continue;
            }

            let diagnostic = output.diagnostic().to_string();
            if is_port_busy(&diagnostic) {
                return Err(UploadError::PortBusy {
                    port: self.target_name(),
                    diagnostic,
                });
            }
            return Err(UploadError::TransferFailed {
                command: command.to_string(),
                diagnostic,
            });
        }
        Ok(())
    }

    fn target_name(&self) -> String {
        match (&self.protocol, &self.port) {
            (UploadProtocol::Ota { host }, _) => host.clone(),
            (_, Some(port)) => port.clone(),
            (protocol, None) => protocol.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        artifact::{Artifact, ArtifactKind},
        layout::{FlashLayout, FlashLayoutBuilder, ResolvedArtifacts},
        test_util::{FakeScanner, RecordingRunner, ScratchDir},
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

    fn install_tools(scratch: &ScratchDir) {
        scratch.file("platform/packages/tool-esptoolpy/esptool.py", 1);
        scratch.file("platform/prebuilt/include/arduino/tools/espota.py", 1);
    }

    #[test]
    fn no_port_and_nothing_detected_fails_without_running_tools() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let runner = RecordingRunner::succeeding();
        let scanner = FakeScanner::new(vec![Vec::new()]);
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner);

        let protocol = UploadProtocol::select("esptool", None, &board).unwrap();
        let mut session = dispatcher.session(protocol, UploadTarget::Firmware(&layout));

        assert_eq!(session.step().unwrap(), UploadState::PortDetection);
        let err = session.step().unwrap_err();

        assert!(matches!(err, UploadError::NoPortFound { key: "upload_port", .. }));
        assert_eq!(session.state(), UploadState::Failed);
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn ip_port_with_esptool_uploads_over_the_air() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let runner = RecordingRunner::succeeding();
        let scanner = FakeScanner::new(vec![Vec::new()]);
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner);

        let protocol = UploadProtocol::select("esptool", Some("192.168.1.5"), &board).unwrap();
        let mut session = dispatcher.session(protocol, UploadTarget::Firmware(&layout));

        assert_eq!(session.step().unwrap(), UploadState::PreflightAction);
        assert_eq!(session.step().unwrap(), UploadState::Transfer);
        assert_eq!(session.step().unwrap(), UploadState::Done);

        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].args[0].ends_with("espota.py"));
        assert!(commands[0].args.contains(&"192.168.1.5".to_string()));
        assert_eq!(scanner.scans(), 0);
    }

    #[test]
    fn autodetect_prefers_usb_ports() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let runner = RecordingRunner::succeeding();
        let scanner = FakeScanner::new(vec![vec![
            PortInfo::new("/dev/ttyS0", false),
            PortInfo::new("/dev/ttyUSB0", true),
        ]]);
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner);

        dispatcher
            .dispatch(
                UploadProtocol::select("esptool", None, &board).unwrap(),
                UploadTarget::Firmware(&layout),
            )
            .unwrap();

        let commands = runner.commands();
        let port = commands[0].args.iter().position(|arg| arg == "--port").unwrap();
        assert_eq!(commands[0].args[port + 1], "/dev/ttyUSB0");
    }

    #[test]
    fn touch_and_wait_switch_to_new_port() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str(
            "[build]\nmcu = \"esp32s3\"\n[upload]\nuse_1200bps_touch = true\nwait_for_upload_port = true\n",
        )
        .unwrap();
        let layout = layout(&scratch, &board);
        let runner = RecordingRunner::succeeding();
        let scanner = FakeScanner::new(vec![
            vec![PortInfo::new("/dev/ttyACM0", true)],
            Vec::new(),
            vec![PortInfo::new("/dev/ttyACM1", true)],
        ]);
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner).with_wait_policy(
            WaitPolicy {
                attempts: 5,
                interval: Duration::ZERO,
            },
        );

        let protocol = UploadProtocol::select("esptool", Some("/dev/ttyACM0"), &board).unwrap();
        let mut session = dispatcher.session(protocol, UploadTarget::Firmware(&layout));
        while session.step().unwrap() != UploadState::Done {}

        assert_eq!(scanner.touches(), vec![("/dev/ttyACM0".to_string(), 1200)]);
        assert_eq!(session.port(), Some("/dev/ttyACM1"));
        assert!(runner.commands()[0].args.contains(&"/dev/ttyACM1".to_string()));
    }

    #[test]
    fn locked_port_is_busy_not_failed() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let runner = RecordingRunner::failing(
            2,
            "A fatal error occurred: Could not exclusively lock port /dev/ttyUSB0: [Errno 11] Resource temporarily unavailable",
        );
        let scanner = FakeScanner::new(vec![Vec::new()]);
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner);

        let err = dispatcher
            .dispatch(
                UploadProtocol::select("esptool", Some("/dev/ttyUSB0"), &board).unwrap(),
                UploadTarget::Firmware(&layout),
            )
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(err, UploadError::PortBusy { port, .. } if port == "/dev/ttyUSB0"));
    }

    #[test]
    fn busy_port_during_touch_is_retryable() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("[upload]\nuse_1200bps_touch = true\n").unwrap();
        let layout = layout(&scratch, &board);
        let runner = RecordingRunner::succeeding();
        let scanner = FakeScanner::new(vec![vec![PortInfo::new("/dev/ttyACM0", true)]])
            .failing_touch("Device or resource busy");
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner);

        let err = dispatcher
            .dispatch(
                UploadProtocol::select("esptool", Some("/dev/ttyACM0"), &board).unwrap(),
                UploadTarget::Firmware(&layout),
            )
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(err, UploadError::PortBusy { port, .. } if port == "/dev/ttyACM0"));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn tool_diagnostic_is_passed_through() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let diagnostic = "A fatal error occurred: Failed to connect to ESP32: No serial data received.";
        let runner = RecordingRunner::failing(2, diagnostic);
        let scanner = FakeScanner::new(vec![Vec::new()]);
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner);

        let mut session = dispatcher.session(
            UploadProtocol::select("esptool", Some("COM5"), &board).unwrap(),
            UploadTarget::Erase,
        );
        let err = loop {
            match session.step() {
                Ok(_) => continue,
                Err(err) => break err,
            }
        };

        match err {
            UploadError::TransferFailed { command, diagnostic: text } => {
                assert!(command.ends_with("erase_flash"));
                assert_eq!(text, diagnostic);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.state(), UploadState::Failed);
        assert_eq!(session.step().unwrap(), UploadState::Failed);
    }

    #[test]
    fn erase_and_upload_stops_after_failed_erase() {
        let scratch = ScratchDir::new();
        install_tools(&scratch);
        let paths = scratch.platform();
        let board = BoardConfig::from_toml_str("").unwrap();
        let layout = layout(&scratch, &board);
        let runner = RecordingRunner::failing(1, "erase failed");
        let scanner = FakeScanner::new(vec![Vec::new()]);
        let dispatcher = UploadDispatcher::new(&board, &paths, &runner, &scanner);

        let result = dispatcher.dispatch(
            UploadProtocol::select("esptool", Some("COM5"), &board).unwrap(),
            UploadTarget::EraseAndFirmware(&layout),
        );

        assert!(matches!(result, Err(UploadError::TransferFailed { .. })));
        assert_eq!(runner.commands().len(), 1);
    }
}
