use log::warn;

use crate::config::BoardConfig;

use super::{port::is_network_address, UploadError, UPLOAD_PORT_KEY};

/// Debug adapters a board may declare under `[debug.tools]`.
pub const KNOWN_DEBUG_TOOLS: &[&str] = &[
    "cmsis-dap",
    "esp-bridge",
    "esp-builtin",
    "esp-prog",
    "esp-usb-bridge",
    "ftdi",
    "iot-bus-jtag",
    "jlink",
    "minimodule",
    "olimex-arm-usb-ocd",
    "olimex-arm-usb-ocd-h",
    "olimex-arm-usb-tiny-h",
    "olimex-jtag-tiny",
    "tumpa",
];

const DEFAULT_DFU_HWID: (&str, &str) = ("0x2341", "0x0070");

/// The channel used to write the image. Fixed for the whole invocation once selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadProtocol {
    /// esptool over a serial port, detected when not given
    Serial { port: Option<String>, speed: u32 },
    /// espota to a network device
    Ota { host: String },
    /// OpenOCD through a JTAG adapter
    Debugger {
        tool: String,
        server_args: Vec<String>,
        speed: u32,
    },
    Dfu { hwids: Vec<(String, String)> },
    /// A board-provided command template
    Custom {
        command: String,
        port: Option<String>,
        speed: u32,
    },
}

impl UploadProtocol {
    /// Maps a protocol name to its variant.
    ///
    /// A network address given as the port switches any other protocol to `espota`.
    pub fn select(name: &str, port: Option<&str>, board: &BoardConfig) -> Result<Self, UploadError> {
        if let Some(host) = port.filter(|port| is_network_address(port)) {
            if name != "espota" {
                warn!(
                    "We have just detected `upload_port` as IP address or host name of ESP device. \
                     `upload_protocol` is switched to `espota`. \
                     Please set the protocol to `espota` explicitly"
                );
            }
            return Ok(UploadProtocol::Ota {
                host: host.trim_matches('"').to_string(),
            });
        }

        let protocol = match name {
            "espota" => UploadProtocol::Ota {
                host: port
                    .map(|host| host.trim_matches('"'))
                    .filter(|host| !host.is_empty())
                    .ok_or(UploadError::MissingHost { key: UPLOAD_PORT_KEY })?
                    .to_string(),
            },
            "esptool" => UploadProtocol::Serial {
                port: port.map(str::to_string),
                speed: board.upload.speed,
            },
            "dfu" => {
                let mut hwids: Vec<_> = board
                    .build
                    .hwids
                    .iter()
                    .map(|[vid, pid]| (vid.clone(), pid.clone()))
                    .collect();
                if hwids.is_empty() {
                    let (vid, pid) = DEFAULT_DFU_HWID;
                    hwids.push((vid.to_string(), pid.to_string()));
                }
                UploadProtocol::Dfu { hwids }
            }
            "custom" => UploadProtocol::Custom {
                command: board
                    .upload
                    .command
                    .clone()
                    .filter(|command| !command.trim().is_empty())
                    .ok_or(UploadError::MissingCustomCommand)?,
                port: port.map(str::to_string),
                speed: board.upload.speed,
            },
            tool => match board.debug_tool(tool) {
                Some(definition) => UploadProtocol::Debugger {
                    tool: tool.to_string(),
                    server_args: definition.server.arguments.clone(),
                    speed: board.debug.speed,
                },
                None if KNOWN_DEBUG_TOOLS.contains(&tool) => {
                    return Err(UploadError::MissingDebugTool(tool.to_string()))
                }
                None => return Err(UploadError::UnsupportedProtocol(tool.to_string())),
            },
        };
        Ok(protocol)
    }

    pub fn name(&self) -> &str {
        match self {
            UploadProtocol::Serial { .. } => "esptool",
            UploadProtocol::Ota { .. } => "espota",
            UploadProtocol::Debugger { tool, .. } => tool,
            UploadProtocol::Dfu { .. } => "dfu",
            UploadProtocol::Custom { .. } => "custom",
        }
    }

    /// Serial and debugger uploads go through port detection. The debugger's adapter is found
    /// by OpenOCD itself, so only serial uploads scan for ports.
    pub fn needs_port(&self) -> bool {
        matches!(
            self,
            UploadProtocol::Serial { .. } | UploadProtocol::Debugger { .. }
        )
    }
}
