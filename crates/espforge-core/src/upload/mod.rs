//! Writing a flash layout to a device.
//!
//! [`UploadProtocol`] is chosen once per invocation. [`UploadDispatcher`] then walks an
//! [`UploadSession`] through port detection, preflight and transfer, running every external
//! command through a [`ToolRunner`](crate::tool::ToolRunner).

use std::path::PathBuf;

use thiserror::Error;

use crate::tool::ToolError;

mod command;
mod dispatcher;
mod port;
mod protocol;

pub use command::{CommandSet, UploadTarget};
pub use dispatcher::{UploadDispatcher, UploadSession, UploadState};
#[cfg(feature = "serial")]
pub use port::SerialPortScanner;
pub use port::{
    is_network_address, is_port_busy, open_error, wait_for_new_port, PortInfo, PortScanner,
    WaitPolicy,
};
pub use protocol::{UploadProtocol, KNOWN_DEBUG_TOOLS};

/// Key named in port and host errors, settable with `--upload-port` or `UPLOAD_PORT`.
pub const UPLOAD_PORT_KEY: &str = "upload_port";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No serial port found for '{protocol}', connect the board or set `{key}` (--upload-port or UPLOAD_PORT)")]
    NoPortFound { protocol: String, key: &'static str },
    #[error("Protocol 'espota' needs the device address in `{key}` (--upload-port or UPLOAD_PORT)")]
    MissingHost { key: &'static str },
    #[error("Unknown upload protocol '{0}'")]
    UnsupportedProtocol(String),
    #[error("Protocol '{protocol}' does not support {operation}")]
    UnsupportedOperation {
        protocol: String,
        operation: &'static str,
    },
    #[error("Debug tool '{0}' is not defined in the board's [debug.tools] table")]
    MissingDebugTool(String),
    #[error("Protocol 'custom' needs `upload.command` in the board descriptor")]
    MissingCustomCommand,
    #[error("Filesystem upload needs `upload.fs_offset` in the board descriptor")]
    MissingFilesystemOffset,
    #[error("Flash layout has no application image")]
    MissingApplication,
    #[error("Upload tool {0} not found")]
    UploaderNotFound(PathBuf),
    #[error("Port {port} is busy, close any serial monitor using it and retry:\n{diagnostic}")]
    PortBusy { port: String, diagnostic: String },
    #[error("`{command}` failed:\n{diagnostic}")]
    TransferFailed { command: String, diagnostic: String },
    #[error("Upload aborted")]
    Aborted,
    #[error("Serial port error: {0}")]
    Serial(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl UploadError {
    /// A locked port clears once the other user lets go of it, every other failure needs a fix
    /// first. Writes are never retried here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::PortBusy { .. })
    }
}
