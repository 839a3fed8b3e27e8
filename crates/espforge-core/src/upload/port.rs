use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use log::{debug, info};

use super::UploadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// USB serial adapters are preferred during autodetection.
    pub usb: bool,
}

impl PortInfo {
    pub fn new<S: Into<String>>(name: S, usb: bool) -> Self {
        Self {
            name: name.into(),
            usb,
        }
    }
}

/// Access to the host's serial ports.
pub trait PortScanner {
    fn available_ports(&self) -> Result<Vec<PortInfo>, UploadError>;

    /// Opens the port at `baud_rate` and drops it again, which puts boards with native USB into
    /// their bootloader when done at 1200 baud.
    fn touch(&self, port: &str, baud_rate: u32) -> Result<(), UploadError>;
}

/// How long to wait for a port to appear after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            attempts: 100,
            interval: Duration::from_millis(200),
        }
    }
}

/// Polls until a port that was not in `before` shows up.
///
/// Returns `Ok(None)` once the attempts run out, and [`UploadError::Aborted`] as soon as `abort`
/// is raised.
pub fn wait_for_new_port(
    scanner: &dyn PortScanner,
    before: &[PortInfo],
    policy: WaitPolicy,
    abort: &AtomicBool,
) -> Result<Option<PortInfo>, UploadError> {
    info!("Waiting for the new upload port...");

    for attempt in 0..policy.attempts {
        if abort.load(Ordering::SeqCst) {
            return Err(UploadError::Aborted);
        }

        for port in scanner.available_ports()? {
            if !before.iter().any(|old| old.name == port.name) {
                debug!("Found new port {} after {} attempts", port.name, attempt + 1);
                return Ok(Some(port));
            }
        }

        thread::sleep(policy.interval);
    }

    Ok(None)
}

/// Whether `port` names a network device: an IPv4 address or an mDNS `.local` host name,
/// optionally wrapped in double quotes.
pub fn is_network_address(port: &str) -> bool {
    let port = port.strip_prefix('"').unwrap_or(port);
    let port = port.strip_suffix('"').unwrap_or(port);

    is_ipv4(port) || is_mdns_host(port)
}

fn is_ipv4(s: &str) -> bool {
    let groups: Vec<&str> = s.split('.').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|group| (1..=3).contains(&group.len()) && group.bytes().all(|b| b.is_ascii_digit()))
}

fn is_mdns_host(s: &str) -> bool {
    match s.strip_suffix(".local") {
        Some(host) => !host.is_empty() && !host.contains(['/', '\\']),
        None => false,
    }
}

/// Whether a tool's diagnostic says the port is held by another process.
pub fn is_port_busy(diagnostic: &str) -> bool {
    const MARKERS: &[&str] = &[
        "resource busy",
        "could not exclusively lock port",
        "resource temporarily unavailable",
        "access is denied",
        "port is busy",
    ];

    let diagnostic = diagnostic.to_ascii_lowercase();
    MARKERS.iter().any(|marker| diagnostic.contains(marker))
}

/// Classifies a failure to open `port`: a port held by another process is retryable.
pub fn open_error(port: &str, diagnostic: String) -> UploadError {
    if is_port_busy(&diagnostic) {
        UploadError::PortBusy {
            port: port.to_string(),
            diagnostic,
        }
    } else {
        UploadError::Serial(format!("{}: {}", port, diagnostic))
    }
}

#[cfg(feature = "serial")]
pub use serial::SerialPortScanner;

#[cfg(feature = "serial")]
mod serial {
    use std::{thread, time::Duration};

    use serialport::SerialPortType;

    use super::{open_error, PortInfo, PortScanner};
    use crate::upload::UploadError;

    /// [`PortScanner`] over the `serialport` crate.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SerialPortScanner;

    impl PortScanner for SerialPortScanner {
        fn available_ports(&self) -> Result<Vec<PortInfo>, UploadError> {
            let ports =
                serialport::available_ports().map_err(|e| UploadError::Serial(e.to_string()))?;
            Ok(ports
                .into_iter()
                .map(|port| {
                    let usb = matches!(port.port_type, SerialPortType::UsbPort(_));
                    PortInfo::new(port.port_name, usb)
                })
                .collect())
        }

        fn touch(&self, port: &str, baud_rate: u32) -> Result<(), UploadError> {
            let mut serial = serialport::new(port, baud_rate)
                .timeout(Duration::from_millis(100))
                .flow_control(serialport::FlowControl::None)
                .open()
                .map_err(|e| open_error(port, e.to_string()))?;
            serial.write_data_terminal_ready(false).ok();
            drop(serial);

            thread::sleep(Duration::from_millis(400));
            Ok(())
        }
    }
}
