//! Scanner port discovery.
//!
//! Picks the serial port whose device description mentions one of the configured
//! keywords ("barcode", "scanner", ...). Enumeration uses `serialport`; the
//! matching itself is plain string work so it can be tested without hardware.

use crate::error::{AppResult, ScanlogError};
use tracing::{debug, info};

/// Keywords matched against port descriptions when no port is configured.
pub const DEFAULT_KEYWORDS: [&str; 3] = ["barcode", "scanner", "serial device"];

/// A serial port and a human-readable description of the device behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// Path or name to open (e.g. `/dev/ttyACM0`, `COM3`).
    pub port_name: String,
    /// Product/manufacturer text reported by the OS.
    pub description: String,
}

impl PortCandidate {
    /// Create a candidate.
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
        }
    }

    /// Whether the description contains any keyword, ignoring case.
    pub fn matches(&self, keywords: &[String]) -> bool {
        let description = self.description.to_lowercase();
        keywords
            .iter()
            .any(|k| !k.is_empty() && description.contains(&k.to_lowercase()))
    }
}

/// First candidate matching `keywords`, in enumeration order.
pub fn select_port<'a>(
    candidates: &'a [PortCandidate],
    keywords: &[String],
) -> AppResult<&'a PortCandidate> {
    candidates
        .iter()
        .find(|c| c.matches(keywords))
        .ok_or_else(|| ScanlogError::NoLinkAvailable {
            keywords: keywords.to_vec(),
        })
}

/// Enumerate serial ports with their descriptions.
#[cfg(feature = "instrument_serial")]
pub fn list_ports() -> AppResult<Vec<PortCandidate>> {
    use serialport::{available_ports, SerialPortType};

    let ports = available_ports().map_err(|e| ScanlogError::Serial(e.to_string()))?;
    let candidates = ports
        .into_iter()
        .map(|port| {
            let description = match &port.port_type {
                SerialPortType::UsbPort(info) => {
                    match (info.product.as_deref(), info.manufacturer.as_deref()) {
                        (Some(product), Some(manufacturer)) => {
                            format!("{product} ({manufacturer})")
                        }
                        (Some(product), None) => product.to_string(),
                        (None, Some(manufacturer)) => manufacturer.to_string(),
                        (None, None) => format!("USB {:04x}:{:04x}", info.vid, info.pid),
                    }
                }
                SerialPortType::PciPort => "PCI serial port".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
                SerialPortType::Unknown => port.port_name.clone(),
            };
            PortCandidate::new(port.port_name, description)
        })
        .collect::<Vec<_>>();

    debug!(count = candidates.len(), "Enumerated serial ports");
    Ok(candidates)
}

/// Serial support compiled out.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_ports() -> AppResult<Vec<PortCandidate>> {
    Err(ScanlogError::SerialFeatureDisabled)
}

/// Resolve the scanner's port by description keywords.
pub fn find_scanner_port(keywords: &[String]) -> AppResult<String> {
    let candidates = list_ports()?;
    let chosen = select_port(&candidates, keywords)?;
    info!(
        port = %chosen.port_name,
        description = %chosen.description,
        "Selected scanner port"
    );
    Ok(chosen.port_name.clone())
}
