//! Device link abstractions.
//!
//! The ingestion loop only needs an async byte source it can read with a timeout
//! and close. Any `AsyncRead + Unpin + Send` value qualifies:
//! - `tokio_serial::SerialStream` (real hardware, see [`open_serial_async`])
//! - `tokio::io::DuplexStream` (tests)
//!
//! Closing a link is dropping it, which releases the underlying port.

use crate::error::{AppResult, ScanlogError};
use tokio::io::AsyncRead;

/// Baseline scanner bit rate.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Async byte source supplying raw scanner input.
pub trait DeviceLink: AsyncRead + Unpin + Send {}

impl<T: AsyncRead + Unpin + Send> DeviceLink for T {}

/// Type-erased device link.
pub type DynLink = Box<dyn DeviceLink>;

/// Open a serial port asynchronously using spawn_blocking.
///
/// Opening can block on some platforms, so it runs off the async runtime.
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns [`ScanlogError::Serial`] if the port cannot be opened.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                ScanlogError::Serial(format!(
                    "Failed to open {} serial port {} at {} baud: {}",
                    device_name_owned, port_path_owned, baud_rate, e
                ))
            })
    })
    .await
    .map_err(|e| ScanlogError::TaskFailed(format!("serial open task: {e}")))?
}

/// Serial support compiled out.
#[cfg(not(feature = "instrument_serial"))]
pub async fn open_serial_async(
    _port_path: &str,
    _baud_rate: u32,
    _device_name: &str,
) -> AppResult<DynLink> {
    Err(ScanlogError::SerialFeatureDisabled)
}
