//! Debug probe transport contract.
//!
//! The pipeline drives the probe through a single synchronous
//! byte-level contract: send one vendor command frame and receive the
//! matching response frame, plus a non-blocking poll for one pending
//! asynchronous event. USB enumeration, HID report I/O and report
//! fragmentation all live below this trait.

use thiserror::Error;

pub mod edbg;
pub mod fake;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O failed: {0}")]
    Io(String),

    #[error("timed out waiting for a probe response")]
    Timeout,

    /// The probe (or driver) does not implement the requested
    /// capability, e.g. target power control.
    #[error("operation not supported by this probe")]
    Unsupported,
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout
            }
            _ => TransportError::Io(error.to_string()),
        }
    }
}

/// Byte-level channel to an EDBG debug probe.
pub trait WireTransport: Send {
    /// Send one AVR command frame and block until the matching
    /// response frame arrives.
    fn send_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Poll the probe's event stream for one pending AVR event.
    /// Returns `None` when no event is pending.
    fn poll_event(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// The probe's HID report size. Memory access commands are sized so
    /// that neither command nor response spans more than two reports.
    fn report_size(&self) -> usize;

    /// Switch target power on or off, where the probe supports it.
    fn set_target_power(&mut self, _on: bool) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }
}
