//! Transport seam towards the DTU.
//!
//! The coordinator only knows this trait; the binary provides a Modbus-TCP
//! implementation. The error taxonomy separates the everyday "DTU did not
//! answer" case, which the coordinator logs at warning level and retries on
//! the next scheduled poll, from protocol-level faults that deserve a full
//! error report.

use thiserror::Error;

use crate::plant_data::PlantData;

#[derive(Debug, Error)]
pub enum DtuError {
    /// The DTU sent nothing, or fewer bytes than a minimal response.
    #[error("no or short response from DTU: {0}")]
    NoResponse(String),
    /// The DTU answered with a Modbus exception or a malformed frame.
    #[error("DTU protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DtuError {
    /// Whether the fault is an expected transient condition that the next
    /// scheduled poll is likely to clear.
    pub fn is_transient(&self) -> bool {
        match self {
            DtuError::NoResponse(_) => true,
            DtuError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionRefused
            ),
            DtuError::Protocol(_) => false,
        }
    }
}

pub trait DtuClient {
    /// Fetch the current plant snapshot from the DTU.
    fn plant_data(&mut self) -> Result<PlantData, DtuError>;
}
