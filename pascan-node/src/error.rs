//! Host facing error types

use pascan_common::sdo::AbortCode;
use snafu::Snafu;

/// Error returned by host API calls on a device or node
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum DeviceError {
    /// An argument was invalid or inconsistent with the dictionary state
    InvalidParameter,
    /// Memory for a dictionary mutation could not be allocated
    OutOfMemory,
    /// The addressed object or sub-object does not exist
    NotFound,
    /// The service or transfer channel is already in use
    Busy,
    /// The operation did not complete in time
    Timeout,
}

impl From<AbortCode> for DeviceError {
    fn from(code: AbortCode) -> Self {
        match code {
            AbortCode::NoSuchObject | AbortCode::NoSuchSubIndex => DeviceError::NotFound,
            AbortCode::OutOfMemory => DeviceError::OutOfMemory,
            AbortCode::Timeout => DeviceError::Timeout,
            _ => DeviceError::InvalidParameter,
        }
    }
}
