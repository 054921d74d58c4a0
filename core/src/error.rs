use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NVRAM encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse ICC profile: {0}")]
    XmlParse(#[from] xmltree::ParseError),

    #[error("Failed to write ICC profile: {0}")]
    XmlWrite(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Looper has been stopped")]
    LooperStopped,
}

pub type Result<T> = std::result::Result<T, ModemError>;

/// `+CME ERROR` codes used on the AT boundary (3GPP TS 27.007 §9.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmeError {
    OperationNotAllowed = 3,
    OperationNotSupported = 4,
    SimNotInserted = 10,
    SimPinRequired = 11,
    SimPukRequired = 12,
    SimBusy = 14,
    IncorrectPassword = 16,
    MemoryFull = 20,
    InvalidIndex = 21,
    NotFound = 22,
    DialStringTooLong = 27,
    NoNetworkService = 30,
    EmergencyCallsOnly = 32,
    IncorrectParameters = 50,
    InvalidTextParameter = 53,
    FixedDialNumberOnly = 56,
}

impl CmeError {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for CmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+CME ERROR: {}", self.code())
    }
}

/// `+CMS ERROR` codes used by the SMS service (3GPP TS 27.005 §3.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmsError {
    OperationNotAllowed = 302,
    OperationNotSupported = 303,
    InvalidPduModeParameter = 304,
}

impl CmsError {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for CmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+CMS ERROR: {}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cme_error_wire_format() {
        assert_eq!(CmeError::NoNetworkService.to_string(), "+CME ERROR: 30");
        assert_eq!(CmeError::OperationNotSupported.to_string(), "+CME ERROR: 4");
        assert_eq!(CmeError::FixedDialNumberOnly.code(), 56);
    }

    #[test]
    fn test_cms_error_wire_format() {
        assert_eq!(CmsError::InvalidPduModeParameter.to_string(), "+CMS ERROR: 304");
    }
}
