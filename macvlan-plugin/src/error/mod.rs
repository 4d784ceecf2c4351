use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors returned by the driver core.
///
/// Every variant is reported to the engine as a `{"Err": ...}` body; the
/// variant only selects the HTTP status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Empty or malformed identifier or request body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown network, endpoint or interface.
    #[error("not found: {0}")]
    NotFound(String),

    /// Slot or name already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid option, mode or address.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A kernel link operation failed.
    #[error("provisioning failed: {0}")]
    Provisioning(String),
}

impl DriverError {
    /// HTTP status the dispatcher answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Provisioning(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
