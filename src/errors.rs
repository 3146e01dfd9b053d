pub type Result<T> = std::result::Result<T, IfuError>;

#[derive(Debug, thiserror::Error)]
pub enum IfuError {
    #[error("bad input pattern: {0}")]
    BadPattern(#[from] glob::PatternError),
    #[error("unreadable path: {0}")]
    UnreadablePath(#[from] glob::GlobError),
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    InvalidFITS(String),
    #[error("missing header keyword {0}")]
    MissingKeyword(String),
    /// header or data has the wrong number of axes for the operation
    #[error("{0}")]
    Dimensionality(String),
    #[error("unsupported wcs: {0}")]
    UnsupportedWcs(String),
    #[error("{0}")]
    WavelengthScale(String),
    #[error("{0}")]
    Geometry(String),
    #[error("invalid config: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Table(String),
    #[error("coaddition cancelled")]
    Cancelled,
}

#[cfg(feature = "python")]
impl From<IfuError> for pyo3::PyErr {
    fn from(value: IfuError) -> Self {
        use pyo3::exceptions::{PyOSError, PyRuntimeError, PyTypeError, PyValueError};
        match value {
            IfuError::IOError(e) => PyOSError::new_err(e.to_string()),
            IfuError::UnsupportedWcs(_) => PyTypeError::new_err(value.to_string()),
            IfuError::WavelengthScale(_)
            | IfuError::Geometry(_)
            | IfuError::Cancelled => PyRuntimeError::new_err(value.to_string()),
            IfuError::BadPattern(_)
            | IfuError::UnreadablePath(_)
            | IfuError::InvalidFITS(_)
            | IfuError::MissingKeyword(_)
            | IfuError::Dimensionality(_)
            | IfuError::Config(_)
            | IfuError::InvalidConfig(_)
            | IfuError::Table(_) => PyValueError::new_err(value.to_string()),
        }
    }
}
