use std::error::Error;
use std::fmt::{Display, Formatter};

pub type EwaldResult<T> = Result<T, EwaldError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EwaldErrorCategory {
    ConfigurationError,
    ReconfigurationError,
    DeviceError,
    InternalError,
}

impl EwaldErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::ConfigurationError => 2,
            Self::ReconfigurationError => 3,
            Self::DeviceError => 4,
            Self::InternalError => 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::ReconfigurationError => "ReconfigurationError",
            Self::DeviceError => "DeviceError",
            Self::InternalError => "InternalError",
        }
    }
}

/// Error raised by any stage of the nonbonded force pipeline.
///
/// `placeholder` is a stable dotted identifier (for example `PARAMS.UNKNOWN_GLOBAL`) that
/// tooling can match on without parsing the human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EwaldError {
    category: EwaldErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl EwaldError {
    pub fn new(
        category: EwaldErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn configuration(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(EwaldErrorCategory::ConfigurationError, placeholder, message)
    }

    pub fn reconfiguration(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(
            EwaldErrorCategory::ReconfigurationError,
            placeholder,
            message,
        )
    }

    pub fn device(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(EwaldErrorCategory::DeviceError, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(EwaldErrorCategory::InternalError, placeholder, message)
    }

    pub const fn category(&self) -> EwaldErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> String {
        format!("FATAL EXIT CODE: {}", self.exit_code())
    }
}

impl Display for EwaldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for EwaldError {}
