//! Closed catalog of session error codes.
//!
//! Every public session operation reports its result through an
//! [`ErrorMessage`]. Callers compare on [`ErrorCode`]; the message and
//! description are meant for end users and default to the catalog text.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    NoError = 0,
    Unknown = 1,
    InvalidCredentials = 2,
    InvalidToken = 3,
    ExpiredToken = 4,
    Internal = 5,
    AccessDenied = 6,
    InstanceNotFound = 7,
    InsufficientPermissions = 8,
    UserAlreadyExists = 9,
    SuspendedUser = 10,
    BadGeneratedToken = 11,
    InvalidCaptcha = 12,
}

impl ErrorCode {
    pub const ALL: [Self; 13] = [
        Self::NoError,
        Self::Unknown,
        Self::InvalidCredentials,
        Self::InvalidToken,
        Self::ExpiredToken,
        Self::Internal,
        Self::AccessDenied,
        Self::InstanceNotFound,
        Self::InsufficientPermissions,
        Self::UserAlreadyExists,
        Self::SuspendedUser,
        Self::BadGeneratedToken,
        Self::InvalidCaptcha,
    ];

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Unknown codes fold into [`ErrorCode::Unknown`].
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.code() == code)
            .unwrap_or(Self::Unknown)
    }

    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NoError => "No error",
            Self::Unknown => "Unknown error",
            Self::InvalidCredentials => "Invalid credentials",
            Self::InvalidToken => "Invalid token",
            Self::ExpiredToken => "Expired token",
            Self::Internal => "Internal error",
            Self::AccessDenied => "Access denied",
            Self::InstanceNotFound => "Instance not found",
            Self::InsufficientPermissions => "Insufficient permissions",
            Self::UserAlreadyExists => "User already exists",
            Self::SuspendedUser => "Suspended user",
            Self::BadGeneratedToken => "Bad generated token",
            Self::InvalidCaptcha => "Invalid captcha",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::NoError => "The operation completed successfully",
            Self::Unknown => "An unknown error occurred",
            Self::InvalidCredentials => "The login id or the password are not valid",
            Self::InvalidToken => "The session token is not valid",
            Self::ExpiredToken => "The session token has expired",
            Self::Internal => "An internal error occurred, try again later",
            Self::AccessDenied => "You do not have access to this resource",
            Self::InstanceNotFound => "The requested instance does not exist",
            Self::InsufficientPermissions => {
                "You do not have enough permissions to perform this operation"
            }
            Self::UserAlreadyExists => "A user with this login id already exists",
            Self::SuspendedUser => "The account is suspended, contact the administrator",
            Self::BadGeneratedToken => "The session token could not be generated",
            Self::InvalidCaptcha => "The captcha is not valid",
        }
    }

    /// Catalog entry for this code.
    #[must_use]
    pub fn to_message(self) -> ErrorMessage {
        ErrorMessage {
            code: self.code(),
            message: self.message().to_string(),
            description: self.description().to_string(),
            diagnostic: None,
        }
    }

    /// Catalog entry with caller text. The override only applies when both
    /// parts are given; otherwise the catalog text is kept.
    #[must_use]
    pub fn with_custom(self, message: Option<&str>, description: Option<&str>) -> ErrorMessage {
        match (message, description) {
            (Some(message), Some(description)) => ErrorMessage {
                code: self.code(),
                message: message.to_string(),
                description: description.to_string(),
                diagnostic: None,
            },
            _ => self.to_message(),
        }
    }

    /// Catalog entry carrying internal detail that is never serialized.
    #[must_use]
    pub fn with_diagnostic(self, diagnostic: impl fmt::Display) -> ErrorMessage {
        let mut message = self.to_message();
        message.diagnostic = Some(diagnostic.to_string());
        message
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorMessage {
    pub code: u8,
    pub message: String,
    pub description: String,
    #[serde(skip)]
    pub diagnostic: Option<String>,
}

impl ErrorMessage {
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }

    #[must_use]
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code()
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.is(ErrorCode::NoError)
    }
}

impl Default for ErrorMessage {
    fn default() -> Self {
        ErrorCode::NoError.to_message()
    }
}

impl From<ErrorCode> for ErrorMessage {
    fn from(code: ErrorCode) -> Self {
        code.to_message()
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
