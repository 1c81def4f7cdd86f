//! Session and authentication core.
//!
//! Leaf modules first: [`error`] and [`groups`] have no dependencies,
//! [`token`], [`attempts`] and [`captcha`] sit on the [`store`] traits, and
//! [`providers`] authenticates credentials. [`manager::SessionManager`]
//! composes everything into the public operations.

pub mod attempts;
pub mod captcha;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod groups;
pub mod manager;
pub mod providers;
pub mod rules;
pub mod store;
pub mod token;
pub mod user;

pub use self::config::{Configurable, SessionConfig, UserFields};
pub use self::context::{AuthInfo, RequestContext, RequestMetadata};
pub use self::error::{ErrorCode, ErrorMessage};
pub use self::manager::{AccessOutcome, LoginRequest, SessionManager, SessionOutcome};
pub use self::user::User;
