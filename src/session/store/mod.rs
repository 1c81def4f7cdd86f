//! Storage seams for the session core.
//!
//! The core owns tokens, failed attempts and login challenges; users belong to
//! the host application and are only read, provisioned or linked. Partition
//! arguments (`session_key`) match by equality, so `None` only matches rows
//! stored without a partition.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::session::user::{NewUser, User};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Clone, Debug, PartialEq)]
pub struct NewTokenRecord {
    pub token: String,
    pub session_key: Option<String>,
    pub user_id: i64,
    pub request_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenRecord {
    pub token: String,
    pub session_key: Option<String>,
    pub user_id: i64,
    pub active: bool,
    pub request_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub inactive_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FailedLoginAttempt {
    pub login_id: String,
    /// Only kept when secret retention is switched on.
    pub secret: Option<String>,
    pub session_key: Option<String>,
    pub user_id: Option<i64>,
    pub request_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginChallenge {
    pub challenge_id: String,
    pub value: String,
    pub active: bool,
    pub image_rendered: bool,
    pub session_key: Option<String>,
    pub user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>>;

    async fn find_user_by_login_id(&self, login_id: &str) -> Result<Option<User>>;

    async fn find_user_by_social(&self, social_id: &str, origin: &str) -> Result<Option<User>>;

    async fn insert_user(&self, user: NewUser) -> Result<User>;

    /// Attach a social identity to an existing user and mark it active.
    async fn link_social(&self, user_id: i64, social_id: &str, origin: &str) -> Result<User>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, record: NewTokenRecord) -> Result<()>;

    async fn token_is_active(
        &self,
        token: &str,
        session_key: Option<&str>,
        user_id: i64,
    ) -> Result<bool>;

    /// Returns `false` when no active record matched.
    async fn deactivate_token(
        &self,
        token: &str,
        session_key: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn insert_attempt(&self, attempt: FailedLoginAttempt) -> Result<()>;

    /// Attempts since `since`; `user_id = None` counts the whole partition.
    async fn count_attempts(
        &self,
        session_key: Option<&str>,
        user_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Deactivate challenges created at or before `created_before`.
    async fn expire_challenges(
        &self,
        session_key: Option<&str>,
        created_before: DateTime<Utc>,
    ) -> Result<u64>;

    /// Count challenges created since `since` for the challenge owner (or the
    /// whole partition when it has none) and insert only below `cap`, as one
    /// atomic step.
    async fn insert_challenge_within_cap(
        &self,
        challenge: LoginChallenge,
        since: DateTime<Utc>,
        cap: u32,
    ) -> Result<bool>;

    /// `user_id = None` matches only challenges without an owner.
    async fn challenge_matches(
        &self,
        session_key: Option<&str>,
        user_id: Option<i64>,
        challenge_id: &str,
        value: &str,
    ) -> Result<bool>;

    /// Flip `image_rendered` on an active, unrendered challenge and return its
    /// value. `None` when there is nothing to render.
    async fn mark_challenge_rendered(
        &self,
        session_key: Option<&str>,
        challenge_id: &str,
    ) -> Result<Option<String>>;
}

/// Everything the session manager needs from storage.
pub trait SessionStore: UserStore + TokenStore + AttemptStore + ChallengeStore {}

impl<T> SessionStore for T where T: UserStore + TokenStore + AttemptStore + ChallengeStore {}
