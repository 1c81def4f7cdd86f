//! In-process store for tests and embedded use.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{
    AttemptStore, ChallengeStore, FailedLoginAttempt, LoginChallenge, NewTokenRecord,
    TokenRecord, TokenStore, UserStore,
};
use crate::session::user::{NewUser, User};

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<i64, User>,
    tokens: HashMap<String, TokenRecord>,
    attempts: Vec<FailedLoginAttempt>,
    challenges: Vec<LoginChallenge>,
}

impl Inner {
    fn next_user_id(&self) -> i64 {
        self.users.keys().next_back().map_or(1, |id| id + 1)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user, keeping its id.
    pub async fn put_user(&self, user: User) {
        self.inner.lock().await.users.insert(user.id, user);
    }

    pub async fn attempts(&self) -> Vec<FailedLoginAttempt> {
        self.inner.lock().await.attempts.clone()
    }

    pub async fn challenges(&self) -> Vec<LoginChallenge> {
        self.inner.lock().await.challenges.clone()
    }

    pub async fn token_record(&self, token: &str) -> Option<TokenRecord> {
        self.inner.lock().await.tokens.get(token).cloned()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn find_user_by_login_id(&self, login_id: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| user.login_id == login_id)
            .cloned())
    }

    async fn find_user_by_social(&self, social_id: &str, origin: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| {
                user.social_id.as_deref() == Some(social_id)
                    && user.social_origin.as_deref() == Some(origin)
            })
            .cloned())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let mut inner = self.inner.lock().await;
        if inner.users.values().any(|u| u.login_id == user.login_id) {
            return Err(anyhow!("user {} already exists", user.login_id));
        }
        let created = User {
            id: inner.next_user_id(),
            login_id: user.login_id,
            password_hash: user.password_hash,
            role: user.role.unwrap_or_default(),
            active: user.active,
            name: user.name,
            avatar: user.avatar,
            social_id: user.social_id,
            social_origin: user.social_origin,
            attributes: serde_json::Map::new(),
        };
        inner.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn link_social(&self, user_id: i64, social_id: &str, origin: &str) -> Result<User> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("user {user_id} not found"))?;
        user.social_id = Some(social_id.to_string());
        user.social_origin = Some(origin.to_string());
        user.active = true;
        Ok(user.clone())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, record: NewTokenRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tokens.insert(
            record.token.clone(),
            TokenRecord {
                token: record.token,
                session_key: record.session_key,
                user_id: record.user_id,
                active: true,
                request_metadata: record.request_metadata,
                created_at: record.created_at,
                inactive_at: None,
            },
        );
        Ok(())
    }

    async fn token_is_active(
        &self,
        token: &str,
        session_key: Option<&str>,
        user_id: i64,
    ) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.tokens.get(token).is_some_and(|record| {
            record.active
                && record.user_id == user_id
                && record.session_key.as_deref() == session_key
        }))
    }

    async fn deactivate_token(
        &self,
        token: &str,
        session_key: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.tokens.get_mut(token) {
            Some(record) if record.active && record.session_key.as_deref() == session_key => {
                record.active = false;
                record.inactive_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn insert_attempt(&self, attempt: FailedLoginAttempt) -> Result<()> {
        self.inner.lock().await.attempts.push(attempt);
        Ok(())
    }

    async fn count_attempts(
        &self,
        session_key: Option<&str>,
        user_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let inner = self.inner.lock().await;
        let count = inner
            .attempts
            .iter()
            .filter(|attempt| {
                attempt.session_key.as_deref() == session_key
                    && attempt.created_at >= since
                    && user_id.map_or(true, |id| attempt.user_id == Some(id))
            })
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn expire_challenges(
        &self,
        session_key: Option<&str>,
        created_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut expired = 0;
        for challenge in inner.challenges.iter_mut().filter(|challenge| {
            challenge.active
                && challenge.session_key.as_deref() == session_key
                && challenge.created_at <= created_before
        }) {
            challenge.active = false;
            expired += 1;
        }
        Ok(expired)
    }

    async fn insert_challenge_within_cap(
        &self,
        challenge: LoginChallenge,
        since: DateTime<Utc>,
        cap: u32,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let issued = inner
            .challenges
            .iter()
            .filter(|existing| {
                existing.session_key == challenge.session_key
                    && existing.created_at >= since
                    && challenge
                        .user_id
                        .map_or(true, |id| existing.user_id == Some(id))
            })
            .count();
        if issued >= cap as usize {
            return Ok(false);
        }
        inner.challenges.push(challenge);
        Ok(true)
    }

    async fn challenge_matches(
        &self,
        session_key: Option<&str>,
        user_id: Option<i64>,
        challenge_id: &str,
        value: &str,
    ) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.challenges.iter().any(|challenge| {
            challenge.active
                && challenge.challenge_id == challenge_id
                && challenge.value == value
                && challenge.session_key.as_deref() == session_key
                && challenge.user_id == user_id
        }))
    }

    async fn mark_challenge_rendered(
        &self,
        session_key: Option<&str>,
        challenge_id: &str,
    ) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        let challenge = inner.challenges.iter_mut().find(|challenge| {
            challenge.challenge_id == challenge_id
                && challenge.session_key.as_deref() == session_key
        });
        match challenge {
            Some(challenge) if challenge.active && !challenge.image_rendered => {
                challenge.image_rendered = true;
                Ok(Some(challenge.value.clone()))
            }
            _ => Ok(None),
        }
    }
}
