//! PostgreSQL store.
//!
//! Flow Overview:
//! - Users are read from the host table named by [`UserFields`]; column names
//!   are validated identifiers and aliased to fixed names in every query.
//! - Tokens, attempts and challenges live in `tessera_*` tables (see
//!   `sql/schema.sql`).
//! - Challenge issuance takes a transaction-scoped advisory lock per partition
//!   so the hourly cap holds under concurrent requests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Postgres, QueryBuilder, Row,
};
use std::time::Duration;
use tracing::{warn, Instrument};

use super::{
    AttemptStore, ChallengeStore, FailedLoginAttempt, LoginChallenge, NewTokenRecord, TokenStore,
    UserStore,
};
use crate::session::{
    config::{ConfigError, UserFields},
    user::{NewUser, User},
};

pub const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
    fields: UserFields,
}

impl PgStore {
    /// # Errors
    /// Returns an error if the user field bindings are not plain identifiers.
    pub fn new(pool: PgPool, fields: UserFields) -> Result<Self, ConfigError> {
        fields.validate()?;
        Ok(Self { pool, fields })
    }

    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str) -> Result<PgPool> {
        PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")
    }

    /// Create the tables from `sql/schema.sql` when they are missing.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::Executor::execute(&self.pool, SCHEMA_SQL)
            .await
            .context("failed to execute schema SQL")?;
        Ok(())
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn user_columns(&self) -> String {
        let f = &self.fields;
        let optional = |column: &Option<String>, cast: &str, fallback: &str| {
            column
                .as_ref()
                .map_or_else(|| fallback.to_string(), |c| format!("{c}::{cast}"))
        };
        format!(
            "{}::BIGINT AS id, {}::TEXT AS login_id, {}::TEXT AS password_hash, {}::TEXT AS role, \
             {} AS active, {}::TEXT AS name, {} AS avatar, {} AS social_id, {} AS social_origin",
            f.id,
            f.login_id,
            f.password,
            f.role,
            optional(&f.active, "BOOLEAN", "TRUE"),
            f.name,
            optional(&f.avatar, "TEXT", "NULL::TEXT"),
            optional(&f.social_id, "TEXT", "NULL::TEXT"),
            optional(&f.social_origin, "TEXT", "NULL::TEXT"),
        )
    }

    async fn fetch_user(&self, query: &str, binds: &[&str]) -> Result<Option<User>> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let mut statement = sqlx::query(query);
        for bind in binds {
            statement = statement.bind(*bind);
        }
        let row = statement
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;
        row.as_ref().map(user_from_row).transpose()
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        login_id: row.try_get("login_id")?,
        password_hash: row.try_get("password_hash")?,
        role: row.try_get::<Option<String>, _>("role")?.unwrap_or_default(),
        active: row.try_get::<Option<bool>, _>("active")?.unwrap_or(false),
        name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
        avatar: row.try_get("avatar")?,
        social_id: row.try_get("social_id")?,
        social_origin: row.try_get("social_origin")?,
        attributes: serde_json::Map::new(),
    })
}

enum Bind {
    Text(Option<String>),
    Bool(bool),
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user_by_id(&self, id: i64) -> Result<Option<User>> {
        let query = format!(
            "SELECT {} FROM {} WHERE {} = $1",
            self.user_columns(),
            self.fields.table,
            self.fields.id
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by id")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_login_id(&self, login_id: &str) -> Result<Option<User>> {
        let query = format!(
            "SELECT {} FROM {} WHERE {} = $1 ORDER BY {} LIMIT 1",
            self.user_columns(),
            self.fields.table,
            self.fields.login_id,
            self.fields.id
        );
        self.fetch_user(&query, &[login_id]).await
    }

    async fn find_user_by_social(&self, social_id: &str, origin: &str) -> Result<Option<User>> {
        let (Some(id_column), Some(origin_column)) =
            (&self.fields.social_id, &self.fields.social_origin)
        else {
            return Ok(None);
        };
        let query = format!(
            "SELECT {} FROM {} WHERE {id_column} = $1 AND {origin_column} = $2 ORDER BY {} LIMIT 1",
            self.user_columns(),
            self.fields.table,
            self.fields.id
        );
        self.fetch_user(&query, &[social_id, origin]).await
    }

    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let f = &self.fields;
        let mut values: Vec<(&str, Bind)> = vec![
            (f.login_id.as_str(), Bind::Text(Some(user.login_id))),
            (f.name.as_str(), Bind::Text(Some(user.name))),
        ];
        if let Some(hash) = user.password_hash {
            values.push((f.password.as_str(), Bind::Text(Some(hash))));
        }
        if let Some(role) = user.role {
            values.push((f.role.as_str(), Bind::Text(Some(role))));
        }
        if let Some(column) = &f.active {
            values.push((column.as_str(), Bind::Bool(user.active)));
        }
        let optional = [
            (&f.avatar, user.avatar),
            (&f.social_id, user.social_id),
            (&f.social_origin, user.social_origin),
        ];
        for (column, value) in optional {
            if let (Some(column), Some(value)) = (column, value) {
                values.push((column.as_str(), Bind::Text(Some(value))));
            }
        }

        let columns: Vec<&str> = values.iter().map(|(column, _)| *column).collect();
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) VALUES (", f.table, columns.join(", ")));
        let mut separated = builder.separated(", ");
        for (_, value) in values {
            match value {
                Bind::Text(text) => separated.push_bind(text),
                Bind::Bool(flag) => separated.push_bind(flag),
            };
        }
        builder.push(format!(") RETURNING {}", self.user_columns()));

        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = builder.sql()
        );
        let row = builder
            .build()
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert user")?;
        user_from_row(&row)
    }

    async fn link_social(&self, user_id: i64, social_id: &str, origin: &str) -> Result<User> {
        let f = &self.fields;
        let (Some(id_column), Some(origin_column)) = (&f.social_id, &f.social_origin) else {
            anyhow::bail!("social user fields are not configured");
        };
        let activate = f
            .active
            .as_ref()
            .map(|column| format!(", {column} = TRUE"))
            .unwrap_or_default();
        let query = format!(
            "UPDATE {} SET {id_column} = $1, {origin_column} = $2{activate} WHERE {} = $3 RETURNING {}",
            f.table,
            f.id,
            self.user_columns()
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(social_id)
            .bind(origin)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to link social account")?;
        user_from_row(&row)
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, record: NewTokenRecord) -> Result<()> {
        let query = r"
            INSERT INTO tessera_tokens
                (token, session_key, user_id, request_metadata, created_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&record.token)
            .bind(&record.session_key)
            .bind(record.user_id)
            .bind(&record.request_metadata)
            .bind(record.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to persist token")?;
        Ok(())
    }

    async fn token_is_active(
        &self,
        token: &str,
        session_key: Option<&str>,
        user_id: i64,
    ) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM tessera_tokens
                WHERE token = $1
                  AND session_key IS NOT DISTINCT FROM $2
                  AND user_id = $3
                  AND active
            )
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_scalar::<_, bool>(query)
            .bind(token)
            .bind(session_key)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup token")
    }

    async fn deactivate_token(
        &self,
        token: &str,
        session_key: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE tessera_tokens
            SET active = FALSE, inactive_at = $3
            WHERE token = $1
              AND session_key IS NOT DISTINCT FROM $2
              AND active
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(token)
            .bind(session_key)
            .bind(at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to deactivate token")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn insert_attempt(&self, attempt: FailedLoginAttempt) -> Result<()> {
        let query = r"
            INSERT INTO tessera_failed_login_attempts
                (login_id, secret, session_key, user_id, request_metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&attempt.login_id)
            .bind(&attempt.secret)
            .bind(&attempt.session_key)
            .bind(attempt.user_id)
            .bind(&attempt.request_metadata)
            .bind(attempt.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to record login attempt")?;
        Ok(())
    }

    async fn count_attempts(
        &self,
        session_key: Option<&str>,
        user_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            SELECT COUNT(*) FROM tessera_failed_login_attempts
            WHERE session_key IS NOT DISTINCT FROM $1
              AND created_at >= $2
              AND ($3::BIGINT IS NULL OR user_id = $3)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let count = sqlx::query_scalar::<_, i64>(query)
            .bind(session_key)
            .bind(since)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to count login attempts")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl ChallengeStore for PgStore {
    async fn expire_challenges(
        &self,
        session_key: Option<&str>,
        created_before: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            UPDATE tessera_login_challenges
            SET active = FALSE
            WHERE active
              AND session_key IS NOT DISTINCT FROM $1
              AND created_at <= $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_key)
            .bind(created_before)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to expire challenges")?;
        Ok(result.rows_affected())
    }

    async fn insert_challenge_within_cap(
        &self,
        challenge: LoginChallenge,
        since: DateTime<Utc>,
        cap: u32,
    ) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin challenge transaction")?;

        let lock_key = format!(
            "tessera:challenge:{}",
            challenge.session_key.as_deref().unwrap_or_default()
        );
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&lock_key)
            .execute(&mut *tx)
            .await
            .context("failed to lock challenge partition")?;

        let query = r"
            SELECT COUNT(*) FROM tessera_login_challenges
            WHERE session_key IS NOT DISTINCT FROM $1
              AND created_at >= $2
              AND ($3::BIGINT IS NULL OR user_id = $3)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let issued = sqlx::query_scalar::<_, i64>(query)
            .bind(&challenge.session_key)
            .bind(since)
            .bind(challenge.user_id)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to count challenges")?;

        if issued >= i64::from(cap) {
            if let Err(err) = tx.rollback().await {
                warn!("failed to roll back capped challenge transaction: {err}");
            }
            return Ok(false);
        }

        let query = r"
            INSERT INTO tessera_login_challenges
                (challenge_id, value, active, image_rendered, session_key, user_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&challenge.challenge_id)
            .bind(&challenge.value)
            .bind(challenge.active)
            .bind(challenge.image_rendered)
            .bind(&challenge.session_key)
            .bind(challenge.user_id)
            .bind(challenge.created_at)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert challenge")?;

        tx.commit().await.context("commit challenge transaction")?;
        Ok(true)
    }

    async fn challenge_matches(
        &self,
        session_key: Option<&str>,
        user_id: Option<i64>,
        challenge_id: &str,
        value: &str,
    ) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM tessera_login_challenges
                WHERE active
                  AND challenge_id = $1
                  AND value = $2
                  AND session_key IS NOT DISTINCT FROM $3
                  AND user_id IS NOT DISTINCT FROM $4
            )
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_scalar::<_, bool>(query)
            .bind(challenge_id)
            .bind(value)
            .bind(session_key)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup challenge")
    }

    async fn mark_challenge_rendered(
        &self,
        session_key: Option<&str>,
        challenge_id: &str,
    ) -> Result<Option<String>> {
        let query = r"
            UPDATE tessera_login_challenges
            SET image_rendered = TRUE
            WHERE challenge_id = $1
              AND session_key IS NOT DISTINCT FROM $2
              AND active
              AND NOT image_rendered
            RETURNING value
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query_scalar::<_, String>(query)
            .bind(challenge_id)
            .bind(session_key)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to mark challenge rendered")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store(fields: UserFields) -> PgStore {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://tessera@localhost:5432/tessera")
            .unwrap();
        PgStore::new(pool, fields).unwrap()
    }

    #[tokio::test]
    async fn user_columns_alias_every_binding() {
        let columns = store(UserFields::default()).user_columns();
        assert!(columns.starts_with("id::BIGINT AS id, email::TEXT AS login_id"));
        assert!(columns.contains("is_active::BOOLEAN AS active"));
        assert!(columns.contains("photo::TEXT AS avatar"));
    }

    #[tokio::test]
    async fn user_columns_fill_unbound_fields() {
        let fields = UserFields {
            active: None,
            avatar: None,
            social_id: None,
            social_origin: None,
            ..UserFields::default()
        };
        let columns = store(fields).user_columns();
        assert!(columns.contains("TRUE AS active"));
        assert!(columns.contains("NULL::TEXT AS avatar"));
        assert!(columns.contains("NULL::TEXT AS social_origin"));
    }

    #[tokio::test]
    async fn new_rejects_unsafe_bindings() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://tessera@localhost:5432/tessera")
            .unwrap();
        let fields = UserFields {
            table: "users; --".to_string(),
            ..UserFields::default()
        };
        assert!(PgStore::new(pool, fields).is_err());
    }
}
