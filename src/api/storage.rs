//! Relational user storage.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE users (
//!     id             BIGSERIAL PRIMARY KEY,
//!     username       TEXT NOT NULL UNIQUE,
//!     email          TEXT NOT NULL DEFAULT '',
//!     password_hash  TEXT NOT NULL DEFAULT '',
//!     provider       TEXT NOT NULL DEFAULT 'local',
//!     provider_id    TEXT,
//!     avatar_url     TEXT NOT NULL DEFAULT '',
//!     points         BIGINT NOT NULL DEFAULT 0,
//!     signin_streak  INT NOT NULL DEFAULT 0,
//!     last_signin_on DATE,
//!     created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     UNIQUE (provider, provider_id)
//! );
//! CREATE TABLE user_signins (
//!     id        BIGSERIAL PRIMARY KEY,
//!     user_id   BIGINT NOT NULL REFERENCES users (id),
//!     signed_on DATE NOT NULL,
//!     points    BIGINT NOT NULL,
//!     streak    INT NOT NULL
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};
use thiserror::Error;
use tracing::{info_span, Instrument, Span};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("username already taken")]
    Conflict,
    #[error("user id out of range")]
    IdOutOfRange,
}

#[derive(Debug, Error)]
pub enum SignInError {
    #[error("already signed in today")]
    AlreadySignedIn,
    #[error("user not found")]
    UserNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for SignInError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: u64,
    pub username: String,
    pub password_hash: String,
}

/// Identity asserted by an external login provider.
#[derive(Debug, Clone)]
pub struct ExternalAccount {
    pub provider: &'static str,
    pub provider_id: String,
    /// Preferred username; sanitized and made unique on first login.
    pub username_hint: String,
    pub avatar_url: String,
}

/// The user an external login resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLogin {
    pub user_id: u64,
    pub username: String,
    pub created: bool,
}

/// Everything the owner of an account may see about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: u64,
    pub username: String,
    pub email: String,
    pub provider: String,
    pub avatar_url: String,
    pub points: i64,
    pub signin_streak: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub id: u64,
    pub username: String,
    pub points: i64,
    pub signin_streak: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignInOutcome {
    pub points_awarded: i64,
    pub total_points: i64,
    pub streak: i32,
    pub signed_in_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignInStatus {
    pub points: i64,
    pub streak: i32,
    pub last_signin_on: Option<NaiveDate>,
    pub signed_in_today: bool,
}

/// Streak after signing in on `today`.
///
/// # Errors
/// Returns `AlreadySignedIn` when the last sign-in was today (or a later date).
pub fn next_streak(
    last: Option<NaiveDate>,
    previous: i32,
    today: NaiveDate,
) -> Result<i32, SignInError> {
    match last {
        Some(day) if day >= today => Err(SignInError::AlreadySignedIn),
        Some(day) if today.pred_opt() == Some(day) => Ok(previous.saturating_add(1)),
        _ => Ok(1),
    }
}

/// Usernames tried for a new external account before giving up with `Conflict`.
pub const MAX_NAME_ATTEMPTS: u32 = 20;

/// Lowercase ASCII letters and digits; `_`, `-` and `.` become `_`; everything else is
/// dropped.
#[must_use]
pub fn sanitize_username(input: &str) -> String {
    let mapped: String = input
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' => Some(c),
            '_' | '-' | '.' => Some('_'),
            _ => None,
        })
        .collect();
    mapped.trim_matches('_').to_string()
}

/// The `attempt`-th username to try for `account`: the sanitized hint, then `{provider}_{id}`,
/// then `user_{id}`, suffixed with `_{attempt}` after the first try.
#[must_use]
pub fn username_candidate(account: &ExternalAccount, attempt: u32) -> String {
    let mut base = sanitize_username(&account.username_hint);
    if base.is_empty() {
        base = sanitize_username(&format!("{}_{}", account.provider, account.provider_id));
    }
    if base.is_empty() {
        base = format!("user_{}", account.provider_id);
    }
    if attempt == 0 {
        base
    } else {
        format!("{base}_{attempt}")
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn username_exists(&self, username: &str) -> Result<bool, StoreError>;

    /// Insert a user and return its id. A duplicate username is `Conflict`.
    async fn create_user(&self, user: &NewUser) -> Result<u64, StoreError>;

    async fn find_credentials(&self, username: &str) -> Result<Option<Credentials>, StoreError>;

    /// Find the user linked to `account`, refreshing its avatar, or create one under the
    /// first free [`username_candidate`].
    async fn find_or_create_external(
        &self,
        account: &ExternalAccount,
    ) -> Result<ExternalLogin, StoreError>;

    async fn account(&self, user_id: u64) -> Result<Option<Account>, StoreError>;

    async fn profile_by_id(&self, user_id: u64) -> Result<Option<PublicProfile>, StoreError>;

    async fn profile_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PublicProfile>, StoreError>;

    /// Record today's sign-in, award `reward` points and advance the streak atomically.
    async fn sign_in(
        &self,
        user_id: u64,
        reward: i64,
        today: NaiveDate,
    ) -> Result<SignInOutcome, SignInError>;

    async fn signin_status(
        &self,
        user_id: u64,
        today: NaiveDate,
    ) -> Result<Option<SignInStatus>, StoreError>;
}

fn to_db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::IdOutOfRange)
}

fn from_db_id(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::IdOutOfRange)
}

fn query_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn profile_from_row(row: &PgRow) -> Result<PublicProfile, StoreError> {
    Ok(PublicProfile {
        id: from_db_id(row.try_get("id")?)?,
        username: row.try_get("username")?,
        points: row.try_get("points")?,
        signin_streak: row.try_get("signin_streak")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn linked_user(
        &self,
        account: &ExternalAccount,
    ) -> Result<Option<ExternalLogin>, StoreError> {
        let update = "UPDATE users SET avatar_url = $3 WHERE provider = $1 AND provider_id = $2 \
                      RETURNING id, username";
        let row = sqlx::query(update)
            .bind(account.provider)
            .bind(&account.provider_id)
            .bind(&account.avatar_url)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", update))
            .await?;
        row.map(|row| -> Result<ExternalLogin, StoreError> {
            Ok(ExternalLogin {
                user_id: from_db_id(row.try_get("id")?)?,
                username: row.try_get("username")?,
                created: false,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        let query = "SELECT EXISTS(SELECT 1 FROM users WHERE username = $1) AS taken";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.try_get("taken")?)
    }

    async fn create_user(&self, user: &NewUser) -> Result<u64, StoreError> {
        let query =
            "INSERT INTO users (username, email, password_hash) VALUES ($1, $2, $3) RETURNING id";
        let result = sqlx::query(query)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;
        match result {
            Ok(row) => from_db_id(row.try_get("id")?),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_credentials(&self, username: &str) -> Result<Option<Credentials>, StoreError> {
        let query = "SELECT id, username, password_hash FROM users WHERE username = $1";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Credentials {
            user_id: from_db_id(row.try_get("id")?)?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
        }))
    }

    async fn find_or_create_external(
        &self,
        account: &ExternalAccount,
    ) -> Result<ExternalLogin, StoreError> {
        if let Some(found) = self.linked_user(account).await? {
            return Ok(found);
        }

        let insert = "INSERT INTO users (username, provider, provider_id, avatar_url) \
                      VALUES ($1, $2, $3, $4) RETURNING id";
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let username = username_candidate(account, attempt);
            let result = sqlx::query(insert)
                .bind(&username)
                .bind(account.provider)
                .bind(&account.provider_id)
                .bind(&account.avatar_url)
                .fetch_one(&self.pool)
                .instrument(query_span("INSERT", insert))
                .await;
            match result {
                Ok(row) => {
                    return Ok(ExternalLogin {
                        user_id: from_db_id(row.try_get("id")?)?,
                        username,
                        created: true,
                    });
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    // A concurrent first login for the same account wins the race.
                    if let Some(found) = self.linked_user(account).await? {
                        return Ok(found);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict)
    }

    async fn account(&self, user_id: u64) -> Result<Option<Account>, StoreError> {
        let query = "SELECT id, username, email, provider, avatar_url, points, signin_streak, \
                     created_at FROM users WHERE id = $1";
        let row = sqlx::query(query)
            .bind(to_db_id(user_id)?)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Account {
            id: from_db_id(row.try_get("id")?)?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            provider: row.try_get("provider")?,
            avatar_url: row.try_get("avatar_url")?,
            points: row.try_get("points")?,
            signin_streak: row.try_get("signin_streak")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn profile_by_id(&self, user_id: u64) -> Result<Option<PublicProfile>, StoreError> {
        let query =
            "SELECT id, username, points, signin_streak, created_at FROM users WHERE id = $1";
        let row = sqlx::query(query)
            .bind(to_db_id(user_id)?)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn profile_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PublicProfile>, StoreError> {
        let query =
            "SELECT id, username, points, signin_streak, created_at FROM users WHERE username = $1";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn sign_in(
        &self,
        user_id: u64,
        reward: i64,
        today: NaiveDate,
    ) -> Result<SignInOutcome, SignInError> {
        let id = to_db_id(user_id)?;
        let mut tx = self.pool.begin().await?;

        let select =
            "SELECT points, signin_streak, last_signin_on FROM users WHERE id = $1 FOR UPDATE";
        let row = sqlx::query(select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .instrument(query_span("SELECT", select))
            .await?;
        let Some(row) = row else {
            return Err(SignInError::UserNotFound);
        };
        let points: i64 = row.try_get("points")?;
        let previous: i32 = row.try_get("signin_streak")?;
        let last: Option<NaiveDate> = row.try_get("last_signin_on")?;

        // Dropping `tx` on this early return rolls back and releases the row lock.
        let streak = next_streak(last, previous, today)?;

        let update = "UPDATE users SET points = points + $2, signin_streak = $3, \
                      last_signin_on = $4 WHERE id = $1";
        sqlx::query(update)
            .bind(id)
            .bind(reward)
            .bind(streak)
            .bind(today)
            .execute(&mut *tx)
            .instrument(query_span("UPDATE", update))
            .await?;

        let insert =
            "INSERT INTO user_signins (user_id, signed_on, points, streak) VALUES ($1, $2, $3, $4)";
        sqlx::query(insert)
            .bind(id)
            .bind(today)
            .bind(reward)
            .bind(streak)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", insert))
            .await?;

        tx.commit().await?;

        Ok(SignInOutcome {
            points_awarded: reward,
            total_points: points.saturating_add(reward),
            streak,
            signed_in_on: today,
        })
    }

    async fn signin_status(
        &self,
        user_id: u64,
        today: NaiveDate,
    ) -> Result<Option<SignInStatus>, StoreError> {
        let id = to_db_id(user_id)?;
        let query = "SELECT points, signin_streak, last_signin_on FROM users WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let last: Option<NaiveDate> = row.try_get("last_signin_on")?;
        Ok(Some(SignInStatus {
            points: row.try_get("points")?,
            streak: row.try_get("signin_streak")?,
            last_signin_on: last,
            signed_in_today: last == Some(today),
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    struct Record {
        user: NewUser,
        provider: String,
        provider_id: Option<String>,
        avatar_url: String,
        points: i64,
        streak: i32,
        last_signin_on: Option<NaiveDate>,
        created_at: DateTime<Utc>,
    }

    /// In-process `UserStore` with the same semantics as the Postgres one.
    #[derive(Default)]
    pub struct MemoryUserStore {
        users: Mutex<HashMap<u64, Record>>,
    }

    impl MemoryUserStore {
        fn insert(users: &mut HashMap<u64, Record>, record: Record) -> u64 {
            let id = users.keys().max().copied().unwrap_or(0) + 1;
            users.insert(id, record);
            id
        }

        fn record(user: NewUser) -> Record {
            Record {
                user,
                provider: "local".to_string(),
                provider_id: None,
                avatar_url: String::new(),
                points: 0,
                streak: 0,
                last_signin_on: None,
                created_at: Utc::now(),
            }
        }

        fn profile(id: u64, record: &Record) -> PublicProfile {
            PublicProfile {
                id,
                username: record.user.username.clone(),
                points: record.points,
                signin_streak: record.streak,
                created_at: record.created_at,
            }
        }

        pub fn rename(&self, user_id: u64, username: &str) {
            if let Some(record) = self.users.lock().get_mut(&user_id) {
                record.user.username = username.to_string();
            }
        }
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
            Ok(self
                .users
                .lock()
                .values()
                .any(|r| r.user.username == username))
        }

        async fn create_user(&self, user: &NewUser) -> Result<u64, StoreError> {
            let mut users = self.users.lock();
            if users.values().any(|r| r.user.username == user.username) {
                return Err(StoreError::Conflict);
            }
            Ok(Self::insert(&mut users, Self::record(user.clone())))
        }

        async fn find_credentials(
            &self,
            username: &str,
        ) -> Result<Option<Credentials>, StoreError> {
            Ok(self
                .users
                .lock()
                .iter()
                .find(|(_, r)| r.user.username == username)
                .map(|(id, r)| Credentials {
                    user_id: *id,
                    username: r.user.username.clone(),
                    password_hash: r.user.password_hash.clone(),
                }))
        }

        async fn find_or_create_external(
            &self,
            account: &ExternalAccount,
        ) -> Result<ExternalLogin, StoreError> {
            let mut users = self.users.lock();
            let linked = users.iter_mut().find(|(_, r)| {
                r.provider == account.provider
                    && r.provider_id.as_deref() == Some(account.provider_id.as_str())
            });
            if let Some((id, record)) = linked {
                record.avatar_url.clone_from(&account.avatar_url);
                return Ok(ExternalLogin {
                    user_id: *id,
                    username: record.user.username.clone(),
                    created: false,
                });
            }

            let username = (0..MAX_NAME_ATTEMPTS)
                .map(|attempt| username_candidate(account, attempt))
                .find(|name| !users.values().any(|r| &r.user.username == name))
                .ok_or(StoreError::Conflict)?;
            let mut record = Self::record(NewUser {
                username: username.clone(),
                email: String::new(),
                password_hash: String::new(),
            });
            record.provider = account.provider.to_string();
            record.provider_id = Some(account.provider_id.clone());
            record.avatar_url.clone_from(&account.avatar_url);
            let user_id = Self::insert(&mut users, record);
            Ok(ExternalLogin {
                user_id,
                username,
                created: true,
            })
        }

        async fn account(&self, user_id: u64) -> Result<Option<Account>, StoreError> {
            Ok(self.users.lock().get(&user_id).map(|r| Account {
                id: user_id,
                username: r.user.username.clone(),
                email: r.user.email.clone(),
                provider: r.provider.clone(),
                avatar_url: r.avatar_url.clone(),
                points: r.points,
                signin_streak: r.streak,
                created_at: r.created_at,
            }))
        }

        async fn profile_by_id(&self, user_id: u64) -> Result<Option<PublicProfile>, StoreError> {
            Ok(self
                .users
                .lock()
                .get(&user_id)
                .map(|r| Self::profile(user_id, r)))
        }

        async fn profile_by_username(
            &self,
            username: &str,
        ) -> Result<Option<PublicProfile>, StoreError> {
            Ok(self
                .users
                .lock()
                .iter()
                .find(|(_, r)| r.user.username == username)
                .map(|(id, r)| Self::profile(*id, r)))
        }

        async fn sign_in(
            &self,
            user_id: u64,
            reward: i64,
            today: NaiveDate,
        ) -> Result<SignInOutcome, SignInError> {
            let mut users = self.users.lock();
            let record = users.get_mut(&user_id).ok_or(SignInError::UserNotFound)?;
            let streak = next_streak(record.last_signin_on, record.streak, today)?;
            record.points += reward;
            record.streak = streak;
            record.last_signin_on = Some(today);
            Ok(SignInOutcome {
                points_awarded: reward,
                total_points: record.points,
                streak,
                signed_in_on: today,
            })
        }

        async fn signin_status(
            &self,
            user_id: u64,
            today: NaiveDate,
        ) -> Result<Option<SignInStatus>, StoreError> {
            Ok(self.users.lock().get(&user_id).map(|r| SignInStatus {
                points: r.points,
                streak: r.streak,
                last_signin_on: r.last_signin_on,
                signed_in_today: r.last_signin_on == Some(today),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    #[test]
    fn first_sign_in_starts_a_streak() {
        assert_eq!(next_streak(None, 0, day(2024, 3, 1)).ok(), Some(1));
    }

    #[test]
    fn consecutive_days_extend_the_streak() {
        assert_eq!(
            next_streak(Some(day(2024, 2, 29)), 4, day(2024, 3, 1)).ok(),
            Some(5)
        );
    }

    #[test]
    fn a_gap_resets_the_streak() {
        assert_eq!(
            next_streak(Some(day(2024, 2, 27)), 4, day(2024, 3, 1)).ok(),
            Some(1)
        );
    }

    #[test]
    fn same_day_is_rejected() {
        assert!(matches!(
            next_streak(Some(day(2024, 3, 1)), 4, day(2024, 3, 1)),
            Err(SignInError::AlreadySignedIn)
        ));
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_usernames() -> Result<(), StoreError> {
        let store = testing::MemoryUserStore::default();
        let user = NewUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "x".to_string(),
        };
        let id = store.create_user(&user).await?;
        assert_eq!(id, 1);
        assert!(matches!(
            store.create_user(&user).await,
            Err(StoreError::Conflict)
        ));
        Ok(())
    }

    fn telegram(id: &str, hint: &str) -> ExternalAccount {
        ExternalAccount {
            provider: "telegram",
            provider_id: id.to_string(),
            username_hint: hint.to_string(),
            avatar_url: String::new(),
        }
    }

    #[test]
    fn usernames_are_sanitized() {
        assert_eq!(sanitize_username("  Bob.Smith-99 "), "bob_smith_99");
        assert_eq!(sanitize_username("__张三__"), "");
        assert_eq!(sanitize_username("_x_"), "x");
    }

    #[test]
    fn candidates_fall_back_and_get_suffixes() {
        assert_eq!(username_candidate(&telegram("42", "Bob"), 0), "bob");
        assert_eq!(username_candidate(&telegram("42", "Bob"), 2), "bob_2");
        assert_eq!(username_candidate(&telegram("42", "张三"), 0), "telegram_42");
        assert_eq!(username_candidate(&telegram("42", ""), 1), "telegram_42_1");
    }

    #[tokio::test]
    async fn external_accounts_are_linked_once() -> Result<(), StoreError> {
        let store = testing::MemoryUserStore::default();
        store
            .create_user(&NewUser {
                username: "bob".to_string(),
                email: "bob@example.com".to_string(),
                password_hash: "x".to_string(),
            })
            .await?;

        let first = store.find_or_create_external(&telegram("42", "Bob")).await?;
        assert!(first.created);
        assert_eq!(first.username, "bob_1");

        let mut again = telegram("42", "Someone Else");
        again.avatar_url = "https://t.me/p.jpg".to_string();
        let second = store.find_or_create_external(&again).await?;
        assert!(!second.created);
        assert_eq!(second.user_id, first.user_id);

        let account = store.account(first.user_id).await?;
        assert_eq!(
            account.map(|a| (a.provider, a.avatar_url)),
            Some(("telegram".to_string(), "https://t.me/p.jpg".to_string()))
        );
        Ok(())
    }
}
