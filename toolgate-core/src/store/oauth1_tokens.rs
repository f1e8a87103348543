//! OAuth1 temp token repository.
//!
//! A row bridges the two halves of an OAuth 1.0a flow: the provider echoes
//! `oauth_token` back on the callback, and the row maps it to the signed
//! state JWT created at flow start. Rows expire after 10 minutes and are
//! swept by the background loop.

use super::{CatalogStore, fmt_ts, parse_ts};
use crate::error::StoreError;
use crate::types::OAuth1TempToken;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Row;

/// How long a pending OAuth1 flow stays resumable.
const TEMP_TOKEN_TTL_MINUTES: i64 = 10;

fn token_from_row(row: &Row<'_>) -> Result<OAuth1TempToken, StoreError> {
    let expires_at: String = row.get("expires_at")?;
    let created_at: String = row.get("created_at")?;
    Ok(OAuth1TempToken {
        oauth_token: row.get("oauth_token")?,
        state_jwt: row.get("state_jwt")?,
        expires_at: parse_ts("oauth1_temp_tokens.expires_at", &expires_at)?,
        created_at: parse_ts("oauth1_temp_tokens.created_at", &created_at)?,
    })
}

impl CatalogStore {
    pub fn create_oauth1_temp_token(
        &self,
        oauth_token: &str,
        state_jwt: &str,
    ) -> Result<OAuth1TempToken, StoreError> {
        let now = Utc::now();
        let token = OAuth1TempToken {
            oauth_token: oauth_token.into(),
            state_jwt: state_jwt.into(),
            expires_at: now + Duration::minutes(TEMP_TOKEN_TTL_MINUTES),
            created_at: now,
        };
        self.conn().execute(
            "INSERT OR REPLACE INTO oauth1_temp_tokens \
             (oauth_token, state_jwt, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                token.oauth_token,
                token.state_jwt,
                fmt_ts(token.expires_at),
                fmt_ts(token.created_at),
            ],
        )?;
        Ok(token)
    }

    /// Fetch a temp token if it exists and has not expired.
    pub fn get_oauth1_temp_token(
        &self,
        oauth_token: &str,
    ) -> Result<Option<OAuth1TempToken>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT oauth_token, state_jwt, expires_at, created_at FROM oauth1_temp_tokens \
             WHERE oauth_token = ?1 AND expires_at > ?2",
        )?;
        let mut rows = stmt.query_and_then(
            rusqlite::params![oauth_token, fmt_ts(Utc::now())],
            token_from_row,
        )?;
        rows.next().transpose()
    }

    pub fn delete_oauth1_temp_token(&self, oauth_token: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM oauth1_temp_tokens WHERE oauth_token = ?1",
            [oauth_token],
        )?;
        Ok(())
    }

    /// Sweep expired rows. Returns the number removed.
    pub fn cleanup_expired_oauth1_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let deleted = self.conn().execute(
            "DELETE FROM oauth1_temp_tokens WHERE expires_at <= ?1",
            [fmt_ts(now)],
        )?;
        Ok(deleted)
    }
}
