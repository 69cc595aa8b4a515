use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tessera_types::acquisition::{AcquisitionRecord, Meta, TokenizedGroup};

use crate::error::{Error, ErrorType};

/// Canonical serialization of a `tokenized` array.
///
/// Token maps are ordered and timestamps are integers, so equal values
/// always render to the same string. The stored column holds exactly this
/// rendering and the optimistic preconditions compare against it.
pub fn canonical_tokenized(groups: &[TokenizedGroup]) -> Result<String, Error> {
    serde_json::to_string(groups).map_err(|err| ErrorType::InternalError(err.into()).into())
}

#[derive(Debug, sqlx::FromRow)]
struct AcquisitionRaw {
    acquirer_id: String,
    tokenized: String,
    ttl: i64,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A record as read from storage, together with the exact `tokenized`
/// string it was read with (the optimistic-write precondition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAcquisition {
    pub record: AcquisitionRecord,
    pub tokenized_json: String,
}

impl TryFrom<AcquisitionRaw> for StoredAcquisition {
    type Error = Error;

    fn try_from(raw: AcquisitionRaw) -> Result<StoredAcquisition, Error> {
        let tokenized: Vec<TokenizedGroup> = serde_json::from_str(&raw.tokenized).map_err(|_| {
            ErrorType::BadData(format!(
                "Unable to parse tokenized state for acquirer `{}`",
                raw.acquirer_id
            ))
        })?;
        Ok(StoredAcquisition {
            record: AcquisitionRecord {
                acquirer_id: raw.acquirer_id,
                tokenized,
                ttl: raw.ttl,
                expires: raw.expires_at,
                meta: Some(Meta {
                    created: raw.created_at,
                    updated: raw.updated_at,
                }),
            },
            tokenized_json: raw.tokenized,
        })
    }
}

#[derive(Clone)]
pub struct AcquisitionRepo {
    pool: SqlitePool,
}

impl AcquisitionRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn find(&self, acquirer_id: &str) -> Result<Option<StoredAcquisition>, Error> {
        sqlx::query_as("SELECT * FROM ACQUISITIONS WHERE acquirer_id = ?")
            .bind(acquirer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
            .and_then(|raw: Option<AcquisitionRaw>| raw.map(TryInto::try_into).transpose())
    }

    /// Insert a brand-new record. A unique-constraint error means another
    /// writer created the record first; callers re-read and retry.
    #[tracing::instrument(skip_all, fields(acquirer_id))]
    pub async fn insert(
        &self,
        acquirer_id: &str,
        tokenized_json: &str,
        ttl: i64,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO ACQUISITIONS (acquirer_id, tokenized, ttl, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(acquirer_id)
        .bind(tokenized_json)
        .bind(ttl)
        .bind(expires)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    /// Replace the record only if its `tokenized` column still equals the
    /// value that was read. Returns whether the precondition matched.
    #[tracing::instrument(skip_all, fields(acquirer_id))]
    pub async fn update(
        &self,
        acquirer_id: &str,
        prior_tokenized: &str,
        tokenized_json: &str,
        ttl: i64,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        sqlx::query(
            "UPDATE ACQUISITIONS SET
                tokenized = ?,
                ttl = ?,
                expires_at = ?,
                updated_at = ?
            WHERE acquirer_id = ? AND tokenized = ?",
        )
        .bind(tokenized_json)
        .bind(ttl)
        .bind(expires)
        .bind(now)
        .bind(acquirer_id)
        .bind(prior_tokenized)
        .execute(&self.pool)
        .await
        .map_err(Into::into)
        .map(|res| res.rows_affected() == 1)
    }

    /// Delete the record only if its `tokenized` column still equals the
    /// value that was read. Returns whether the precondition matched.
    #[tracing::instrument(skip_all, fields(acquirer_id))]
    pub async fn delete(&self, acquirer_id: &str, prior_tokenized: &str) -> Result<bool, Error> {
        sqlx::query("DELETE FROM ACQUISITIONS WHERE acquirer_id = ? AND tokenized = ?")
            .bind(acquirer_id)
            .bind(prior_tokenized)
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|res| res.rows_affected() == 1)
    }

    /// Remove records whose entire retention window has passed.
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired(&self, before: DateTime<Utc>, limit: u32) -> Result<u64, Error> {
        sqlx::query(
            "DELETE FROM ACQUISITIONS WHERE acquirer_id IN (
                SELECT acquirer_id FROM ACQUISITIONS
                    WHERE expires_at <= $1
                    ORDER BY expires_at
                    LIMIT $2
            )",
        )
        .bind(before)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(Into::into)
        .map(|res| res.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    pub async fn next_expiry(&self) -> Result<Option<DateTime<Utc>>, Error> {
        #[derive(sqlx::FromRow)]
        struct NextExpiry {
            next: Option<DateTime<Utc>>,
        }

        sqlx::query_as("SELECT MIN(expires_at) AS next FROM ACQUISITIONS")
            .fetch_one(&self.pool)
            .await
            .map_err(Into::into)
            .map(|row: NextExpiry| row.next)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tessera_types::acquisition::{from_millis, AcquisitionItem};

    use crate::repos::restriction::tests::pool;

    use super::*;

    fn tokenized(token: &str, count: u64, requested: i64) -> Vec<TokenizedGroup> {
        let mut resources = BTreeMap::new();
        resources.insert(token.to_string(), vec![AcquisitionItem { count, requested }]);
        vec![TokenizedGroup {
            tokenizer_id: "key-1".to_string(),
            resources,
        }]
    }

    #[tokio::test]
    async fn conditional_writes() {
        let repo = AcquisitionRepo::new(pool().await);
        let now = from_millis(1_000_000);

        assert!(repo.find("alice").await.unwrap().is_none());

        let groups = tokenized("token-a", 2, 500_000);
        let json = canonical_tokenized(&groups).unwrap();
        repo.insert("alice", &json, 60_000, from_millis(560_000), now)
            .await
            .unwrap();

        // Second insert for the same acquirer collides
        let err = repo
            .insert("alice", &json, 60_000, from_millis(560_000), now)
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        let stored = repo.find("alice").await.unwrap().unwrap();
        assert_eq!(stored.tokenized_json, json);
        assert_eq!(stored.record.tokenized, groups);
        assert_eq!(stored.record.ttl, 60_000);
        assert_eq!(stored.record.expires, from_millis(560_000));
        assert!(stored.record.is_persisted());

        // Update against the matching prior succeeds
        let updated_groups = tokenized("token-a", 3, 700_000);
        let updated_json = canonical_tokenized(&updated_groups).unwrap();
        assert!(repo
            .update("alice", &json, &updated_json, 60_000, from_millis(760_000), now)
            .await
            .unwrap());

        // The stale prior no longer matches
        assert!(!repo
            .update("alice", &json, &updated_json, 60_000, from_millis(760_000), now)
            .await
            .unwrap());
        assert!(!repo.delete("alice", &json).await.unwrap());

        // Conditional delete with the current prior
        assert!(repo.delete("alice", &updated_json).await.unwrap());
        assert!(repo.find("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiry_scan() {
        let repo = AcquisitionRepo::new(pool().await);
        let now = from_millis(10_000);

        assert_eq!(repo.next_expiry().await.unwrap(), None);

        let early = canonical_tokenized(&tokenized("token-a", 1, 1_000)).unwrap();
        let late = canonical_tokenized(&tokenized("token-b", 1, 2_000)).unwrap();
        repo.insert("alice", &early, 1_000, from_millis(2_000), now)
            .await
            .unwrap();
        repo.insert("bob", &late, 1_000, from_millis(3_000), now)
            .await
            .unwrap();

        assert_eq!(repo.next_expiry().await.unwrap(), Some(from_millis(2_000)));

        // Nothing has expired yet at t=1999
        assert_eq!(repo.purge_expired(from_millis(1_999), 100).await.unwrap(), 0);
        // Alice expires at exactly t=2000
        assert_eq!(repo.purge_expired(from_millis(2_000), 100).await.unwrap(), 1);
        assert!(repo.find("alice").await.unwrap().is_none());
        assert!(repo.find("bob").await.unwrap().is_some());

        assert_eq!(repo.purge_expired(from_millis(10_000), 100).await.unwrap(), 1);
        assert_eq!(repo.next_expiry().await.unwrap(), None);
    }
}
