use chrono::Utc;
use sqlx::SqlitePool;
use tessera_types::restriction::{Restriction, RestrictionFilter};

use crate::error::{Error, ErrorType};

#[derive(Debug, sqlx::FromRow)]
struct RestrictionRaw {
    id: String,
    zone: String,
    resource: String,
    method: String,
    method_options: String,
}

impl TryFrom<RestrictionRaw> for Restriction {
    type Error = Error;

    fn try_from(raw: RestrictionRaw) -> Result<Restriction, Error> {
        let method_options = serde_json::from_str(&raw.method_options).map_err(|_| {
            ErrorType::BadData(format!(
                "Unable to parse method options for restriction `{}`",
                raw.id
            ))
        })?;
        Ok(Restriction {
            id: raw.id,
            zone: raw.zone,
            resource: raw.resource,
            method: raw.method,
            method_options,
        })
    }
}

#[derive(Clone)]
pub struct RestrictionRepo {
    pool: SqlitePool,
}

impl RestrictionRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip_all, fields(id = restriction.id))]
    pub async fn create(&self, restriction: &Restriction) -> Result<(), Error> {
        let method_options = serde_json::to_string(&restriction.method_options)
            .map_err(|_| ErrorType::InputValidation("Invalid method options".to_string()))?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO RESTRICTIONS (id, zone, resource, method, method_options, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&restriction.id)
        .bind(&restriction.zone)
        .bind(&restriction.resource)
        .bind(&restriction.method)
        .bind(method_options)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    /// Insert several restrictions atomically. The whole batch is rolled
    /// back if any identifier collides.
    #[tracing::instrument(skip_all)]
    pub async fn create_many(&self, restrictions: &[Restriction]) -> Result<(), Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for restriction in restrictions {
            let method_options = serde_json::to_string(&restriction.method_options)
                .map_err(|_| ErrorType::InputValidation("Invalid method options".to_string()))?;
            sqlx::query(
                "INSERT INTO RESTRICTIONS (id, zone, resource, method, method_options, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&restriction.id)
            .bind(&restriction.zone)
            .bind(&restriction.resource)
            .bind(&restriction.method)
            .bind(method_options)
            .bind(now)
            .bind(now)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await.map_err(Into::into)
    }

    #[tracing::instrument(skip_all, fields(id = restriction.id))]
    pub async fn update(&self, restriction: &Restriction) -> Result<(), Error> {
        let method_options = serde_json::to_string(&restriction.method_options)
            .map_err(|_| ErrorType::InputValidation("Invalid method options".to_string()))?;

        sqlx::query(
            "UPDATE RESTRICTIONS SET
                zone = ?,
                resource = ?,
                method = ?,
                method_options = ?,
                updated_at = ?
            WHERE id = ?",
        )
        .bind(&restriction.zone)
        .bind(&restriction.resource)
        .bind(&restriction.method)
        .bind(method_options)
        .bind(Utc::now())
        .bind(&restriction.id)
        .execute(&self.pool)
        .await
        .map_err(Into::into)
        .and_then(|res| {
            if res.rows_affected() == 1 {
                Ok(())
            } else {
                Err(ErrorType::NotFound(format!(
                    "Restriction `{}` not found",
                    restriction.id
                ))
                .into())
            }
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Restriction, Error> {
        sqlx::query_as("SELECT * FROM RESTRICTIONS WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
            .and_then(|raw: Option<RestrictionRaw>| {
                raw.map(TryInto::try_into).transpose()?.ok_or_else(|| {
                    ErrorType::NotFound(format!("Restriction `{id}` not found")).into()
                })
            })
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(
        &self,
        filter: &RestrictionFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Restriction>, Error> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(zone) = &filter.zone {
            clauses.push("zone = ?");
            binds.push(zone);
        }
        if let Some(resource) = &filter.resource {
            clauses.push("resource = ?");
            binds.push(resource);
        }
        if let Some(method) = &filter.method {
            clauses.push("method = ?");
            binds.push(method);
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql =
            format!("SELECT * FROM RESTRICTIONS{where_sql} ORDER BY id ASC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as(&sql);
        for bind in binds {
            query = query.bind(bind);
        }
        query
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
            .and_then(|restrictions: Vec<RestrictionRaw>| {
                restrictions
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<Vec<_>, _>>()
            })
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<bool, Error> {
        sqlx::query("DELETE FROM RESTRICTIONS WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|res| res.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_all(&self, zone: &str, resource: &str) -> Result<u64, Error> {
        sqlx::query("DELETE FROM RESTRICTIONS WHERE zone = ? AND resource = ?")
            .bind(zone)
            .bind(resource)
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|res| res.rows_affected())
    }

    /// Restrictions applying to any `(zone, resource)` pair named by the
    /// request. Order is unspecified.
    #[tracing::instrument(skip(self))]
    pub async fn match_request(
        &self,
        zones: &[String],
        resources: &[String],
    ) -> Result<Vec<Restriction>, Error> {
        if zones.is_empty() || resources.is_empty() {
            return Ok(Vec::new());
        }

        // sqlx sqlite doesn't support Vec<T>: Encode
        let zone_params = vec!["?"; zones.len()].join(", ");
        let resource_params = vec!["?"; resources.len()].join(", ");
        let sql = format!(
            "SELECT * FROM RESTRICTIONS WHERE zone IN ({zone_params}) AND resource IN ({resource_params})"
        );

        let mut query = sqlx::query_as(&sql);
        for zone in zones {
            query = query.bind(zone);
        }
        for resource in resources {
            query = query.bind(resource);
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
            .and_then(|restrictions: Vec<RestrictionRaw>| {
                restrictions
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<Vec<_>, _>>()
            })
    }
}

#[cfg(test)]
pub mod tests {
    use serde_json::json;
    use sqlx::SqlitePool;

    use super::*;

    pub async fn pool() -> SqlitePool {
        let pool = crate::store::open_in_memory().await.unwrap();
        crate::migrations::migrate(&pool).await.unwrap();
        pool
    }

    pub fn restriction(id: &str, zone: &str, resource: &str) -> Restriction {
        Restriction {
            id: id.to_string(),
            zone: zone.to_string(),
            resource: resource.to_string(),
            method: "limitOverDuration".to_string(),
            method_options: json!({ "limit": 1, "duration": "P30D" }),
        }
    }

    #[tokio::test]
    async fn crud() {
        let repo = RestrictionRepo::new(pool().await);

        let mut foo = restriction("foo", "zone-1", "resource-1");
        assert!(repo.create(&foo).await.is_ok());
        assert_eq!(repo.get("foo").await.unwrap(), foo);

        // Duplicate id is refused
        let err = repo.create(&foo).await.unwrap_err();
        assert!(err.is_unique_violation());

        // Update
        foo.method_options = json!({ "limit": 2, "duration": "P7D" });
        assert!(repo.update(&foo).await.is_ok());
        assert_eq!(repo.get("foo").await.unwrap(), foo);

        // Update of a missing restriction is NotFound
        let missing = restriction("missing", "zone-1", "resource-1");
        assert!(matches!(
            repo.update(&missing).await.unwrap_err().variant,
            ErrorType::NotFound(_)
        ));

        // Bulk insert
        let batch = vec![
            restriction("bar", "zone-1", "resource-2"),
            restriction("baz", "zone-2", "resource-1"),
        ];
        assert!(repo.create_many(&batch).await.is_ok());

        // A colliding batch rolls back entirely
        let colliding = vec![restriction("qux", "zone-2", "resource-2"), restriction("bar", "zone-1", "resource-2")];
        assert!(repo.create_many(&colliding).await.is_err());
        assert!(matches!(
            repo.get("qux").await.unwrap_err().variant,
            ErrorType::NotFound(_)
        ));

        // List with filters and pagination
        let all = repo
            .list(&RestrictionFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let zone_1 = repo
            .list(
                &RestrictionFilter {
                    zone: Some("zone-1".to_string()),
                    ..RestrictionFilter::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(zone_1.len(), 2);
        let paged = repo
            .list(&RestrictionFilter::default(), 1, 1)
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);

        // Remove
        assert!(repo.remove("foo").await.unwrap());
        assert!(!repo.remove("foo").await.unwrap());
        assert_eq!(repo.remove_all("zone-1", "resource-2").await.unwrap(), 1);
        assert_eq!(
            repo.list(&RestrictionFilter::default(), 10, 0)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn matching() {
        let repo = RestrictionRepo::new(pool().await);

        repo.create(&restriction("a", "zone-1", "resource-1"))
            .await
            .unwrap();
        repo.create(&restriction("b", "zone-1", "resource-2"))
            .await
            .unwrap();
        repo.create(&restriction("c", "zone-2", "resource-1"))
            .await
            .unwrap();

        let matched = repo
            .match_request(
                &["zone-1".to_string()],
                &["resource-1".to_string(), "resource-3".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "a");

        let matched = repo
            .match_request(
                &["zone-1".to_string(), "zone-2".to_string()],
                &["resource-1".to_string(), "resource-2".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(matched.len(), 3);

        // Empty zones match nothing
        assert!(repo
            .match_request(&[], &["resource-1".to_string()])
            .await
            .unwrap()
            .is_empty());
    }
}
