use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use mc_infra::ssh::{Secret, SecretStore, SecretStoreError};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::warn;

#[derive(Debug, Clone, FromRow)]
pub struct SecretRow {
    pub name: String,
    pub data: Json<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

impl SecretRow {
    pub async fn get_by_name(pool: &PgPool, name: &str) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT name, data, created_at FROM secrets WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    /// Insert unless a row of that name exists. Returns whether it was inserted.
    pub async fn insert_if_absent(
        pool: &PgPool,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO secrets (name, data) VALUES ($1, $2)
               ON CONFLICT (name) DO NOTHING"#,
        )
        .bind(name)
        .bind(Json(data))
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    fn into_secret(self) -> Secret {
        let data = decode_data(&self.name, self.data.0);
        Secret {
            name: self.name,
            data,
        }
    }
}

fn encode_data(data: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
    data.iter()
        .map(|(k, v)| (k.clone(), BASE64.encode(v)))
        .collect()
}

// Undecodable entries are dropped so the reader sees them as missing.
fn decode_data(name: &str, data: BTreeMap<String, String>) -> BTreeMap<String, Vec<u8>> {
    data.into_iter()
        .filter_map(|(k, v)| match BASE64.decode(v.as_bytes()) {
            Ok(bytes) => Some((k, bytes)),
            Err(e) => {
                warn!(secret = %name, entry = %k, error = %e, "ignoring undecodable secret entry");
                None
            }
        })
        .collect()
}

/// [`SecretStore`] backed by the `secrets` table.
#[derive(Clone)]
pub struct PgSecretStore {
    pool: PgPool,
}

impl PgSecretStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for PgSecretStore {
    async fn get(&self, name: &str) -> Result<Secret, SecretStoreError> {
        SecretRow::get_by_name(&self.pool, name)
            .await
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?
            .map(SecretRow::into_secret)
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
    }

    async fn create(&self, secret: &Secret) -> Result<(), SecretStoreError> {
        let inserted = SecretRow::insert_if_absent(&self.pool, &secret.name, &encode_data(&secret.data))
            .await
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?;

        if !inserted {
            return Err(SecretStoreError::AlreadyExists(secret.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn values_are_stored_as_base64() {
        let data = BTreeMap::from([("id_rsa".to_string(), b"-----BEGIN".to_vec())]);
        let encoded = encode_data(&data);
        assert_eq!(encoded["id_rsa"], "LS0tLS1CRUdJTg==");
        assert_eq!(
            serde_json::to_value(Json(&encoded)).unwrap(),
            serde_json::json!({ "id_rsa": "LS0tLS1CRUdJTg==" })
        );
    }

    #[test]
    fn undecodable_entries_are_dropped() {
        let row = SecretRow {
            name: "machine-controller-ssh-key".into(),
            data: Json(BTreeMap::from([
                ("id_rsa".to_string(), "not base64!".to_string()),
                ("note".to_string(), "aGk=".to_string()),
            ])),
            created_at: Utc::now(),
        };

        let secret = row.into_secret();
        assert!(!secret.data.contains_key("id_rsa"));
        assert_eq!(secret.data["note"], b"hi".to_vec());
    }

    /// Pool for the database named by `DATABASE_URL`, migrated; `None` when unset.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty())?;
        let pool = crate::create_pool(&url).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        Some(pool)
    }

    #[tokio::test]
    async fn concurrent_creates_store_exactly_one_secret() {
        let Some(pool) = test_pool().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let store = Arc::new(PgSecretStore::new(pool.clone()));
        let name = format!(
            "test-secret-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        assert!(matches!(
            store.get(&name).await,
            Err(SecretStoreError::NotFound(_))
        ));

        let racers: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                let secret = Secret {
                    name: name.clone(),
                    data: BTreeMap::from([("id_rsa".to_string(), vec![i; 4])]),
                };
                tokio::spawn(async move { (i, store.create(&secret).await) })
            })
            .collect();

        let mut winners = Vec::new();
        for racer in racers {
            match racer.await.unwrap() {
                (i, Ok(())) => winners.push(i),
                (_, Err(SecretStoreError::AlreadyExists(n))) => assert_eq!(n, name),
                (_, Err(e)) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners.len(), 1);

        let stored = store.get(&name).await.unwrap();
        assert_eq!(stored.data["id_rsa"], vec![winners[0]; 4]);

        sqlx::query("DELETE FROM secrets WHERE name = $1")
            .bind(&name)
            .execute(&pool)
            .await
            .unwrap();
    }
}
