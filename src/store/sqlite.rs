use crate::network::subnet::NetworkClaim;
use crate::store::error::{map_write_error, StoreError, StoreResult};
use crate::store::retry::retry_db_operation;
use crate::store::schema::SchemaManager;
use crate::store::{clear_network_fields, NetworkUpdate, TenantNetworkRecord, TenantStore};
use crate::utils::process::ProcessUtils;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

const MAX_RETRIES: u32 = 5;
const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = r#"SELECT tenant_id, name, subnet, bridge_name, gateway_ip,
    dhcp_range_start, dhcp_range_end, daemon_pid, dns_servers, ntp_servers, mtu,
    created_at, updated_at FROM departments"#;

pub struct SqliteTenantStore {
    pool: SqlitePool,
}

impl SqliteTenantStore {
    /// Open (creating if needed) the database at `path` and bootstrap the schema
    pub async fn connect(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> StoreResult<Self> {
        SchemaManager::new(pool.clone()).initialize_schema().await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn write_record(&self, record: &TenantNetworkRecord) -> StoreResult<()> {
        let dns = serde_json::to_string(&record.dns_servers)?;
        let ntp = serde_json::to_string(&record.ntp_servers)?;

        let result = retry_db_operation(
            || async {
                sqlx::query(
                    r#"UPDATE departments SET subnet = ?, bridge_name = ?, gateway_ip = ?,
                       dhcp_range_start = ?, dhcp_range_end = ?, daemon_pid = ?,
                       dns_servers = ?, ntp_servers = ?, mtu = ?, updated_at = ?
                       WHERE tenant_id = ?"#,
                )
                .bind(&record.subnet)
                .bind(&record.bridge_name)
                .bind(&record.gateway_ip)
                .bind(&record.dhcp_range_start)
                .bind(&record.dhcp_range_end)
                .bind(record.daemon_pid.map(i64::from))
                .bind(&dns)
                .bind(&ntp)
                .bind(record.mtu.map(i64::from))
                .bind(record.updated_at)
                .bind(&record.tenant_id)
                .execute(&self.pool)
                .await
            },
            MAX_RETRIES,
            "update_department",
        )
        .await
        .map_err(|e| map_write_error(e, "department network"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                tenant_id: record.tenant_id.clone(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, filter: &str) -> StoreResult<Vec<TenantNetworkRecord>> {
        let sql = format!("{} {} ORDER BY tenant_id", SELECT_COLUMNS, filter);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> StoreResult<TenantNetworkRecord> {
    let dns: String = row.get("dns_servers");
    let ntp: String = row.get("ntp_servers");
    Ok(TenantNetworkRecord {
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        subnet: row.get("subnet"),
        bridge_name: row.get("bridge_name"),
        gateway_ip: row.get("gateway_ip"),
        dhcp_range_start: row.get("dhcp_range_start"),
        dhcp_range_end: row.get("dhcp_range_end"),
        daemon_pid: row
            .get::<Option<i64>, _>("daemon_pid")
            .and_then(|p| u32::try_from(p).ok()),
        dns_servers: serde_json::from_str(&dns)?,
        ntp_servers: serde_json::from_str(&ntp)?,
        mtu: row
            .get::<Option<i64>, _>("mtu")
            .and_then(|m| u32::try_from(m).ok()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl TenantStore for SqliteTenantStore {
    async fn get(&self, tenant_id: &str) -> StoreResult<Option<TenantNetworkRecord>> {
        let sql = format!("{} WHERE tenant_id = ?", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert(&self, record: &TenantNetworkRecord) -> StoreResult<()> {
        let dns = serde_json::to_string(&record.dns_servers)?;
        let ntp = serde_json::to_string(&record.ntp_servers)?;

        retry_db_operation(
            || async {
                sqlx::query(
                    r#"INSERT INTO departments (tenant_id, name, subnet, bridge_name, gateway_ip,
                       dhcp_range_start, dhcp_range_end, daemon_pid, dns_servers, ntp_servers,
                       mtu, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(&record.tenant_id)
                .bind(&record.name)
                .bind(&record.subnet)
                .bind(&record.bridge_name)
                .bind(&record.gateway_ip)
                .bind(&record.dhcp_range_start)
                .bind(&record.dhcp_range_end)
                .bind(record.daemon_pid.map(i64::from))
                .bind(&dns)
                .bind(&ntp)
                .bind(record.mtu.map(i64::from))
                .bind(record.created_at)
                .bind(record.updated_at)
                .execute(&self.pool)
                .await
            },
            MAX_RETRIES,
            "insert_department",
        )
        .await
        .map_err(|e| map_write_error(e, "department"))?;

        tracing::debug!("Stored department {}", record.tenant_id);
        Ok(())
    }

    async fn delete(&self, tenant_id: &str) -> StoreResult<bool> {
        let result = retry_db_operation(
            || async {
                sqlx::query("DELETE FROM departments WHERE tenant_id = ?")
                    .bind(tenant_id)
                    .execute(&self.pool)
                    .await
            },
            MAX_RETRIES,
            "delete_department",
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_network(&self, tenant_id: &str, update: &NetworkUpdate) -> StoreResult<()> {
        let mut record = self
            .get(tenant_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        update.apply(&mut record, ProcessUtils::get_timestamp());
        self.write_record(&record).await
    }

    async fn clear_network(&self, tenant_id: &str) -> StoreResult<()> {
        let mut record = self
            .get(tenant_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        clear_network_fields(&mut record, ProcessUtils::get_timestamp());
        self.write_record(&record).await
    }

    async fn list_with_bridge(&self) -> StoreResult<Vec<TenantNetworkRecord>> {
        self.fetch("WHERE bridge_name IS NOT NULL").await
    }

    async fn list_network_claims(&self) -> StoreResult<Vec<NetworkClaim>> {
        let records = self.fetch("WHERE subnet IS NOT NULL").await?;
        Ok(records.iter().filter_map(TenantNetworkRecord::claim).collect())
    }

    async fn list_all(&self) -> StoreResult<Vec<TenantNetworkRecord>> {
        self.fetch("").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn setup_test_db() -> (NamedTempFile, SqliteTenantStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = SqliteTenantStore::connect(temp_file.path()).await.unwrap();
        (temp_file, store)
    }

    fn configured(subnet: &str, bridge: &str) -> NetworkUpdate {
        NetworkUpdate {
            subnet: Some(subnet.to_string()),
            bridge_name: Some(bridge.to_string()),
            gateway_ip: Some("10.10.1.1".to_string()),
            dhcp_range_start: Some("10.10.1.10".to_string()),
            dhcp_range_end: Some("10.10.1.254".to_string()),
            daemon_pid: Some(Some(4242)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let (_file, store) = setup_test_db().await;
        let mut record = TenantNetworkRecord::new("acme", "Acme Corp", 100);
        record.dns_servers = vec!["9.9.9.9".to_string()];
        record.ntp_servers = vec!["10.0.0.5".to_string()];
        record.mtu = Some(1400);
        store.insert(&record).await.unwrap();

        let loaded = store.get("acme").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("missing").await.unwrap().is_none());

        let dup = store.insert(&record).await;
        assert!(matches!(dup, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_update_scan_and_clear() {
        let (_file, store) = setup_test_db().await;
        store
            .insert(&TenantNetworkRecord::new("acme", "Acme", 1))
            .await
            .unwrap();
        store
            .insert(&TenantNetworkRecord::new("globex", "Globex", 1))
            .await
            .unwrap();

        store
            .update_network("acme", &configured("10.10.1.0/24", "dept-acme"))
            .await
            .unwrap();

        let with_bridge = store.list_with_bridge().await.unwrap();
        assert_eq!(with_bridge.len(), 1);
        assert_eq!(with_bridge[0].tenant_id, "acme");
        assert_eq!(with_bridge[0].daemon_pid, Some(4242));

        let claims = store.list_network_claims().await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].bridge_name.as_deref(), Some("dept-acme"));

        store.clear_network("acme").await.unwrap();
        let cleared = store.get("acme").await.unwrap().unwrap();
        assert!(cleared.subnet.is_none());
        assert!(cleared.bridge_name.is_none());
        assert!(cleared.daemon_pid.is_none());
        assert!(store.list_with_bridge().await.unwrap().is_empty());
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unique_subnet_and_bridge() {
        let (_file, store) = setup_test_db().await;
        for tenant in ["acme", "globex"] {
            store
                .insert(&TenantNetworkRecord::new(tenant, tenant, 1))
                .await
                .unwrap();
        }
        store
            .update_network("acme", &configured("10.10.1.0/24", "dept-acme"))
            .await
            .unwrap();

        let same_subnet = store
            .update_network("globex", &configured("10.10.1.0/24", "dept-globex"))
            .await;
        assert!(matches!(same_subnet, Err(StoreError::Conflict { .. })));

        let same_bridge = store
            .update_network("globex", &configured("10.10.2.0/24", "dept-acme"))
            .await;
        assert!(matches!(same_bridge, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_update_and_delete_missing() {
        let (_file, store) = setup_test_db().await;
        let err = store
            .update_network("ghost", &NetworkUpdate::daemon_pid(Some(1)))
            .await;
        assert!(matches!(err, Err(StoreError::NotFound { .. })));

        store
            .insert(&TenantNetworkRecord::new("acme", "Acme", 1))
            .await
            .unwrap();
        assert!(store.delete("acme").await.unwrap());
        assert!(!store.delete("acme").await.unwrap());
    }
}
