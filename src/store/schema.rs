use crate::store::error::StoreResult;
use sqlx::SqlitePool;

pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StoreResult<()> {
        self.create_departments_table().await?;
        tracing::debug!("Department schema ready");
        Ok(())
    }

    async fn create_departments_table(&self) -> StoreResult<()> {
        // UNIQUE admits any number of NULLs, so unconfigured rows never clash
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS departments (
                tenant_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                subnet TEXT UNIQUE,
                bridge_name TEXT UNIQUE,
                gateway_ip TEXT,
                dhcp_range_start TEXT,
                dhcp_range_end TEXT,
                daemon_pid INTEGER,
                dns_servers TEXT NOT NULL DEFAULT '[]',
                ntp_servers TEXT NOT NULL DEFAULT '[]',
                mtu INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_departments_bridge
            ON departments(bridge_name)
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
