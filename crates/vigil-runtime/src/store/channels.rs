use std::collections::HashMap;

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use vigil_core::channel::{Channel, ChannelFilter, ChannelType};
use vigil_core::{Result, VigilError};

/// Store for notification channels.
#[derive(Clone)]
pub struct ChannelStore {
    pool: sqlx::PgPool,
}

const CHANNEL_COLUMNS: &str =
    "id, name, channel_type, config, filters, enabled, created_at, updated_at";

impl ChannelStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Insert a channel.
    pub async fn create(&self, channel: &Channel) -> Result<()> {
        let config = serde_json::to_value(&channel.config).unwrap_or_default();
        let filters = serde_json::to_value(&channel.filters).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO channels
            (id, name, channel_type, config, filters, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(channel.id)
        .bind(&channel.name)
        .bind(channel.channel_type.to_string())
        .bind(config)
        .bind(filters)
        .bind(channel.enabled)
        .bind(channel.created_at)
        .bind(channel.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(())
    }

    /// List all channels.
    pub async fn list(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM channels ORDER BY name",
            CHANNEL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(parse_channel_row).collect())
    }

    /// Get a channel by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Channel>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM channels WHERE id = $1",
            CHANNEL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        Ok(row.map(parse_channel_row))
    }

    /// Update a channel in place.
    pub async fn update(&self, channel: &Channel) -> Result<()> {
        let config = serde_json::to_value(&channel.config).unwrap_or_default();
        let filters = serde_json::to_value(&channel.filters).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE channels
            SET name = $2, channel_type = $3, config = $4, filters = $5, enabled = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(channel.id)
        .bind(&channel.name)
        .bind(channel.channel_type.to_string())
        .bind(config)
        .bind(filters)
        .bind(channel.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(VigilError::NotFound(format!("channel {}", channel.id)));
        }

        Ok(())
    }

    /// Delete a channel.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM channels WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(VigilError::NotFound(format!("channel {}", id)));
        }

        Ok(())
    }
}

fn parse_channel_row(row: PgRow) -> Channel {
    let config_json: serde_json::Value = row.get("config");
    let filters_json: serde_json::Value = row.get("filters");
    let config: HashMap<String, serde_json::Value> =
        serde_json::from_value(config_json).unwrap_or_default();
    let filters: Vec<ChannelFilter> = serde_json::from_value(filters_json).unwrap_or_default();
    let type_str: String = row.get("channel_type");

    Channel {
        id: row.get("id"),
        name: row.get("name"),
        channel_type: type_str.parse().unwrap_or(ChannelType::Webhook),
        config,
        filters,
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_store_creation() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/nonexistent")
            .expect("Failed to create lazy pool");

        let _store = ChannelStore::new(pool);
    }
}
