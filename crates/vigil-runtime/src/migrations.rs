//! Schema migrations with single-runner locking.
//!
//! A PostgreSQL advisory lock ensures only one process applies migrations at
//! a time; applied migrations are tracked in `vigil_migrations`.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::{debug, info, warn};

use vigil_core::error::{Result, VigilError};

/// Advisory lock id for migrations ("VIGIL" in hex).
const MIGRATION_LOCK_ID: i64 = 0x564947494c;

/// The internal schema, embedded from the migrations directory.
const VIGIL_INTERNAL_SQL: &str = include_str!("../migrations/0000_vigil_internal.sql");

/// A single named migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Get all built-in migrations, applied in order before any user migrations.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0000_vigil_internal", VIGIL_INTERNAL_SQL)]
}

/// Migration runner.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations under the advisory lock.
    pub async fn run(&self) -> Result<()> {
        self.acquire_lock().await?;

        let result = self.run_inner().await;

        if let Err(e) = self.release_lock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    async fn run_inner(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let applied = self.applied_migrations().await?;
        debug!("Already applied migrations: {:?}", applied);

        for migration in builtin_migrations() {
            if !applied.contains(&migration.name) {
                self.apply(&migration).await?;
            }
        }

        Ok(())
    }

    async fn acquire_lock(&self) -> Result<()> {
        debug!("Acquiring migration lock");
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Database(format!("Failed to acquire migration lock: {}", e)))?;
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| VigilError::Database(format!("Failed to release migration lock: {}", e)))?;
        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vigil_migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Database(format!("Failed to create migrations table: {}", e)))?;

        Ok(())
    }

    async fn applied_migrations(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM vigil_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Database(format!("Failed to get applied migrations: {}", e)))?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn apply(&self, migration: &Migration) -> Result<()> {
        info!("Applying migration: {}", migration.name);

        for statement in split_sql_statements(&migration.sql) {
            let statement = statement.trim();

            if statement.is_empty()
                || statement.lines().all(|l| {
                    let l = l.trim();
                    l.is_empty() || l.starts_with("--")
                })
            {
                continue;
            }

            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                VigilError::Database(format!(
                    "Failed to apply migration '{}': {}",
                    migration.name, e
                ))
            })?;
        }

        sqlx::query("INSERT INTO vigil_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                VigilError::Database(format!(
                    "Failed to record migration '{}': {}",
                    migration.name, e
                ))
            })?;

        info!("Migration applied: {}", migration.name);
        Ok(())
    }
}

/// Split SQL into individual statements, respecting dollar-quoted strings.
/// Handles PL/pgSQL bodies that contain semicolons inside $$ delimiters.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_dollar_quote = false;
    let mut dollar_tag = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);

        if c == '$' {
            let mut potential_tag = String::from("$");

            while let Some(&next_c) = chars.peek() {
                if next_c == '$' {
                    potential_tag.push(chars.next().unwrap());
                    current.push('$');
                    break;
                } else if next_c.is_alphanumeric() || next_c == '_' {
                    potential_tag.push(chars.next().unwrap());
                    current.push(potential_tag.chars().last().unwrap());
                } else {
                    break;
                }
            }

            if potential_tag.len() >= 2 && potential_tag.ends_with('$') {
                if in_dollar_quote && potential_tag == dollar_tag {
                    in_dollar_quote = false;
                    dollar_tag.clear();
                } else if !in_dollar_quote {
                    in_dollar_quote = true;
                    dollar_tag = potential_tag;
                }
            }
        }

        if c == ';' && !in_dollar_quote {
            let stmt = current.trim().trim_end_matches(';').trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current.clear();
        }
    }

    let stmt = current.trim().trim_end_matches(';').trim().to_string();
    if !stmt.is_empty() {
        statements.push(stmt);
    }

    statements
}
