use std::fs;
use std::path::{Path, PathBuf};
use scylla::client::session::Session;
use crate::error::{AppError, Result};

/// Applies versioned CQL scripts from `<schema_path>/<version>/`.
///
/// A fresh keyspace runs the first version's `init_schema.cql`; later
/// versions run their `update_schema.cql`. `{}` in a script stands for the
/// keyspace name.
pub struct MigrationTool {
    keyspace: String,
    schema_path: PathBuf,
    replication_factor: u32,
}

impl MigrationTool {
    pub fn new(keyspace: String, schema_path: PathBuf, replication_factor: u32) -> Self {
        tracing::debug!("Migration tool keyspace: {}", keyspace);
        Self {
            keyspace,
            schema_path,
            replication_factor,
        }
    }

    async fn ensure_keyspace(&self, session: &Session) -> Result<()> {
        let create_keyspace = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
             {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            self.keyspace, self.replication_factor
        );
        session
            .query_unpaged(create_keyspace, &[])
            .await
            .map_err(|e| AppError::Internal(format!("Unable to create keyspace {}: {}", self.keyspace, e)))?;
        Ok(())
    }

    // A missing row in schema_version means version 0.
    async fn ensure_migration_table(&self, session: &Session) -> Result<()> {
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {}.schema_version (
                version int,
                applied_at timestamp,
                db int primary key
            )",
            self.keyspace
        );

        session
            .query_unpaged(create_table, &[])
            .await
            .map_err(|e| AppError::Internal(format!("Unable to create schema_version table: {}", e)))?;

        Ok(())
    }

    async fn get_current_version(&self, session: &Session) -> Result<i32> {
        let select = format!(
            "SELECT version FROM {}.schema_version WHERE db = 0",
            self.keyspace
        );

        let rows = session.query_unpaged(select, &[]).await?.into_rows_result()?;
        Ok(rows.maybe_first_row::<(i32,)>()?.map(|(v,)| v).unwrap_or(0))
    }

    async fn set_version(&self, session: &Session, version: i32) -> Result<()> {
        let cql = format!(
            "INSERT INTO {}.schema_version (version, applied_at, db) VALUES (?, toTimestamp(now()), 0)",
            self.keyspace
        );
        session
            .query_unpaged(cql, (version,))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to set schema_version to {}: {}", version, e)))?;
        Ok(())
    }

    async fn execute_cql_file(&self, session: &Session, file_path: &Path) -> Result<()> {
        let contents = fs::read_to_string(file_path)
            .map_err(|e| AppError::Internal(format!("Failed to read file {:?}: {}", file_path, e)))?;

        for stmt in split_statements(&contents, &self.keyspace) {
            tracing::debug!("cql: {}", stmt);
            session
                .query_unpaged(stmt.clone(), &[])
                .await
                .map_err(|e| AppError::Internal(format!("Error executing CQL `{}`: {}", stmt, e)))?;
        }

        Ok(())
    }

    /// Migrate from the stored version up to `target_version`.
    pub async fn migrate_to_version(&self, session: &Session, target_version: i32) -> Result<()> {
        self.ensure_keyspace(session).await?;
        self.ensure_migration_table(session).await?;

        let mut current_version = self.get_current_version(session).await?;
        tracing::info!("Current schema version is {}", current_version);

        let mut versions: Vec<i32> = fs::read_dir(&self.schema_path)
            .map_err(|e| AppError::Internal(format!("Unable to read schema directory {:?}: {}", self.schema_path, e)))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if !path.is_dir() {
                    return None;
                }
                path.file_name()?.to_string_lossy().parse::<i32>().ok()
            })
            .collect();

        versions.sort_unstable();

        for v in versions {
            if v <= current_version || v > target_version {
                continue;
            }
            let version_path = self.schema_path.join(v.to_string());
            let script = if current_version == 0 {
                version_path.join("init_schema.cql")
            } else {
                version_path.join("update_schema.cql")
            };

            if script.exists() {
                tracing::info!("Applying {} for version {}", script.display(), v);
                self.execute_cql_file(session, &script).await?;
            } else {
                tracing::warn!("No migration script {} for version {} - skipping.", script.display(), v);
            }

            self.set_version(session, v).await?;
            current_version = v;
            tracing::info!("Schema migrated to version {}", current_version);
        }

        if current_version < target_version {
            tracing::warn!(
                "No more migration scripts found, but target_version={} > current_version={}",
                target_version, current_version
            );
        }

        Ok(())
    }
}

/// Splits a script on `;`, drops `--` comment lines and blank statements,
/// and substitutes the keyspace.
fn split_statements(contents: &str, keyspace: &str) -> Vec<String> {
    let without_comments: String = contents
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.replace("{}", keyspace))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_split_and_keyspace_substituted() {
        let script = "-- students\nCREATE TABLE IF NOT EXISTS {}.student (id uuid PRIMARY KEY);\n\n\
                      CREATE INDEX IF NOT EXISTS ON {}.fee_transaction (student_id);\n";
        let stmts = split_statements(script, "fees");
        assert_eq!(
            stmts,
            vec![
                "CREATE TABLE IF NOT EXISTS fees.student (id uuid PRIMARY KEY)".to_string(),
                "CREATE INDEX IF NOT EXISTS ON fees.fee_transaction (student_id)".to_string(),
            ]
        );
    }

    #[test]
    fn bundled_schema_parses() {
        let script = include_str!("../schema/1/init_schema.cql");
        let stmts = split_statements(script, "fees");
        assert!(stmts.iter().any(|s| s.contains("fees.pending_fee_request")));
        assert!(stmts.iter().all(|s| !s.contains("{}")));
    }
}
