use rusqlite::{Connection, params};
use std::fs;
use std::path::Path;
use crate::error::{Result, GraphRepoError};

/// A schema migration loaded from `NNN_name.sql`
#[derive(Debug)]
struct Migration {
    version: u32,
    name: String,
    sql: String,
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Names of applied migrations, oldest first
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
        .map_err(GraphRepoError::Database)?;
    Ok(names)
}

fn parse_version(filename: &str) -> Result<u32> {
    let version_str = filename
        .split('_')
        .next()
        .ok_or_else(|| GraphRepoError::Config(format!("Invalid migration filename: {}", filename)))?;
    version_str
        .parse()
        .map_err(|_| GraphRepoError::Config(format!("Invalid migration version: {}", version_str)))
}

fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let entries = fs::read_dir(migrations_dir).map_err(|e| {
        GraphRepoError::Config(format!(
            "Cannot read migrations directory {}: {}",
            migrations_dir.display(),
            e
        ))
    })?;

    let mut migrations = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| GraphRepoError::Config("Invalid migration filename".to_string()))?;

        migrations.push(Migration {
            version: parse_version(filename)?,
            name: filename.trim_end_matches(".sql").to_string(),
            sql: fs::read_to_string(&path)?,
        });
    }

    migrations.sort_by_key(|m| m.version);
    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(GraphRepoError::Config(format!(
            "Duplicate migration version {}: {} and {}",
            pair[0].version, pair[0].name, pair[1].name
        )));
    }

    Ok(migrations)
}

/// Run all pending migrations, each in its own transaction
///
/// Returns the number of migrations applied by this call.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<usize> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;
    let mut count = 0;

    for migration in load_migrations(migrations_dir)? {
        if applied.contains(&migration.name) {
            log::debug!("Migration {} already applied, skipping", migration.name);
            continue;
        }

        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            GraphRepoError::Config(format!("Failed to execute migration {}: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;

        count += 1;
    }

    log::info!("Migrations up to date ({} applied now)", count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project_migrations() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    }

    #[test]
    fn test_load_migrations_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let migrations_dir = temp_dir.path().join("migrations");
        fs::create_dir(&migrations_dir).unwrap();
        fs::write(migrations_dir.join("002_another.sql"), "CREATE TABLE another (id INTEGER);").unwrap();
        fs::write(migrations_dir.join("001_test.sql"), "CREATE TABLE test (id INTEGER);").unwrap();
        fs::write(migrations_dir.join("README.md"), "not a migration").unwrap();

        let migrations = load_migrations(&migrations_dir).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[1].name, "002_another");
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("001_a.sql"), "SELECT 1;").unwrap();
        fs::write(temp_dir.path().join("001_b.sql"), "SELECT 1;").unwrap();

        let err = load_migrations(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("Duplicate migration version 1"));
    }

    #[test]
    fn test_full_migration_schema_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();

        let first = run_migrations(&mut conn, &project_migrations()).unwrap();
        assert!(first >= 2);
        let second = run_migrations(&mut conn, &project_migrations()).unwrap();
        assert_eq!(second, 0);

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
            .unwrap();
        assert!(tables.contains(&"processing_index".to_string()));
        assert!(tables.contains(&"object_locks".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));

        let applied = get_applied_migrations(&conn).unwrap();
        assert_eq!(applied[0], "001_processing_index");
    }
}
