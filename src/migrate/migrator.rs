use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use super::migration::{Migration, MigrationGroup, MigrationSlice, Migrations};
use super::{Executor, MigrateError, Result};
use crate::block::{Block, ColumnData};

const DEFAULT_TABLE: &str = "ch_migrations";
const DEFAULT_LOCKS_TABLE: &str = "ch_migration_locks";
const LOCK_COLUMN: &str = "lock";
const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

const SQL_TEMPLATE: &str = "SELECT 1\n\n--migration:split\n\nSELECT 2\n";

const CODE_TEMPLATE: &str = r#"use chwire::migrate::{Executor, Migration, MigrationStep};

struct Up;

#[async_trait::async_trait]
impl MigrationStep for Up {
    async fn run(&self, _db: &dyn Executor) -> chwire::Result<()> {
        println!(" [up migration] ");
        Ok(())
    }
}

struct Down;

#[async_trait::async_trait]
impl MigrationStep for Down {
    async fn run(&self, _db: &dyn Executor) -> chwire::Result<()> {
        println!(" [down migration] ");
        Ok(())
    }
}

pub fn migration(name: &str) -> Migration {
    Migration::new(name).up(Up).down(Down)
}
"#;

fn name_re() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| Regex::new(r"^[0-9a-z_\-]+$").unwrap())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Record migrations without running their steps
    pub nop: bool,
}

/// A file written by one of the `create_*` helpers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub name: String,
    pub path: PathBuf,
    pub content: String,
}

pub struct Migrator<E> {
    db: E,
    migrations: Migrations,
    table: String,
    locks_table: String,
    apply_on_success: bool,
}

impl<E: Executor> Migrator<E> {
    pub fn new(db: E, migrations: Migrations) -> Self {
        Self {
            db,
            migrations,
            table: DEFAULT_TABLE.to_string(),
            locks_table: DEFAULT_LOCKS_TABLE.to_string(),
            apply_on_success: false,
        }
    }

    pub fn table_name(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn locks_table_name(mut self, table: &str) -> Self {
        self.locks_table = table.to_string();
        self
    }

    /// Only record a migration when its step succeeded.
    pub fn apply_on_success(mut self, enabled: bool) -> Self {
        self.apply_on_success = enabled;
        self
    }

    pub fn db(&self) -> &E {
        &self.db
    }

    pub fn migrations(&self) -> &Migrations {
        &self.migrations
    }

    pub async fn init(&self) -> Result<()> {
        self.db
            .exec(&format!(
                "CREATE TABLE IF NOT EXISTS {} (name String, group_id Int64, migrated_at DateTime, sign Int8) \
                 ENGINE = CollapsingMergeTree(sign) ORDER BY name",
                self.table
            ))
            .await?;
        self.db
            .exec(&format!(
                "CREATE TABLE IF NOT EXISTS {} (a Int8) ENGINE = MergeTree() ORDER BY tuple()",
                self.locks_table
            ))
            .await?;
        Ok(())
    }

    /// Drop both tables and create them again.
    pub async fn reset(&self) -> Result<()> {
        self.db
            .exec(&format!("DROP TABLE IF EXISTS {}", self.table))
            .await?;
        self.db
            .exec(&format!("DROP TABLE IF EXISTS {}", self.locks_table))
            .await?;
        self.init().await
    }

    pub async fn lock(&self) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} Int8",
            self.locks_table, LOCK_COLUMN
        );
        self.db
            .exec(&sql)
            .await
            .map_err(MigrateError::AlreadyLocked)?;
        debug!("Locked {}", self.locks_table);
        Ok(())
    }

    pub async fn unlock(&self) -> Result<()> {
        let sql = format!("ALTER TABLE {} DROP COLUMN {}", self.locks_table, LOCK_COLUMN);
        match self.db.exec(&sql).await {
            Ok(_) => {
                debug!("Unlocked {}", self.locks_table);
                Ok(())
            }
            Err(err) if err.to_string().contains("Cannot find column") => Ok(()),
            Err(err) => Err(MigrateError::AlreadyUnlocked(err)),
        }
    }

    /// Registered migrations in ascending order, with group id and
    /// migration time filled in for the applied ones.
    pub async fn migrations_with_status(&self) -> Result<MigrationSlice> {
        let (sorted, _) = self.status().await?;
        Ok(sorted)
    }

    async fn status(&self) -> Result<(MigrationSlice, i64)> {
        let mut sorted = self.migrations.sorted();
        let applied = self.select_applied().await?;

        let by_name: HashMap<&str, &Migration> =
            applied.iter().map(|m| (m.name.as_str(), m)).collect();
        for m in sorted.0.iter_mut() {
            if let Some(applied) = by_name.get(m.name.as_str()) {
                m.group_id = applied.group_id;
                m.migrated_at = applied.migrated_at;
            }
        }

        Ok((sorted, applied.last_group_id()))
    }

    async fn select_applied(&self) -> Result<MigrationSlice> {
        let sql = format!(
            "SELECT name, group_id, migrated_at FROM {} FINAL WHERE sign > 0",
            self.table
        );
        let mut applied = Vec::new();

        for block in self.db.query_blocks(&sql).await? {
            let column = |name: &str| {
                block
                    .column_by_name(name)
                    .map(|c| c.data())
                    .ok_or_else(|| MigrateError::Layout(format!("missing column {}", name)))
            };
            let names = column("name")?
                .as_strings()
                .ok_or_else(|| MigrateError::Layout("name is not a String".to_string()))?;
            let group_ids = column("group_id")?
                .as_i64s()
                .ok_or_else(|| MigrateError::Layout("group_id is not an Int64".to_string()))?;
            let times = column("migrated_at")?
                .as_datetimes()
                .ok_or_else(|| MigrateError::Layout("migrated_at is not a DateTime".to_string()))?;

            for ((name, group_id), ts) in names.iter().zip(group_ids).zip(times) {
                applied.push(Migration {
                    group_id: *group_id,
                    migrated_at: Utc.timestamp_opt(i64::from(*ts), 0).single(),
                    ..Migration::new(name.clone())
                });
            }
        }

        Ok(MigrationSlice(applied))
    }

    fn validate(&self) -> Result<()> {
        if self.migrations.is_empty() {
            return Err(MigrateError::NoMigrations);
        }
        Ok(())
    }

    /// Release the lock after a locked operation; unlock failures are only logged.
    async fn unlock_after<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(err) = self.unlock().await {
            warn!("Failed to unlock {}: {}", self.locks_table, err);
        }
        res
    }

    /// Apply every unapplied migration as one new group.
    pub async fn migrate(&self, opts: MigrationOptions) -> Result<MigrationGroup> {
        self.validate()?;
        self.lock().await?;
        let res = self.migrate_locked(opts).await;
        self.unlock_after(res).await
    }

    async fn migrate_locked(&self, opts: MigrationOptions) -> Result<MigrationGroup> {
        let (migrations, last_group_id) = self.status().await?;

        let mut group = MigrationGroup {
            id: 0,
            migrations: migrations.unapplied().into_inner(),
        };
        if group.migrations.is_empty() {
            return Ok(group);
        }
        group.id = last_group_id + 1;

        for migration in group.migrations.iter_mut() {
            migration.group_id = group.id;

            let mut step_err = None;
            if let (false, Some(up)) = (opts.nop, migration.up.as_ref()) {
                info!("Applying {}", migration.name);
                if let Err(err) = up.run(&self.db).await {
                    if self.apply_on_success {
                        return Err(step_error(migration, err));
                    }
                    step_err = Some(err);
                }
            }

            self.mark_applied(migration).await?;

            if let Some(err) = step_err {
                return Err(step_error(migration, err));
            }
        }

        Ok(group)
    }

    /// Roll back the most recently applied group, newest migration first.
    pub async fn rollback(&self, opts: MigrationOptions) -> Result<MigrationGroup> {
        self.validate()?;
        self.lock().await?;
        let res = self.rollback_locked(opts).await;
        self.unlock_after(res).await
    }

    async fn rollback_locked(&self, opts: MigrationOptions) -> Result<MigrationGroup> {
        let (migrations, _) = self.status().await?;
        let mut group = migrations.last_group();

        for migration in group.migrations.iter_mut().rev() {
            let mut step_err = None;
            if let (false, Some(down)) = (opts.nop, migration.down.as_ref()) {
                info!("Rolling back {}", migration.name);
                if let Err(err) = down.run(&self.db).await {
                    if self.apply_on_success {
                        return Err(step_error(migration, err));
                    }
                    step_err = Some(err);
                }
            }

            self.mark_unapplied(migration).await?;

            if let Some(err) = step_err {
                return Err(step_error(migration, err));
            }
        }

        Ok(group)
    }

    /// Record `migration` as applied.
    pub async fn mark_applied(&self, migration: &mut Migration) -> Result<()> {
        let now = Utc::now();
        migration.migrated_at = Some(now);
        self.insert_mark(migration, now, 1).await
    }

    /// Record `migration` as not applied.
    pub async fn mark_unapplied(&self, migration: &Migration) -> Result<()> {
        let at = migration.migrated_at.unwrap_or_else(Utc::now);
        self.insert_mark(migration, at, -1).await
    }

    async fn insert_mark(&self, migration: &Migration, at: DateTime<Utc>, sign: i8) -> Result<()> {
        let migrated_at = u32::try_from(at.timestamp()).map_err(|_| {
            MigrateError::Layout(format!("migration time {} is out of DateTime range", at))
        })?;

        let mut block = Block::new();
        block.push_column("name", "String", ColumnData::String(vec![migration.name.clone()]))?;
        block.push_column("group_id", "Int64", ColumnData::Int64(vec![migration.group_id]))?;
        block.push_column("migrated_at", "DateTime", ColumnData::DateTime(vec![migrated_at]))?;
        block.push_column("sign", "Int8", ColumnData::Int8(vec![sign]))?;

        let sql = format!(
            "INSERT INTO {} (name, group_id, migrated_at, sign) VALUES",
            self.table
        );
        self.db.insert(&sql, &block).await?;
        Ok(())
    }

    /// Write `<version>_<name>.up.sql` and `.down.sql` into the migrations
    /// directory.
    pub fn create_sql_migrations(&self, name: &str) -> Result<Vec<MigrationFile>> {
        let name = gen_migration_name(name, Utc::now())?;
        let up = self.create_file(format!("{}.up.sql", name), SQL_TEMPLATE)?;
        let down = self.create_file(format!("{}.down.sql", name), SQL_TEMPLATE)?;
        Ok(vec![up, down])
    }

    /// Write a `<version>_<name>.rs` migration stub into the migrations
    /// directory.
    pub fn create_code_migration(&self, name: &str) -> Result<MigrationFile> {
        let name = gen_migration_name(name, Utc::now())?;
        self.create_file(format!("{}.rs", name), CODE_TEMPLATE)
    }

    fn create_file(&self, file_name: String, content: &str) -> Result<MigrationFile> {
        let path = self.migrations.directory().join(&file_name);
        std::fs::write(&path, content)?;
        info!("Created migration {}", path.display());
        Ok(MigrationFile {
            name: file_name,
            path,
            content: content.to_string(),
        })
    }
}

fn step_error(migration: &Migration, source: crate::Error) -> MigrateError {
    MigrateError::Step {
        name: migration.name.clone(),
        source,
    }
}

fn gen_migration_name(name: &str, now: DateTime<Utc>) -> Result<String> {
    if name.is_empty() || !name_re().is_match(name) {
        return Err(MigrateError::InvalidName(name.to_string()));
    }
    Ok(format!("{}_{}", now.format(VERSION_FORMAT), name))
}
