use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Executor;

/// Marker line separating statements in a SQL migration file
pub const SPLIT_MARKER: &str = "--migration:split";

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// One direction of a migration
#[async_trait]
pub trait MigrationStep: Send + Sync {
    async fn run(&self, db: &dyn Executor) -> crate::Result<()>;
}

/// SQL statements run one after another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStep {
    sql: String,
}

impl SqlStep {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// Non-empty statements between split markers.
    pub fn statements(&self) -> Vec<&str> {
        let mut statements = Vec::new();
        let mut start = 0;
        let mut offset = 0;

        for line in self.sql.split_inclusive('\n') {
            if line.trim() == SPLIT_MARKER {
                statements.push(&self.sql[start..offset]);
                start = offset + line.len();
            }
            offset += line.len();
        }
        statements.push(&self.sql[start..]);

        statements
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[async_trait]
impl MigrationStep for SqlStep {
    async fn run(&self, db: &dyn Executor) -> crate::Result<()> {
        for statement in self.statements() {
            db.exec(statement).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct Migration {
    pub name: String,
    pub group_id: i64,
    pub migrated_at: Option<DateTime<Utc>>,
    pub up: Option<Arc<dyn MigrationStep>>,
    pub down: Option<Arc<dyn MigrationStep>>,
}

impl Migration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn up(mut self, step: impl MigrationStep + 'static) -> Self {
        self.up = Some(Arc::new(step));
        self
    }

    pub fn down(mut self, step: impl MigrationStep + 'static) -> Self {
        self.down = Some(Arc::new(step));
        self
    }

    pub fn is_applied(&self) -> bool {
        self.group_id > 0
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .field("migrated_at", &self.migrated_at)
            .field("up", &self.up.is_some())
            .field("down", &self.down.is_some())
            .finish()
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Ordered list of migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationSlice(pub Vec<Migration>);

impl MigrationSlice {
    /// Applied migrations, most recent group first.
    pub fn applied(&self) -> MigrationSlice {
        let mut ms: Vec<Migration> = self.0.iter().filter(|m| m.is_applied()).cloned().collect();
        ms.sort_by(|a, b| b.group_id.cmp(&a.group_id).then_with(|| b.name.cmp(&a.name)));
        MigrationSlice(ms)
    }

    pub fn unapplied(&self) -> MigrationSlice {
        MigrationSlice(self.0.iter().filter(|m| !m.is_applied()).cloned().collect())
    }

    /// Highest group id, 0 when nothing is applied.
    pub fn last_group_id(&self) -> i64 {
        self.0.iter().map(|m| m.group_id).max().unwrap_or(0)
    }

    /// Migrations of the most recently applied group, in slice order.
    pub fn last_group(&self) -> MigrationGroup {
        let id = self.last_group_id();
        if id == 0 {
            return MigrationGroup::default();
        }
        MigrationGroup {
            id,
            migrations: self.0.iter().filter(|m| m.group_id == id).cloned().collect(),
        }
    }

    pub fn into_inner(self) -> Vec<Migration> {
        self.0
    }
}

impl Deref for MigrationSlice {
    type Target = [Migration];

    fn deref(&self) -> &[Migration] {
        &self.0
    }
}

/// Migrations applied (or rolled back) together
#[derive(Debug, Clone, Default)]
pub struct MigrationGroup {
    pub id: i64,
    pub migrations: Vec<Migration>,
}

impl MigrationGroup {
    pub fn is_zero(&self) -> bool {
        self.id == 0 && self.migrations.is_empty()
    }
}

impl fmt::Display for MigrationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("nil");
        }
        let names: Vec<&str> = self.migrations.iter().map(|m| m.name.as_str()).collect();
        write!(f, "group #{} ({})", self.id, names.join(", "))
    }
}

/// Registry of known migrations
#[derive(Debug, Clone, Default)]
pub struct Migrations {
    directory: Option<PathBuf>,
    ms: Vec<Migration>,
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory new migration files are created in
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    pub fn directory(&self) -> &Path {
        self.directory.as_deref().unwrap_or_else(|| Path::new("."))
    }

    pub fn add(&mut self, migration: Migration) {
        self.ms.push(migration);
    }

    pub fn len(&self) -> usize {
        self.ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ms.is_empty()
    }

    /// Register `<name>.up.sql` / `<name>.down.sql` pairs found in `dir`.
    /// A migration may have only one of the two files.
    pub fn discover(&mut self, dir: impl AsRef<Path>) -> std::io::Result<()> {
        let dir = dir.as_ref();
        let mut found: BTreeMap<String, Migration> = BTreeMap::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();

            let (name, is_up) = if let Some(name) = file_name.strip_suffix(UP_SUFFIX) {
                (name.to_string(), true)
            } else if let Some(name) = file_name.strip_suffix(DOWN_SUFFIX) {
                (name.to_string(), false)
            } else {
                continue;
            };

            let step = SqlStep::new(std::fs::read_to_string(entry.path())?);
            let migration = found
                .entry(name.clone())
                .or_insert_with(|| Migration::new(name));
            if is_up {
                migration.up = Some(Arc::new(step));
            } else {
                migration.down = Some(Arc::new(step));
            }
        }

        tracing::debug!("Discovered {} migrations in {}", found.len(), dir.display());
        self.ms.extend(found.into_values());
        if self.directory.is_none() {
            self.directory = Some(dir.to_path_buf());
        }
        Ok(())
    }

    /// Registered migrations ordered by name.
    pub fn sorted(&self) -> MigrationSlice {
        let mut ms = self.ms.clone();
        ms.sort_by(|a, b| a.name.cmp(&b.name));
        MigrationSlice(ms)
    }
}
