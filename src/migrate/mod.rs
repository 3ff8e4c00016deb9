//! Schema migrations
//!
//! Applied migrations are recorded in a `CollapsingMergeTree` table: applying
//! inserts a row with `sign = 1`, rolling back inserts the same row with
//! `sign = -1`. A second table serves as a lock; the lock is held while it
//! carries a `lock Int8` column.

mod migration;
mod migrator;

pub use migration::{Migration, MigrationGroup, MigrationSlice, MigrationStep, Migrations, SqlStep};
pub use migrator::{MigrationFile, MigrationOptions, Migrator};

use async_trait::async_trait;
use thiserror::Error;

use crate::block::Block;
use crate::client::{Db, QueryResult};

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("migrations table is already locked ({0})")]
    AlreadyLocked(#[source] crate::Error),

    #[error("migrations table is already unlocked ({0})")]
    AlreadyUnlocked(#[source] crate::Error),

    #[error("there are no migrations")]
    NoMigrations,

    #[error("invalid migration name: {0:?}")]
    InvalidName(String),

    #[error("migration {name} failed: {source}")]
    Step {
        name: String,
        #[source]
        source: crate::Error,
    },

    #[error("unexpected migrations table layout: {0}")]
    Layout(String),

    #[error(transparent)]
    Db(#[from] crate::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MigrateError>;

/// The statements the migrator needs from a database.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, sql: &str) -> crate::Result<QueryResult>;

    async fn insert(&self, sql: &str, block: &Block) -> crate::Result<QueryResult>;

    async fn query_blocks(&self, sql: &str) -> crate::Result<Vec<Block>>;
}

#[async_trait]
impl Executor for Db {
    async fn exec(&self, sql: &str) -> crate::Result<QueryResult> {
        Db::exec(self, sql).await
    }

    async fn insert(&self, sql: &str, block: &Block) -> crate::Result<QueryResult> {
        Db::insert(self, sql, block).await
    }

    async fn query_blocks(&self, sql: &str) -> crate::Result<Vec<Block>> {
        Db::query_blocks(self, sql).await
    }
}
