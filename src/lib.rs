//! Native TCP protocol client for ClickHouse-compatible databases.

pub mod block;
pub mod client;
pub mod config;
pub mod error;
pub mod migrate;
pub mod pool;
pub mod protocol;

pub use block::{Block, Column, ColumnData};
pub use client::{BlockIter, Db, QueryResult};
pub use config::{Config, SettingValue, Settings};
pub use error::{Error, Result};
pub use pool::PoolStats;
pub use protocol::{Exception, ServerInfo};
