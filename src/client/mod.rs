//! Client facade over the connection pool

pub mod dispatch;
pub mod handshake;
pub mod iter;
pub mod request;

pub use iter::BlockIter;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::block::Block;
use crate::config::Config;
use crate::error::Result;
use crate::pool::{ConnPool, PoolStats, PooledConn};
use crate::protocol::{ServerInfo, ServerPacket};

use dispatch::{dispatch, DataBlocks, PongReply, SampleBlock, SinglePacket};
use request::{write_block, write_ping, write_query};

/// Outcome of a statement that does not stream rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub affected: u64,
}

struct DbInner {
    cfg: Arc<Config>,
    pool: Arc<ConnPool>,
    hostname: String,
}

/// Handle to a database. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

fn local_hostname() -> String {
    hostname_or_empty(hostname::get())
}

/// A failed lookup degrades to an empty hostname.
fn hostname_or_empty(lookup: std::io::Result<std::ffi::OsString>) -> String {
    match lookup {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Failed to resolve local hostname: {}", e);
            String::new()
        }
    }
}

impl Db {
    /// Create a client. No connection is opened until first use.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let hostname = cfg.client_hostname.clone().unwrap_or_else(local_hostname);
        let cfg = Arc::new(cfg);

        Ok(Self {
            inner: Arc::new(DbInner {
                pool: Arc::new(ConnPool::new(cfg.clone())),
                cfg,
                hostname,
            }),
        })
    }

    pub fn open(dsn: &str) -> Result<Self> {
        Self::new(Config::from_dsn(dsn)?)
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    /// Hostname reported in every query
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn close(&self) {
        self.inner.pool.close();
    }

    fn max_exception_depth(&self) -> usize {
        self.inner.cfg.max_exception_depth
    }

    /// Check out a connection, running the handshake on first use.
    async fn conn(&self) -> Result<PooledConn> {
        let mut conn = self.inner.pool.acquire().await?;
        if conn.server_info().is_none() {
            if let Err(err) = handshake::hello(&mut conn, &self.inner.cfg).await {
                self.inner.pool.remove(conn);
                return Err(err);
            }
        }
        Ok(conn)
    }

    fn release<T>(&self, conn: PooledConn, res: &Result<T>) {
        self.inner.pool.release(conn, res.as_ref().err());
    }

    async fn send_query(&self, conn: &mut PooledConn, sql: &str) -> Result<()> {
        debug!("Query: {}", sql);
        let wr = conn.writer();
        write_query(wr, &self.inner.hostname, &self.inner.cfg.settings, sql);
        write_block(wr, None);
        conn.flush().await
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let conn = self.conn().await?;
        let info = conn.server_info().cloned().unwrap_or_default();
        self.inner.pool.release(conn, None);
        Ok(info)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let res = self.ping_on(&mut conn).await;
        self.release(conn, &res);
        res
    }

    async fn ping_on(&self, conn: &mut PooledConn) -> Result<()> {
        write_ping(conn.writer());
        conn.flush().await?;
        dispatch(conn.reader(), &mut PongReply, self.max_exception_depth()).await
    }

    /// Run a statement and count the rows of every returned block.
    pub async fn exec(&self, sql: &str) -> Result<QueryResult> {
        let mut conn = self.conn().await?;
        let res = self.exec_on(&mut conn, sql).await;
        self.release(conn, &res);
        res
    }

    async fn exec_on(&self, conn: &mut PooledConn, sql: &str) -> Result<QueryResult> {
        self.send_query(conn, sql).await?;
        let result = dispatch(
            conn.reader(),
            &mut DataBlocks::new(),
            self.max_exception_depth(),
        )
        .await?;
        Ok(result.unwrap_or_default())
    }

    /// Start a query and stream its blocks.
    pub async fn query(&self, sql: &str) -> Result<BlockIter> {
        let mut conn = self.conn().await?;
        if let Err(err) = self.send_query(&mut conn, sql).await {
            self.inner.pool.release(conn, Some(&err));
            return Err(err);
        }
        Ok(BlockIter::new(
            conn,
            self.inner.pool.clone(),
            self.max_exception_depth(),
        ))
    }

    /// Run a query and collect every block that carries rows.
    pub async fn query_blocks(&self, sql: &str) -> Result<Vec<Block>> {
        let mut iter = self.query(sql).await?;
        let mut blocks = Vec::new();
        while let Some(block) = iter.next().await {
            if block.num_rows() > 0 {
                blocks.push(block);
            }
        }
        match iter.into_err() {
            Some(err) => Err(err),
            None => Ok(blocks),
        }
    }

    /// Insert `block` with an `INSERT ... VALUES` statement.
    pub async fn insert(&self, sql: &str, block: &Block) -> Result<QueryResult> {
        let mut conn = self.conn().await?;
        let res = self.insert_on(&mut conn, sql, block).await;
        self.release(conn, &res);
        res
    }

    async fn insert_on(
        &self,
        conn: &mut PooledConn,
        sql: &str,
        block: &Block,
    ) -> Result<QueryResult> {
        let depth = self.max_exception_depth();

        self.send_query(conn, sql).await?;
        let sample = dispatch(conn.reader(), &mut SampleBlock::new(), depth).await?;
        debug!(
            "Insert target has {} columns, sending {} rows",
            sample.num_columns(),
            block.num_rows()
        );

        let wr = conn.writer();
        write_block(wr, Some(block));
        write_block(wr, None);
        conn.flush().await?;

        let ack = dispatch(conn.reader(), &mut SinglePacket, depth).await?;
        if ack != ServerPacket::EndOfStream {
            dispatch(conn.reader(), &mut DataBlocks::new(), depth).await?;
        }

        Ok(QueryResult {
            affected: block.num_rows() as u64,
        })
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("addr", &self.inner.cfg.addr)
            .field("database", &self.inner.cfg.database)
            .field("pool", &self.inner.pool.stats())
            .finish()
    }
}
