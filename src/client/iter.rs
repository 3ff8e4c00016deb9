use std::sync::Arc;

use tracing::debug;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::pool::{ConnPool, PooledConn};

use super::dispatch::{dispatch, Drain, StreamBlock};
use super::request::write_cancel;

/// Pull-based cursor over the blocks of one query.
///
/// The iterator owns its connection while open. It closes on EndOfStream
/// (connection returned to the pool), on the first error (kept in
/// [`err`](Self::err), connection released with that error) or on
/// [`close`](Self::close). A closed iterator never touches the network again.
pub struct BlockIter {
    conn: Option<PooledConn>,
    pool: Arc<ConnPool>,
    err: Option<Error>,
    max_exception_depth: usize,
}

impl BlockIter {
    pub(crate) fn new(conn: PooledConn, pool: Arc<ConnPool>, max_exception_depth: usize) -> Self {
        Self {
            conn: Some(conn),
            pool,
            err: None,
            max_exception_depth,
        }
    }

    /// Next block, or `None` once the stream is exhausted or failed.
    pub async fn next(&mut self) -> Option<Block> {
        let mut block = Block::new();
        self.next_into(&mut block).await.then_some(block)
    }

    /// Decode the next block into `block`. Returns `false` once closed.
    pub async fn next_into(&mut self, block: &mut Block) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };

        let res = dispatch(
            conn.reader(),
            &mut StreamBlock::new(block),
            self.max_exception_depth,
        )
        .await;

        match res {
            Ok(true) => true,
            Ok(false) => {
                if let Some(conn) = self.conn.take() {
                    self.pool.release(conn, None);
                }
                false
            }
            Err(err) => {
                if let Some(conn) = self.conn.take() {
                    self.pool.release(conn, Some(&err));
                }
                self.err = Some(err);
                false
            }
        }
    }

    /// Sticky error that closed the iterator, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn into_err(mut self) -> Option<Error> {
        self.err.take()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Stop reading. An open stream is cancelled and drained so the
    /// connection can be reused.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        match cancel_and_drain(&mut conn, self.max_exception_depth).await {
            Ok(()) => {
                self.pool.release(conn, None);
                Ok(())
            }
            // The server may answer a cancel with an exception; the stream
            // still ended cleanly.
            Err(err) if !err.is_bad_conn() => {
                debug!("Cancelled query ended with: {}", err);
                self.pool.release(conn, None);
                Ok(())
            }
            Err(err) => {
                self.pool.remove(conn);
                Err(err)
            }
        }
    }
}

async fn cancel_and_drain(conn: &mut PooledConn, max_exception_depth: usize) -> Result<()> {
    write_cancel(conn.writer());
    conn.flush().await?;
    dispatch(conn.reader(), &mut Drain::new(), max_exception_depth).await
}

impl Drop for BlockIter {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("Block iterator dropped while open, closing connection {}", conn.id());
            self.pool.remove(conn);
        }
    }
}

impl std::fmt::Debug for BlockIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIter")
            .field("open", &self.conn.is_some())
            .field("err", &self.err)
            .finish()
    }
}
