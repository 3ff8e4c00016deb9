//! Connection pool
//!
//! A semaphore bounds the number of open connections. Healthy connections go
//! back onto an idle stack and are reused most-recent first; connections that
//! saw a desync or transport error are dropped, which closes the socket and
//! frees the slot.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{Reader, ServerInfo, Writer};

/// One TCP connection with its read buffer and pending request
pub struct Conn {
    id: u64,
    rd: Reader<OwnedReadHalf>,
    wr: Writer,
    out: OwnedWriteHalf,
    write_timeout: Option<Duration>,
    server: Option<ServerInfo>,
    last_used: Instant,
}

impl Conn {
    pub async fn dial(cfg: &Config, id: u64) -> Result<Self> {
        let connect = TcpStream::connect(&cfg.addr);
        let stream = match cfg.dial_timeout() {
            Some(t) => tokio::time::timeout(t, connect)
                .await
                .map_err(|_| Error::Timeout(t))?,
            None => connect.await,
        }
        .map_err(|e| Error::Connect {
            addr: cfg.addr.clone(),
            source: e,
        })?;

        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let mut rd = Reader::new(read).enable_compression(cfg.compression);
        rd.set_timeout(cfg.read_timeout());

        debug!("Dialed connection {} to {}", id, cfg.addr);
        Ok(Self {
            id,
            rd,
            wr: Writer::new(cfg.compression),
            out: write,
            write_timeout: cfg.write_timeout(),
            server: None,
            last_used: Instant::now(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reader(&mut self) -> &mut Reader<OwnedReadHalf> {
        &mut self.rd
    }

    pub fn writer(&mut self) -> &mut Writer {
        &mut self.wr
    }

    /// Send everything buffered in the writer.
    pub async fn flush(&mut self) -> Result<()> {
        self.wr.flush_to(&mut self.out, self.write_timeout).await
    }

    /// Set once the handshake has completed.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    pub(crate) fn set_server_info(&mut self, info: ServerInfo) {
        self.server = Some(info);
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("server", &self.server)
            .finish()
    }
}

/// A connection checked out of the pool. Dropping it closes the socket.
#[derive(Debug)]
pub struct PooledConn {
    conn: Conn,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
}

pub struct ConnPool {
    cfg: Arc<Config>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Conn>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl ConnPool {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(cfg.pool_size)),
            idle: Mutex::new(Vec::with_capacity(cfg.pool_size)),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            cfg,
        }
    }

    /// Check out an idle connection, or dial a new one when none is idle.
    pub async fn acquire(&self) -> Result<PooledConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let wait = self.slots.clone().acquire_owned();
        let permit = match self.cfg.pool_timeout() {
            Some(t) => tokio::time::timeout(t, wait)
                .await
                .map_err(|_| Error::PoolTimeout)?,
            None => wait.await,
        }
        .map_err(|_| Error::PoolClosed)?;

        loop {
            let next = self.idle.lock().pop();
            let Some(conn) = next else { break };

            match self.cfg.idle_timeout() {
                Some(limit) if conn.idle_for() > limit => {
                    debug!("Closing connection {} idle for {:?}", conn.id, conn.idle_for());
                }
                _ => {
                    return Ok(PooledConn {
                        conn,
                        _permit: permit,
                    })
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Conn::dial(&self.cfg, id).await?;
        Ok(PooledConn {
            conn,
            _permit: permit,
        })
    }

    /// Return a connection after use. It is discarded when `err` left the
    /// stream out of sync.
    pub fn release(&self, conn: PooledConn, err: Option<&Error>) {
        if let Some(err) = err.filter(|e| e.is_bad_conn()) {
            debug!("Discarding connection {}: {}", conn.id, err);
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let PooledConn { mut conn, _permit } = conn;
        conn.last_used = Instant::now();
        self.idle.lock().push(conn);
    }

    /// Close a connection unconditionally.
    pub fn remove(&self, conn: PooledConn) {
        debug!("Removing connection {}", conn.id);
        drop(conn);
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let in_use = if self.closed.load(Ordering::Acquire) {
            0
        } else {
            self.cfg.pool_size.saturating_sub(self.slots.available_permits())
        };
        PoolStats {
            size: self.cfg.pool_size,
            idle,
            in_use,
        }
    }

    /// Close idle connections and refuse further checkouts. Connections
    /// still checked out are closed when they come back.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.idle.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Arc<Config>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cfg = Config::new(&addr).pool_size(2).pool_timeout_ms(50);
        (listener, Arc::new(cfg))
    }

    fn accept_forever(listener: TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
    }

    #[tokio::test]
    async fn test_healthy_connection_is_reused() {
        let (listener, cfg) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(cfg);

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.release(conn, None);
        assert_eq!(pool.stats().idle, 1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_bad_connection_is_discarded() {
        let (listener, cfg) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(cfg);

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.release(conn, Some(&Error::unexpected("read_data_blocks", 255)));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 0);

        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), id);
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let (listener, cfg) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(cfg);

        let conn = pool.acquire().await.unwrap();
        let err = Error::Server(crate::protocol::Exception::new(60, "DB::Exception", "no table"));
        pool.release(conn, Some(&err));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (listener, cfg) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(cfg);

        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(Error::PoolTimeout)));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let (listener, cfg) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(cfg);

        let conn = pool.acquire().await.unwrap();
        pool.close();
        pool.release(conn, None);
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_dial_failure_is_connect_error() {
        let (listener, cfg) = listener().await;
        drop(listener);
        let pool = ConnPool::new(cfg);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. } | Error::Timeout(_)));
        assert_eq!(pool.stats().in_use, 0);
    }
}
