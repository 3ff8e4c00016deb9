//! Common test utilities for client tests
//!
//! Provides a scripted fake server on a loopback socket. Each test spawns
//! the server side as a task, drives `Db` from the test body and joins the
//! task at the end so server-side assertion failures surface.

#![allow(dead_code)]

use std::time::Duration;

use chwire::block::{read_block, write_block_info, write_data_payload};
use chwire::protocol::{Exception, Progress, ProfileInfo, Reader, ServerInfo, ServerPacket, Writer};
use chwire::{Block, Config, Error, SettingValue};
use tokio::io::AsyncRead;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

pub const TEST_HOSTNAME: &str = "test-host";
pub const SERVER_REVISION: u64 = 54428;

pub struct FakeServer {
    listener: TcpListener,
    addr: String,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake server");
        let addr = listener.local_addr().unwrap().to_string();
        Self { listener, addr }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Client config pointing at this server with short timeouts
    pub fn config(&self, compression: bool) -> Config {
        Config::new(&self.addr)
            .compression(compression)
            .client_hostname(TEST_HOSTNAME)
            .timeouts_ms(1_000, 2_000, 2_000)
            .pool_timeout_ms(2_000)
    }

    pub async fn accept(&self, compression: bool) -> ServerConn {
        let (socket, _) = self.listener.accept().await.expect("accept failed");
        let (read, out) = socket.into_split();
        let mut rd = Reader::new(read).enable_compression(compression);
        rd.set_timeout(Some(Duration::from_secs(2)));
        ServerConn {
            rd,
            wr: Writer::new(compression),
            out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientQuery {
    pub query_id: String,
    pub os_user: String,
    pub hostname: String,
    pub client_name: String,
    pub revision: u64,
    pub settings: Vec<(String, SettingValue)>,
    pub stage: u64,
    pub compression: u64,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Text,
    Int,
    UInt,
    Bool,
}

/// Mirror of the client's settings encoding. The receiver knows each
/// setting's type by name.
pub async fn read_settings<R, F>(rd: &mut Reader<R>, kind_of: F) -> Vec<(String, SettingValue)>
where
    R: AsyncRead + Unpin,
    F: Fn(&str) -> SettingKind,
{
    let mut settings = Vec::new();
    loop {
        let name = rd.string().await.unwrap();
        if name.is_empty() {
            return settings;
        }
        let value = match kind_of(&name) {
            SettingKind::Text => SettingValue::Text(rd.string().await.unwrap()),
            SettingKind::Int => SettingValue::Int(rd.uvarint().await.unwrap() as i64),
            SettingKind::UInt => SettingValue::UInt(rd.uvarint().await.unwrap()),
            SettingKind::Bool => SettingValue::Bool(rd.bool().await.unwrap()),
        };
        settings.push((name, value));
    }
}

pub struct ServerConn {
    rd: Reader<OwnedReadHalf>,
    wr: Writer,
    out: OwnedWriteHalf,
}

impl ServerConn {
    async fn flush(&mut self) {
        self.wr.flush_to(&mut self.out, None).await.unwrap();
    }

    async fn expect_opcode(&mut self, expected: u64) {
        let code = self.rd.uvarint().await.unwrap();
        assert_eq!(code, expected, "unexpected client packet");
    }

    pub async fn expect_hello(&mut self) -> ClientHello {
        self.expect_opcode(0).await;
        ClientHello {
            client_name: self.rd.string().await.unwrap(),
            version_major: self.rd.uvarint().await.unwrap(),
            version_minor: self.rd.uvarint().await.unwrap(),
            revision: self.rd.uvarint().await.unwrap(),
            database: self.rd.string().await.unwrap(),
            user: self.rd.string().await.unwrap(),
            password: self.rd.string().await.unwrap(),
        }
    }

    pub async fn send_hello(&mut self, revision: u64) {
        self.wr.uvarint(ServerPacket::Hello.into());
        ServerInfo {
            name: "ClickHouse".to_string(),
            version_major: 23,
            version_minor: 8,
            revision,
            timezone: Some("UTC".to_string()),
            display_name: Some("fake-1".to_string()),
            version_patch: 4,
        }
        .write_to(&mut self.wr);
        self.flush().await;
    }

    pub async fn handshake(&mut self) -> ClientHello {
        let hello = self.expect_hello().await;
        self.send_hello(SERVER_REVISION).await;
        hello
    }

    pub async fn expect_query(&mut self) -> ClientQuery {
        self.expect_query_with(|_| SettingKind::Text).await
    }

    pub async fn expect_query_with<F>(&mut self, kind_of: F) -> ClientQuery
    where
        F: Fn(&str) -> SettingKind,
    {
        self.expect_opcode(1).await;
        let rd = &mut self.rd;

        let query_id = rd.string().await.unwrap();
        assert_eq!(rd.uvarint().await.unwrap(), 1, "query kind");
        assert_eq!(rd.string().await.unwrap(), "", "initial user");
        assert_eq!(rd.string().await.unwrap(), "", "initial query id");
        assert_eq!(rd.string().await.unwrap(), "[::ffff:127.0.0.1]:0");
        assert_eq!(rd.uvarint().await.unwrap(), 1, "interface");
        let os_user = rd.string().await.unwrap();
        let hostname = rd.string().await.unwrap();
        let client_name = rd.string().await.unwrap();
        rd.uvarint().await.unwrap();
        rd.uvarint().await.unwrap();
        let revision = rd.uvarint().await.unwrap();
        assert_eq!(rd.string().await.unwrap(), "", "quota key");
        rd.uvarint().await.unwrap();

        let settings = read_settings(rd, kind_of).await;

        let stage = rd.uvarint().await.unwrap();
        let compression = rd.uvarint().await.unwrap();
        let sql = rd.string().await.unwrap();

        ClientQuery {
            query_id,
            os_user,
            hostname,
            client_name,
            revision,
            settings,
            stage,
            compression,
            sql,
        }
    }

    pub async fn expect_data(&mut self) -> Block {
        self.expect_opcode(2).await;
        let mut block = Block::new();
        read_block(&mut self.rd, &mut block).await.unwrap();
        block
    }

    pub async fn expect_empty_data(&mut self) {
        let block = self.expect_data().await;
        assert_eq!(block.num_columns(), 0, "expected the empty block");
        assert_eq!(block.num_rows(), 0);
    }

    pub async fn expect_ping(&mut self) {
        self.expect_opcode(4).await;
    }

    pub async fn expect_cancel(&mut self) {
        self.expect_opcode(3).await;
    }

    /// The client closed its side of the connection.
    pub async fn expect_closed(&mut self) {
        match self.rd.u8().await {
            Err(Error::Io(e)) => assert!(
                matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                ),
                "unexpected IO error: {}",
                e
            ),
            other => panic!("Expected the client to close the connection, got {:?}", other),
        }
    }

    pub async fn send_data(&mut self, block: &Block) {
        self.wr.uvarint(ServerPacket::Data.into());
        write_data_payload(&mut self.wr, block);
        self.flush().await;
    }

    /// Data packet whose single column has the given name and type and no rows
    pub async fn send_column_header(&mut self, name: &str, type_name: &str) {
        self.wr.uvarint(ServerPacket::Data.into());
        self.wr.string("");
        self.wr.with_compression(|wr| {
            write_block_info(wr);
            wr.uvarint(1);
            wr.uvarint(1);
            wr.string(name);
            wr.string(type_name);
        });
        self.flush().await;
    }

    pub async fn send_progress(&mut self, rows: u64) {
        self.wr.uvarint(ServerPacket::Progress.into());
        Progress {
            rows,
            bytes: rows * 8,
            total_rows: rows,
            ..Default::default()
        }
        .write_to(&mut self.wr);
        self.flush().await;
    }

    pub async fn send_profile_info(&mut self, rows: u64) {
        self.wr.uvarint(ServerPacket::ProfileInfo.into());
        ProfileInfo {
            rows,
            blocks: 1,
            ..Default::default()
        }
        .write_to(&mut self.wr);
        self.flush().await;
    }

    pub async fn send_exception(&mut self, exc: &Exception) {
        self.wr.uvarint(ServerPacket::Exception.into());
        exc.write_to(&mut self.wr);
        self.flush().await;
    }

    pub async fn send_end_of_stream(&mut self) {
        self.wr.uvarint(ServerPacket::EndOfStream.into());
        self.flush().await;
    }

    pub async fn send_pong(&mut self) {
        self.wr.uvarint(ServerPacket::Pong.into());
        self.flush().await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.wr.raw(bytes);
        self.flush().await;
    }
}

/// Block with a single UInt64 column `n` holding `0..rows`
pub fn numbers_block(rows: u64) -> Block {
    let mut block = Block::new();
    block
        .push_column("n", "UInt64", chwire::ColumnData::UInt64((0..rows).collect()))
        .unwrap();
    block
}
