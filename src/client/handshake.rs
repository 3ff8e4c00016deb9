use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::Conn;
use crate::protocol::packet::{
    CLIENT_NAME, CLIENT_REVISION, CLIENT_VERSION_MAJOR, CLIENT_VERSION_MINOR,
};
use crate::protocol::{read_exception, ClientPacket, ServerInfo, ServerPacket, Writer};

/// Client name, version and revision, shared by hello and query packets.
pub fn write_client_info(wr: &mut Writer) {
    wr.string(CLIENT_NAME);
    wr.uvarint(CLIENT_VERSION_MAJOR);
    wr.uvarint(CLIENT_VERSION_MINOR);
    wr.uvarint(CLIENT_REVISION);
}

pub fn write_hello(wr: &mut Writer, database: &str, user: &str, password: &str) {
    wr.uvarint(ClientPacket::Hello.into());
    write_client_info(wr);
    wr.string(database);
    wr.string(user);
    wr.string(password);
}

/// Exchange hellos and record the server's identity on the connection.
pub async fn hello(conn: &mut Conn, cfg: &Config) -> Result<ServerInfo> {
    write_hello(conn.writer(), &cfg.database, &cfg.user, &cfg.password);
    conn.flush().await?;

    let rd = conn.reader();
    let code = rd.uvarint().await?;
    let info = match ServerPacket::try_from(code) {
        Ok(ServerPacket::Hello) => ServerInfo::read_from(rd).await?,
        Ok(ServerPacket::Exception) => {
            let exc = read_exception(rd, cfg.max_exception_depth).await?;
            return Err(Error::Server(exc));
        }
        _ => return Err(Error::unexpected("hello", code)),
    };

    info!(
        "Connected to {} {} (revision {}) as {}",
        info.name,
        info.version(),
        info.revision,
        cfg.user
    );
    conn.set_server_info(info.clone());
    Ok(info)
}
