//! Server hello and the metadata packets interleaved with query results

use tokio::io::AsyncRead;

use super::codec::{Reader, Writer};
use super::packet::{
    REVISION_WITH_SERVER_DISPLAY_NAME, REVISION_WITH_SERVER_TIMEZONE, REVISION_WITH_VERSION_PATCH,
};
use crate::error::Result;

/// Negotiated connection metadata, populated by the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
    pub version_patch: u64,
}

impl ServerInfo {
    pub async fn read_from<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<Self> {
        let mut info = ServerInfo {
            name: rd.string().await?,
            version_major: rd.uvarint().await?,
            version_minor: rd.uvarint().await?,
            revision: rd.uvarint().await?,
            ..Default::default()
        };

        if info.revision >= REVISION_WITH_SERVER_TIMEZONE {
            info.timezone = Some(rd.string().await?);
        }
        if info.revision >= REVISION_WITH_SERVER_DISPLAY_NAME {
            info.display_name = Some(rd.string().await?);
        }
        if info.revision >= REVISION_WITH_VERSION_PATCH {
            info.version_patch = rd.uvarint().await?;
        }
        Ok(info)
    }

    /// Encode the hello body in server wire order.
    pub fn write_to(&self, wr: &mut Writer) {
        wr.string(&self.name);
        wr.uvarint(self.version_major);
        wr.uvarint(self.version_minor);
        wr.uvarint(self.revision);
        if self.revision >= REVISION_WITH_SERVER_TIMEZONE {
            wr.string(self.timezone.as_deref().unwrap_or_default());
        }
        if self.revision >= REVISION_WITH_SERVER_DISPLAY_NAME {
            wr.string(self.display_name.as_deref().unwrap_or_default());
        }
        if self.revision >= REVISION_WITH_VERSION_PATCH {
            wr.uvarint(self.version_patch);
        }
    }

    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version_major, self.version_minor, self.version_patch
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
}

impl Progress {
    pub async fn read_from<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<Self> {
        Ok(Self {
            rows: rd.uvarint().await?,
            bytes: rd.uvarint().await?,
            total_rows: rd.uvarint().await?,
            written_rows: rd.uvarint().await?,
            written_bytes: rd.uvarint().await?,
        })
    }

    pub fn write_to(&self, wr: &mut Writer) {
        wr.uvarint(self.rows);
        wr.uvarint(self.bytes);
        wr.uvarint(self.total_rows);
        wr.uvarint(self.written_rows);
        wr.uvarint(self.written_bytes);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

impl ProfileInfo {
    pub async fn read_from<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<Self> {
        Ok(Self {
            rows: rd.uvarint().await?,
            blocks: rd.uvarint().await?,
            bytes: rd.uvarint().await?,
            applied_limit: rd.bool().await?,
            rows_before_limit: rd.uvarint().await?,
            calculated_rows_before_limit: rd.bool().await?,
        })
    }

    pub fn write_to(&self, wr: &mut Writer) {
        wr.uvarint(self.rows);
        wr.uvarint(self.blocks);
        wr.uvarint(self.bytes);
        wr.bool(self.applied_limit);
        wr.uvarint(self.rows_before_limit);
        wr.bool(self.calculated_rows_before_limit);
    }
}

/// Column description of an external table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableColumns {
    pub table: String,
    pub description: String,
}

impl TableColumns {
    pub async fn read_from<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<Self> {
        Ok(Self {
            table: rd.string().await?,
            description: rd.string().await?,
        })
    }

    pub fn write_to(&self, wr: &mut Writer) {
        wr.string(&self.table);
        wr.string(&self.description);
    }
}
