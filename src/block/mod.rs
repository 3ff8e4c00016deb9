//! Columnar result blocks
//!
//! A Data packet carries a table name followed by one compressed region:
//!
//! ```text
//! block info:  1 | is_overflows: bool | 2 | bucket_num: i32 | 0
//! body:        num_columns | num_rows | (name | type | values)*
//! ```

pub mod column;

pub use column::ColumnData;

use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::protocol::codec::MAX_STRING_SIZE;
use crate::protocol::{Reader, Writer};

/// Every row takes at least one byte of a column payload.
const MAX_BLOCK_ROWS: usize = MAX_STRING_SIZE;
const MAX_BLOCK_COLUMNS: usize = 64 * 1024;

const BLOCK_INFO_IS_OVERFLOWS: u64 = 1;
const BLOCK_INFO_BUCKET_NUM: u64 = 2;
const BLOCK_INFO_END: u64 = 0;

/// A named, typed column of a block
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    type_name: String,
    data: ColumnData,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    pub fn into_data(self) -> ColumnData {
        self.data
    }
}

/// One columnar chunk of a result set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    num_rows: usize,
    columns: Vec<Column>,
}

impl Block {
    pub const fn new() -> Self {
        Self {
            num_rows: 0,
            columns: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Append a column. The first column fixes the row count.
    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        data: ColumnData,
    ) -> Result<()> {
        let name = name.into();
        let type_name = type_name.into();

        if name.is_empty() {
            return Err(Error::InvalidBlock("column has empty name".to_string()));
        }
        if type_name.is_empty() {
            return Err(Error::InvalidBlock(format!("column={} has empty type", name)));
        }
        if !data.matches_type(&type_name) {
            return Err(Error::InvalidBlock(format!(
                "column={} data does not match type {}",
                name, type_name
            )));
        }
        if let ColumnData::FixedString { width, values } = &data {
            if let Some(value) = values.iter().find(|v| v.len() > *width) {
                return Err(Error::InvalidBlock(format!(
                    "column={} value of {} bytes does not fit FixedString({})",
                    name,
                    value.len(),
                    width
                )));
            }
        }
        if self.columns.is_empty() {
            self.num_rows = data.len();
        } else if data.len() != self.num_rows {
            return Err(Error::InvalidBlock(format!(
                "column={} has {} rows, block has {}",
                name,
                data.len(),
                self.num_rows
            )));
        }

        self.columns.push(Column {
            name,
            type_name,
            data,
        });
        Ok(())
    }

    pub fn reset(&mut self) {
        self.num_rows = 0;
        self.columns.clear();
    }

    /// Encode the block body (counts and columns).
    pub fn write_to(&self, wr: &mut Writer) {
        wr.uvarint(self.columns.len() as u64);
        wr.uvarint(self.num_rows as u64);
        for column in &self.columns {
            wr.string(&column.name);
            wr.string(&column.type_name);
            column.data.write_to(wr);
        }
    }

    async fn read_body<R: AsyncRead + Unpin>(&mut self, rd: &mut Reader<R>) -> Result<()> {
        let num_columns = to_usize(rd.uvarint().await?, "column count", MAX_BLOCK_COLUMNS)?;
        let num_rows = to_usize(rd.uvarint().await?, "row count", MAX_BLOCK_ROWS)?;

        self.reset();
        self.num_rows = num_rows;
        self.columns.reserve(num_columns.min(64));

        for _ in 0..num_columns {
            let name = rd.string().await?;
            if name.is_empty() {
                return Err(Error::EmptyColumnName);
            }

            let type_name = rd.string().await?;
            if type_name.is_empty() {
                return Err(Error::EmptyColumnType(name));
            }

            let mut data = ColumnData::for_type(&type_name)?;
            data.read_from(rd, num_rows).await?;
            self.columns.push(Column {
                name,
                type_name,
                data,
            });
        }
        Ok(())
    }
}

fn to_usize(value: u64, what: &str, max: usize) -> Result<usize> {
    usize::try_from(value)
        .ok()
        .filter(|n| *n <= max)
        .ok_or_else(|| {
            Error::Protocol(format!("block {} {} exceeds the limit of {}", what, value, max))
        })
}

pub fn write_block_info(wr: &mut Writer) {
    wr.uvarint(BLOCK_INFO_IS_OVERFLOWS);
    wr.bool(false);

    wr.uvarint(BLOCK_INFO_BUCKET_NUM);
    wr.i32(-1);

    wr.uvarint(BLOCK_INFO_END);
}

pub async fn read_block_info<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<()> {
    expect_field(rd, BLOCK_INFO_IS_OVERFLOWS).await?;
    rd.bool().await?;

    expect_field(rd, BLOCK_INFO_BUCKET_NUM).await?;
    rd.i32().await?;

    expect_field(rd, BLOCK_INFO_END).await
}

async fn expect_field<R: AsyncRead + Unpin>(rd: &mut Reader<R>, expected: u64) -> Result<()> {
    let field = rd.uvarint().await?;
    if field != expected {
        return Err(Error::Protocol(format!(
            "malformed block info: field {} where {} was expected",
            field, expected
        )));
    }
    Ok(())
}

/// Encode a Data packet payload: empty table name, then block info and body
/// inside one compression region.
pub fn write_data_payload(wr: &mut Writer, block: &Block) {
    wr.string("");
    wr.with_compression(|wr| {
        write_block_info(wr);
        block.write_to(wr);
    });
}

/// Decode a Data packet payload into `block`, replacing its contents.
pub async fn read_block<R: AsyncRead + Unpin>(rd: &mut Reader<R>, block: &mut Block) -> Result<()> {
    rd.string().await?;

    rd.begin_compressed();
    let res = read_compressed_block(rd, block).await;
    rd.end_compressed();
    res
}

async fn read_compressed_block<R: AsyncRead + Unpin>(
    rd: &mut Reader<R>,
    block: &mut Block,
) -> Result<()> {
    read_block_info(rd).await?;
    block.read_body(rd).await
}
