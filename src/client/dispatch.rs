//! Server packet dispatch
//!
//! Every response is consumed by the same loop, [`dispatch`]. What differs
//! between operations is the [`PacketHandler`]: which packets it accepts,
//! where Data blocks are decoded to, and which packet ends the exchange.
//!
//! | Handler        | Data                      | Progress & co. | EndOfStream | Pong |
//! |----------------|---------------------------|----------------|-------------|------|
//! | `SampleBlock`  | done(block)               | continue       | rejected    | rejected |
//! | `DataBlocks`   | count rows, continue      | continue       | done        | rejected |
//! | `SinglePacket` | rejected                  | done           | done        | rejected |
//! | `PongReply`    | rejected                  | rejected       | done        | done |
//! | `StreamBlock`  | done(true)                | continue       | done(false) | rejected |
//! | `Drain`        | continue                  | continue       | done        | rejected |
//!
//! An Exception packet always ends the exchange with [`Error::Server`].

use tokio::io::AsyncRead;
use tracing::trace;

use crate::block::{read_block, Block};
use crate::error::{Error, Result};
use crate::protocol::{
    read_exception, ProfileInfo, Progress, Reader, ServerPacket, TableColumns,
};

use super::QueryResult;

/// What the dispatch loop does after a packet
#[derive(Debug, PartialEq, Eq)]
pub enum Step<T> {
    Continue,
    Done(T),
}

/// Per-packet policy for one kind of exchange.
///
/// Returning `None` rejects the packet, which fails the exchange with
/// [`Error::UnexpectedPacket`].
pub trait PacketHandler {
    type Output;

    /// Name reported in unexpected packet errors
    const CONTEXT: &'static str;

    /// Block that Data packets decode into; `None` rejects Data unread.
    fn data_block(&mut self) -> Option<&mut Block> {
        None
    }

    fn on_data(&mut self) -> Option<Step<Self::Output>> {
        None
    }

    fn on_progress(&mut self, _progress: &Progress) -> Option<Step<Self::Output>> {
        Some(Step::Continue)
    }

    fn on_profile_info(&mut self, _info: &ProfileInfo) -> Option<Step<Self::Output>> {
        Some(Step::Continue)
    }

    fn on_table_columns(&mut self, _columns: &TableColumns) -> Option<Step<Self::Output>> {
        Some(Step::Continue)
    }

    fn on_end_of_stream(&mut self) -> Option<Step<Self::Output>>;

    fn on_pong(&mut self) -> Option<Step<Self::Output>> {
        None
    }
}

/// Read packets until `handler` completes the exchange.
pub async fn dispatch<R, H>(
    rd: &mut Reader<R>,
    handler: &mut H,
    max_exception_depth: usize,
) -> Result<H::Output>
where
    R: AsyncRead + Unpin,
    H: PacketHandler,
{
    loop {
        let code = rd.uvarint().await?;
        let packet =
            ServerPacket::try_from(code).map_err(|code| Error::unexpected(H::CONTEXT, code))?;

        let step = match packet {
            ServerPacket::Data => match handler.data_block() {
                Some(block) => {
                    read_block(rd, block).await?;
                    handler.on_data()
                }
                None => None,
            },
            ServerPacket::Exception => {
                let exc = read_exception(rd, max_exception_depth).await?;
                return Err(Error::Server(exc));
            }
            ServerPacket::Progress => {
                let progress = Progress::read_from(rd).await?;
                trace!("{}: progress {:?}", H::CONTEXT, progress);
                handler.on_progress(&progress)
            }
            ServerPacket::ProfileInfo => {
                let info = ProfileInfo::read_from(rd).await?;
                trace!("{}: profile info {:?}", H::CONTEXT, info);
                handler.on_profile_info(&info)
            }
            ServerPacket::TableColumns => {
                let columns = TableColumns::read_from(rd).await?;
                trace!("{}: table columns {:?}", H::CONTEXT, columns);
                handler.on_table_columns(&columns)
            }
            ServerPacket::EndOfStream => handler.on_end_of_stream(),
            ServerPacket::Pong => handler.on_pong(),
            ServerPacket::Hello => None,
        };

        match step {
            Some(Step::Continue) => {}
            Some(Step::Done(out)) => return Ok(out),
            None => return Err(Error::unexpected(H::CONTEXT, code)),
        }
    }
}

/// First Data packet of an insert: the table's column layout.
#[derive(Debug, Default)]
pub struct SampleBlock {
    block: Block,
}

impl SampleBlock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketHandler for SampleBlock {
    type Output = Block;
    const CONTEXT: &'static str = "read_sample_block";

    fn data_block(&mut self) -> Option<&mut Block> {
        Some(&mut self.block)
    }

    fn on_data(&mut self) -> Option<Step<Block>> {
        Some(Step::Done(std::mem::take(&mut self.block)))
    }

    fn on_end_of_stream(&mut self) -> Option<Step<Block>> {
        None
    }
}

/// Sum row counts of every Data packet until EndOfStream. The result is
/// `None` when no Data packet arrived.
#[derive(Debug, Default)]
pub struct DataBlocks {
    scratch: Block,
    result: Option<QueryResult>,
}

impl DataBlocks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketHandler for DataBlocks {
    type Output = Option<QueryResult>;
    const CONTEXT: &'static str = "read_data_blocks";

    fn data_block(&mut self) -> Option<&mut Block> {
        Some(&mut self.scratch)
    }

    fn on_data(&mut self) -> Option<Step<Self::Output>> {
        let result = self.result.get_or_insert_with(QueryResult::default);
        result.affected += self.scratch.num_rows() as u64;
        Some(Step::Continue)
    }

    fn on_end_of_stream(&mut self) -> Option<Step<Self::Output>> {
        Some(Step::Done(self.result.take()))
    }
}

/// Accept exactly one acknowledgement packet and report which one it was.
#[derive(Debug, Default)]
pub struct SinglePacket;

impl PacketHandler for SinglePacket {
    type Output = ServerPacket;
    const CONTEXT: &'static str = "read_packet";

    fn on_progress(&mut self, _progress: &Progress) -> Option<Step<ServerPacket>> {
        Some(Step::Done(ServerPacket::Progress))
    }

    fn on_profile_info(&mut self, _info: &ProfileInfo) -> Option<Step<ServerPacket>> {
        Some(Step::Done(ServerPacket::ProfileInfo))
    }

    fn on_table_columns(&mut self, _columns: &TableColumns) -> Option<Step<ServerPacket>> {
        Some(Step::Done(ServerPacket::TableColumns))
    }

    fn on_end_of_stream(&mut self) -> Option<Step<ServerPacket>> {
        Some(Step::Done(ServerPacket::EndOfStream))
    }
}

#[derive(Debug, Default)]
pub struct PongReply;

impl PacketHandler for PongReply {
    type Output = ();
    const CONTEXT: &'static str = "read_pong";

    fn on_progress(&mut self, _progress: &Progress) -> Option<Step<()>> {
        None
    }

    fn on_profile_info(&mut self, _info: &ProfileInfo) -> Option<Step<()>> {
        None
    }

    fn on_table_columns(&mut self, _columns: &TableColumns) -> Option<Step<()>> {
        None
    }

    fn on_end_of_stream(&mut self) -> Option<Step<()>> {
        Some(Step::Done(()))
    }

    fn on_pong(&mut self) -> Option<Step<()>> {
        Some(Step::Done(()))
    }
}

/// Next block of a streamed result. Yields `false` at EndOfStream.
#[derive(Debug)]
pub struct StreamBlock<'a> {
    block: &'a mut Block,
}

impl<'a> StreamBlock<'a> {
    pub fn new(block: &'a mut Block) -> Self {
        Self { block }
    }
}

impl PacketHandler for StreamBlock<'_> {
    type Output = bool;
    const CONTEXT: &'static str = "read_stream_block";

    fn data_block(&mut self) -> Option<&mut Block> {
        Some(&mut *self.block)
    }

    fn on_data(&mut self) -> Option<Step<bool>> {
        Some(Step::Done(true))
    }

    fn on_end_of_stream(&mut self) -> Option<Step<bool>> {
        Some(Step::Done(false))
    }
}

/// Discard the rest of a response after a cancel.
#[derive(Debug, Default)]
pub struct Drain {
    scratch: Block,
}

impl Drain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketHandler for Drain {
    type Output = ();
    const CONTEXT: &'static str = "drain";

    fn data_block(&mut self) -> Option<&mut Block> {
        Some(&mut self.scratch)
    }

    fn on_data(&mut self) -> Option<Step<()>> {
        Some(Step::Continue)
    }

    fn on_end_of_stream(&mut self) -> Option<Step<()>> {
        Some(Step::Done(()))
    }
}
