use std::{collections::HashMap, io};

use comms::{
    FrameReceiver, FrameSender,
    msg::{CollectiveHeader, Command, Msg, Payload, Reduction},
};
use log::debug;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{DistErr, Group, Result};

/// A rank's connection to the hub.
///
/// A rank has at most one collective in flight, so the next frame from the hub after a
/// contribution is always the outcome of that same call.
pub(crate) struct Communicator {
    rank: usize,
    rx: FrameReceiver<OwnedReadHalf>,
    tx: FrameSender<OwnedWriteHalf>,
    buf: Vec<u32>,
    seqs: HashMap<u32, u32>,
}

impl Communicator {
    pub(crate) fn new(
        rank: usize,
        rx: FrameReceiver<OwnedReadHalf>,
        tx: FrameSender<OwnedWriteHalf>,
    ) -> Self {
        Self {
            rank,
            rx,
            tx,
            buf: Vec::new(),
            seqs: HashMap::new(),
        }
    }

    /// Runs one collective call over `group`, replacing `data` with its outcome.
    ///
    /// # Arguments
    /// * `group` - The participating ranks, this rank among them.
    /// * `data` - This rank's contribution, overwritten with the result.
    /// * `reduction` - How the contributions are combined.
    pub(crate) async fn collective(
        &mut self,
        group: &Group,
        data: &mut [f32],
        reduction: Reduction,
    ) -> Result<()> {
        let seq = self.seqs.entry(group.id()).or_default();
        let header = CollectiveHeader {
            group: group.id(),
            seq: *seq,
            size: group.size() as u32,
            reduction,
        };
        *seq = seq.wrapping_add(1);

        let msg = Msg::Data(Payload::Contribution {
            header,
            data: &*data,
        });
        self.tx.send(&msg).await?;

        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Data(Payload::Result {
                header: got,
                data: result,
            }) if got.group == header.group && got.seq == header.seq => {
                if result.len() != data.len() {
                    return Err(DistErr::Collective(format!(
                        "expected {} values back, got {}",
                        data.len(),
                        result.len()
                    )));
                }

                data.copy_from_slice(result);
                Ok(())
            }
            Msg::Err(detail) => Err(DistErr::Collective(detail.into_owned())),
            msg => Err(DistErr::Collective(format!(
                "expected the result of {}/{}, got a {} message",
                header.group,
                header.seq,
                msg.kind()
            ))),
        }
    }

    /// Leaves the process group, waiting until every other rank left as well.
    pub(crate) async fn leave(&mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Leave)).await?;
        debug!(rank = self.rank; "waiting for the hub to release the group");

        loop {
            match self.rx.recv_into(&mut self.buf).await? {
                Msg::Control(Command::Disconnect) => break,
                Msg::Err(detail) => return Err(DistErr::Collective(detail.into_owned())),
                msg => {
                    return Err(DistErr::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("expected a disconnect, got a {} message", msg.kind()),
                    )));
                }
            }
        }

        self.tx.shutdown().await?;
        Ok(())
    }
}
