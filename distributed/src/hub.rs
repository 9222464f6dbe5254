//! The rendezvous hub, run by rank 0 for the whole life of the job.
//!
//! The hub first waits for every rank to join, then reduces the contributions of every
//! collective call and sends back the result, and finally releases the ranks once all of
//! them have left.

use std::{borrow::Cow, collections::BTreeMap, collections::HashMap, io};

use comms::{
    FrameReceiver, FrameSender,
    msg::{CollectiveHeader, Command, Msg, Payload, Reduction},
};
use log::{debug, info, warn};
use tokio::{
    net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinSet,
    time::{self, Instant},
};

type Rx = FrameReceiver<OwnedReadHalf>;
type Tx = FrameSender<OwnedWriteHalf>;

/// The reason sent to the ranks that already joined when the rendezvous deadline passes.
pub(crate) const RENDEZVOUS_TIMED_OUT: &str = "rendezvous timed out";

/// What a rank's connection produced, as seen by the hub's main loop.
enum Event {
    Contribution {
        header: CollectiveHeader,
        data: Vec<f32>,
    },
    Leave,
    Invalid(String),
    Closed(String),
}

/// The contributions received so far for one collective call.
struct Pending {
    header: CollectiveHeader,
    parts: BTreeMap<usize, Vec<f32>>,
    error: Option<String>,
}

impl Pending {
    fn new(header: CollectiveHeader) -> Self {
        Self {
            header,
            parts: BTreeMap::new(),
            error: None,
        }
    }

    fn add(&mut self, rank: usize, header: CollectiveHeader, data: Vec<f32>) {
        let CollectiveHeader { group, seq, .. } = self.header;

        if header != self.header && self.error.is_none() {
            self.error = Some(format!(
                "rank {rank} called collective {group}/{seq} as {header:?}, others as {:?}",
                self.header
            ));
        }

        if self.parts.insert(rank, data).is_some() && self.error.is_none() {
            self.error = Some(format!("rank {rank} contributed twice to {group}/{seq}"));
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() >= self.header.size as usize
    }

    /// Combines the contributions, always in rank order so every member gets the same bits.
    fn reduce(&self) -> Result<Vec<f32>, String> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }

        let CollectiveHeader { group, seq, .. } = self.header;
        let len = self.parts.values().next().map(Vec::len).unwrap_or_default();

        if let Some((rank, part)) = self.parts.iter().find(|(_, part)| part.len() != len) {
            return Err(format!(
                "rank {rank} sent {} values to {group}/{seq}, others sent {len}",
                part.len()
            ));
        }

        let fold = |init: f32, f: fn(f32, f32) -> f32| {
            (0..len)
                .map(|i| self.parts.values().fold(init, |acc, part| f(acc, part[i])))
                .collect::<Vec<_>>()
        };

        let reduced = match self.header.reduction {
            Reduction::Sum => fold(0., |a, b| a + b),
            Reduction::Avg => {
                let n = self.parts.len() as f32;
                fold(0., |a, b| a + b).into_iter().map(|v| v / n).collect()
            }
            Reduction::Max => fold(f32::NEG_INFINITY, |a, b| nan_or(a, b, f32::max)),
            Reduction::Min => fold(f32::INFINITY, |a, b| nan_or(a, b, f32::min)),
            Reduction::Broadcast { root } => self
                .parts
                .get(&(root as usize))
                .cloned()
                .ok_or_else(|| format!("root {root} isn't part of {group}/{seq}"))?,
        };

        Ok(reduced)
    }
}

/// Applies `f` unless either side is NaN, `f32::max` and `f32::min` would drop it.
fn nan_or(a: f32, b: f32, f: fn(f32, f32) -> f32) -> f32 {
    if a.is_nan() || b.is_nan() { f32::NAN } else { f(a, b) }
}

/// The hub's side of an established process group.
struct Hub {
    txs: Vec<Option<Tx>>,
    events: mpsc::UnboundedReceiver<(usize, Event)>,
    readers: JoinSet<()>,
    pending: HashMap<(u32, u32), Pending>,
    left: Vec<bool>,
    poisoned: Option<String>,
}

/// Runs the hub to completion on an already bound listener.
///
/// # Arguments
/// * `listener` - The rendezvous listener.
/// * `world_size` - The amount of ranks expected to join.
/// * `deadline` - When to give up waiting for joins.
pub(crate) async fn serve(
    listener: TcpListener,
    world_size: usize,
    deadline: Instant,
) -> io::Result<()> {
    let conns = rendezvous(&listener, world_size, deadline).await?;
    drop(listener);

    let mut hub = Hub::new(conns);
    hub.welcome().await?;
    hub.run().await
}

async fn rendezvous(
    listener: &TcpListener,
    world_size: usize,
    deadline: Instant,
) -> io::Result<Vec<(Rx, Tx)>> {
    let mut joined: Vec<Option<(Rx, Tx)>> = (0..world_size).map(|_| None).collect();
    let mut count = 0;
    let mut buf: Vec<u32> = Vec::new();

    while count < world_size {
        let Ok(accepted) = time::timeout_at(deadline, listener.accept()).await else {
            return abandon(&mut joined).await;
        };
        let (stream, addr) = accepted?;

        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);

        let Ok(msg) = time::timeout_at(deadline, rx.recv_into(&mut buf)).await else {
            return abandon(&mut joined).await;
        };

        let verdict = match msg {
            Ok(Msg::Control(Command::Join {
                rank,
                world_size: theirs,
            })) => {
                if theirs != world_size {
                    Err(format!(
                        "rank {rank} expects a world of size {theirs}, this job has {world_size}"
                    ))
                } else if rank >= world_size {
                    Err(format!("rank {rank} is out of range"))
                } else if joined[rank].is_some() {
                    Err(format!("rank {rank} already joined"))
                } else {
                    Ok(rank)
                }
            }
            Ok(msg) => Err(format!("expected a join, got a {} message", msg.kind())),
            Err(e) => {
                warn!("dropping connection from {addr}: {e}");
                continue;
            }
        };

        match verdict {
            Ok(rank) => {
                debug!(rank = rank; "rank joined from {addr}");
                joined[rank] = Some((rx, tx));
                count += 1;
            }
            Err(reason) => {
                warn!("rejecting connection from {addr}: {reason}");
                let msg = Msg::Err(Cow::Owned(reason));

                if let Err(e) = tx.send(&msg).await {
                    warn!("failed to notify {addr} of its rejection: {e}");
                }
            }
        }
    }

    info!(world_size = world_size; "every rank joined");
    Ok(joined.into_iter().flatten().collect())
}

/// Tells every rank that already joined that the rendezvous timed out.
async fn abandon<T>(joined: &mut [Option<(Rx, Tx)>]) -> io::Result<T> {
    let msg = Msg::Err(Cow::Borrowed(RENDEZVOUS_TIMED_OUT));

    for (rank, (_, tx)) in joined
        .iter_mut()
        .enumerate()
        .filter_map(|(rank, conn)| conn.as_mut().map(|conn| (rank, conn)))
    {
        if let Err(e) = tx.send(&msg).await {
            warn!(rank = rank; "failed to notify the rendezvous timeout: {e}");
        }
    }

    Err(io::Error::new(io::ErrorKind::TimedOut, RENDEZVOUS_TIMED_OUT))
}

impl Hub {
    fn new(conns: Vec<(Rx, Tx)>) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut readers = JoinSet::new();
        let mut txs = Vec::with_capacity(conns.len());

        for (rank, (rx, tx)) in conns.into_iter().enumerate() {
            readers.spawn(Self::read(rank, rx, events_tx.clone()));
            txs.push(Some(tx));
        }

        Self {
            left: vec![false; txs.len()],
            txs,
            events,
            readers,
            pending: HashMap::new(),
            poisoned: None,
        }
    }

    /// Forwards everything a rank sends to the main loop until it leaves or disconnects.
    async fn read(rank: usize, mut rx: Rx, events: mpsc::UnboundedSender<(usize, Event)>) {
        let mut buf: Vec<u32> = Vec::new();

        loop {
            let event = match rx.recv_into(&mut buf).await {
                Ok(Msg::Data(Payload::Contribution { header, data })) => Event::Contribution {
                    header,
                    data: data.to_vec(),
                },
                Ok(Msg::Control(Command::Leave)) => Event::Leave,
                Ok(msg) => Event::Invalid(format!("unexpected {} message", msg.kind())),
                Err(e) => Event::Closed(e.to_string()),
            };

            let done = matches!(event, Event::Leave | Event::Closed(_));
            if events.send((rank, event)).is_err() || done {
                break;
            }
        }
    }

    async fn welcome(&mut self) -> io::Result<()> {
        let msg = Msg::Control(Command::Welcome);

        for tx in self.txs.iter_mut().flatten() {
            tx.send(&msg).await?;
        }

        Ok(())
    }

    async fn run(&mut self) -> io::Result<()> {
        let world_size = self.txs.len();
        let mut done = 0;

        while done < world_size {
            let Some((rank, event)) = self.events.recv().await else {
                break;
            };

            match event {
                Event::Contribution { header, data } => self.contribute(rank, header, data).await,
                Event::Leave => {
                    debug!(rank = rank; "rank left");
                    self.left[rank] = true;
                    done += 1;
                }
                Event::Invalid(reason) => {
                    warn!(rank = rank; "protocol violation: {reason}");
                    self.send(rank, &Msg::Err(Cow::Owned(reason))).await;
                }
                Event::Closed(reason) => {
                    warn!(rank = rank; "connection lost before leaving: {reason}");
                    self.txs[rank] = None;
                    self.poison(format!("rank {rank} disconnected")).await;
                    done += 1;
                }
            }
        }

        let msg = Msg::Control(Command::Disconnect);
        for rank in 0..world_size {
            if self.left[rank] {
                self.send(rank, &msg).await;
            }
        }

        self.readers.shutdown().await;
        info!("every rank left, hub finished");
        Ok(())
    }

    async fn contribute(&mut self, rank: usize, header: CollectiveHeader, data: Vec<f32>) {
        if let Some(reason) = self.poisoned.clone() {
            self.send(rank, &Msg::Err(Cow::Owned(reason))).await;
            return;
        }

        let key = (header.group, header.seq);
        let pending = self
            .pending
            .entry(key)
            .or_insert_with(|| Pending::new(header));

        pending.add(rank, header, data);

        if !pending.is_complete() {
            return;
        }

        let Some(pending) = self.pending.remove(&key) else {
            return;
        };

        let outcome = pending.reduce();
        if let Err(reason) = &outcome {
            warn!(group = key.0, seq = key.1; "collective failed: {reason}");
        }

        for &member in pending.parts.keys() {
            let msg = match &outcome {
                Ok(data) => Msg::Data(Payload::Result {
                    header: pending.header,
                    data,
                }),
                Err(reason) => Msg::Err(Cow::Borrowed(reason)),
            };

            self.send(member, &msg).await;
        }
    }

    /// Fails every collective in flight, and every later one, after a rank is lost.
    ///
    /// Otherwise the members left would wait forever for the lost rank's contribution.
    async fn poison(&mut self, reason: String) {
        let pending: Vec<_> = self.pending.drain().map(|(_, p)| p).collect();
        let msg = Msg::Err(Cow::Borrowed(&reason));

        for p in &pending {
            for &member in p.parts.keys() {
                self.send(member, &msg).await;
            }
        }

        self.poisoned.get_or_insert(reason);
    }

    async fn send(&mut self, rank: usize, msg: &Msg<'_>) {
        let Some(tx) = self.txs[rank].as_mut() else {
            return;
        };

        if let Err(e) = tx.send(msg).await {
            warn!(rank = rank; "failed to send a {} message: {e}", msg.kind());
            self.txs[rank] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(reduction: Reduction) -> CollectiveHeader {
        CollectiveHeader {
            group: 1,
            seq: 0,
            size: 3,
            reduction,
        }
    }

    fn pending(reduction: Reduction, parts: &[&[f32]]) -> Pending {
        let header = header(reduction);
        let mut pending = Pending::new(header);

        for (rank, part) in parts.iter().enumerate() {
            pending.add(rank, header, part.to_vec());
        }

        pending
    }

    #[test]
    fn reductions_combine_elementwise() {
        let parts: &[&[f32]] = &[&[1.0, 5.0], &[2.0, -1.0], &[3.0, 2.0]];

        assert_eq!(pending(Reduction::Sum, parts).reduce(), Ok(vec![6.0, 6.0]));
        assert_eq!(pending(Reduction::Avg, parts).reduce(), Ok(vec![2.0, 2.0]));
        assert_eq!(pending(Reduction::Max, parts).reduce(), Ok(vec![3.0, 5.0]));
        assert_eq!(pending(Reduction::Min, parts).reduce(), Ok(vec![1.0, -1.0]));
        assert_eq!(
            pending(Reduction::Broadcast { root: 1 }, parts).reduce(),
            Ok(vec![2.0, -1.0])
        );
    }

    #[test]
    fn extrema_keep_nan() {
        let parts: &[&[f32]] = &[&[1.0, 2.0], &[f32::NAN, 3.0], &[0.0, 1.0]];

        for reduction in [Reduction::Max, Reduction::Min] {
            let reduced = pending(reduction, parts).reduce().unwrap();
            assert!(reduced[0].is_nan());
            assert!(!reduced[1].is_nan());
        }
    }

    #[test]
    fn length_mismatch_fails_the_call() {
        let p = pending(Reduction::Sum, &[&[1.0], &[1.0, 2.0], &[1.0]]);

        assert!(p.is_complete());
        assert!(p.reduce().is_err());
    }

    #[test]
    fn operation_mismatch_fails_the_call() {
        let mut p = Pending::new(header(Reduction::Sum));
        p.add(0, header(Reduction::Sum), vec![1.0]);
        p.add(1, header(Reduction::Max), vec![1.0]);
        p.add(2, header(Reduction::Sum), vec![1.0]);

        assert!(p.reduce().is_err());
    }

    #[test]
    fn waits_for_every_member() {
        let p = pending(Reduction::Sum, &[&[1.0], &[1.0]]);
        assert!(!p.is_complete());
    }
}
