use std::{
    fmt::{self, Display},
    io,
    sync::Arc,
    time::Duration,
};

use comms::msg::{Command, Msg};
use log::{debug, info};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{self, Instant},
};

use crate::{Config, Context, InitErr, communicator::Communicator, hub};

const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// The transports a process group can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Tcp,
}

impl Backend {
    /// Parses a backend name, ignoring case.
    pub fn parse(name: &str) -> Result<Self, InitErr> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            _ => Err(InitErr::UnsupportedBackend(name.to_string())),
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Tunables of the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    /// How long to wait for every rank to join.
    pub timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

/// Joins the process group with the default options, see `launch_with`.
pub async fn launch(
    config: Config,
    rank: usize,
    world_size: usize,
    host: &str,
    port: u16,
    backend: &str,
) -> Result<Arc<Context>, InitErr> {
    launch_with(
        config,
        rank,
        world_size,
        host,
        port,
        backend,
        LaunchOptions::default(),
    )
    .await
}

/// Joins the process group.
///
/// Rank 0 binds `host:port` and serves the rendezvous hub in the background. Every rank,
/// rank 0 included, then connects to the hub and waits until the whole world has joined.
///
/// # Arguments
/// * `config` - The job's configuration, validated later by whoever uses it.
/// * `rank` - This process' rank, in `[0, world_size)`.
/// * `world_size` - The amount of processes in the job.
/// * `host` - The hub's host.
/// * `port` - The hub's port.
/// * `backend` - The transport's name, only `tcp` is supported.
/// * `options` - Rendezvous tunables.
///
/// # Returns
/// The distributed context of this rank.
pub async fn launch_with(
    config: Config,
    rank: usize,
    world_size: usize,
    host: &str,
    port: u16,
    backend: &str,
    options: LaunchOptions,
) -> Result<Arc<Context>, InitErr> {
    let backend = Backend::parse(backend)?;

    if world_size == 0 || rank >= world_size {
        return Err(InitErr::InvalidRank { rank, world_size });
    }

    let addr = format!("{host}:{port}");
    let deadline = Instant::now() + options.timeout;

    let hub = if rank == 0 {
        let listener = TcpListener::bind(&addr).await.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => InitErr::PortInUse(addr.clone()),
            _ => InitErr::Io(e),
        })?;

        info!(world_size = world_size; "serving the rendezvous hub at {addr}");
        Some(tokio::spawn(hub::serve(listener, world_size, deadline)))
    } else {
        None
    };

    let joined = join(&addr, rank, world_size, deadline, options.timeout).await;

    let comm = match joined {
        Ok(comm) => comm,
        Err(e) => {
            if let Some(hub) = hub {
                hub.abort();
            }
            return Err(e);
        }
    };

    info!(rank = rank, world_size = world_size; "joined the process group over {backend}");
    Ok(Arc::new(Context::new(
        config, rank, world_size, backend, comm, hub,
    )))
}

async fn join(
    addr: &str,
    rank: usize,
    world_size: usize,
    deadline: Instant,
    timeout: Duration,
) -> Result<Communicator, InitErr> {
    let stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() + CONNECT_RETRY >= deadline => {
                debug!(rank = rank; "giving up connecting to {addr}: {e}");
                return Err(InitErr::Timeout(timeout));
            }
            Err(e) => {
                debug!(rank = rank; "hub not reachable yet: {e}");
                time::sleep(CONNECT_RETRY).await;
            }
        }
    };

    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx);

    tx.send(&Msg::Control(Command::Join { rank, world_size }))
        .await?;

    let mut buf: Vec<u32> = Vec::new();
    let reply = time::timeout_at(deadline, rx.recv_into(&mut buf))
        .await
        .map_err(|_| InitErr::Timeout(timeout))?;

    match reply {
        Ok(Msg::Control(Command::Welcome)) => {}
        Ok(Msg::Err(reason)) if reason == hub::RENDEZVOUS_TIMED_OUT => {
            return Err(InitErr::Timeout(timeout));
        }
        Ok(Msg::Err(reason)) => return Err(InitErr::Rejected(reason.into_owned())),
        Ok(msg) => {
            return Err(InitErr::Rejected(format!(
                "expected a welcome, got a {} message",
                msg.kind()
            )));
        }
        // The hub gives up on the same deadline and may drop us before our timer fires.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && Instant::now() >= deadline => {
            return Err(InitErr::Timeout(timeout));
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(InitErr::Rejected("the hub closed the connection".into()));
        }
        Err(e) => return Err(InitErr::Io(e)),
    }

    Ok(Communicator::new(rank, rx, tx))
}

/// Asks the OS for a currently free local port.
pub fn free_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_ignore_case() {
        assert_eq!(Backend::parse("TCP").unwrap(), Backend::Tcp);
        assert!(matches!(
            Backend::parse("nccl"),
            Err(InitErr::UnsupportedBackend(name)) if name == "nccl"
        ));
    }

    #[test]
    fn free_ports_are_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }
}
