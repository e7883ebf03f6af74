//! Dispatcher event loop.
//!
//! Runs on a current-thread runtime. One task owns the [`Coordinator`];
//! every connection gets a reader task that frames words into [`Event`]s
//! and a writer task fed by its own unbounded channel, so a client that
//! stops reading never holds up the owner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::coordinator::{ConnId, Coordinator, Event, ShadowFiles};
use crate::ipc::protocol::{self, Command};
use crate::ipc::shmem::{DiscoveryBlock, SharedSegment};
use crate::{DispatchError, Result};

/// Time allowed for queued replies to drain at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A bound dispatcher, ready to run.
pub struct DispatchServer {
    config: DispatcherConfig,
    coordinator: Coordinator,
    listener: UnixListener,
    socket_path: PathBuf,
    segment: Option<SharedSegment>,
}

impl DispatchServer {
    /// Recover the controlled files, publish the discovery segment and
    /// bind the socket.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let files = ShadowFiles::new(
            &config.db_dir,
            config.shadow_name(),
            &config.controlled_files,
        );
        let coordinator = Coordinator::new(files, config.limits())?;

        let socket_path = config.socket_path();
        if socket_path.exists() {
            warn!("Removing stale socket {}", socket_path.display());
            std::fs::remove_file(&socket_path)
                .map_err(DispatchError::io("remove_socket", &socket_path))?;
        }
        let listener =
            UnixListener::bind(&socket_path).map_err(DispatchError::io("bind", &socket_path))?;

        let discovery = DiscoveryBlock {
            db_dir: config.db_dir.clone(),
            shadow_name: config.shadow_name(),
        };
        let segment = match SharedSegment::publish(&config.shared_name, &discovery) {
            Ok(segment) => Some(segment),
            Err(e) => {
                warn!("Discovery segment unavailable, clients must use the socket path: {e}");
                None
            }
        };

        info!("Dispatcher listening on {}", socket_path.display());
        Ok(Self {
            config,
            coordinator,
            listener,
            socket_path,
            segment,
        })
    }

    /// Socket clients connect to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the discovery segment was published.
    pub const fn is_discoverable(&self) -> bool {
        self.segment.is_some()
    }

    /// Serve until a client sends `TERMINATE`.
    pub async fn run(mut self) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let mut outbound: HashMap<ConnId, mpsc::UnboundedSender<Vec<u32>>> = HashMap::new();
        let mut writers: Vec<JoinHandle<()>> = Vec::new();
        let mut next_conn: ConnId = 1;
        let mut tick = tokio::time::interval(self.config.purge_interval());

        while !self.coordinator.should_terminate() {
            let event = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let conn = next_conn;
                        next_conn += 1;
                        let (read_half, write_half) = stream.into_split();
                        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
                        outbound.insert(conn, reply_tx);
                        tokio::spawn(read_loop(conn, read_half, event_tx.clone()));
                        writers.push(tokio::spawn(write_loop(conn, write_half, reply_rx)));
                        debug!("Accepted connection {conn}");
                        Event::Connected(conn)
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                },
                Some(event) = event_rx.recv() => event,
                _ = tick.tick() => Event::Tick,
            };

            let closed = match event {
                Event::Disconnected(conn) => Some(conn),
                _ => None,
            };
            for reply in self.coordinator.handle(event, unix_now()) {
                if let Some(tx) = outbound.get(&reply.conn) {
                    // A closed channel means the client is already gone.
                    let _ = tx.send(reply.words);
                }
            }
            if let Some(conn) = closed {
                outbound.remove(&conn);
            }
            writers.retain(|handle| !handle.is_finished());
        }

        info!("Dispatcher shutting down");
        drop(outbound);
        for handle in writers {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("Could not remove socket {}: {e}", self.socket_path.display());
        }
        Ok(())
    }
}

async fn read_loop(conn: ConnId, mut stream: OwnedReadHalf, events: mpsc::UnboundedSender<Event>) {
    if let Ok(pid) = stream.read_u32_le().await {
        if events.send(Event::Identified { conn, pid }).is_err() {
            return;
        }
        while let Some(command) = read_command(conn, &mut stream).await {
            if events.send(Event::Message { conn, command }).is_err() {
                return;
            }
        }
    }
    let _ = events.send(Event::Disconnected(conn));
}

/// Next well-formed command; unknown opcodes are skipped. `None` on EOF.
async fn read_command(conn: ConnId, stream: &mut OwnedReadHalf) -> Option<Command> {
    loop {
        let opcode = stream.read_u32_le().await.ok()?;
        let Some(count) = protocol::arg_count(opcode) else {
            debug!("Connection {conn}: ignoring unknown opcode {opcode}");
            continue;
        };
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(stream.read_u32_le().await.ok()?);
        }
        if let Some(command) = Command::decode(opcode, &args) {
            return Some(command);
        }
    }
}

async fn write_loop(
    conn: ConnId,
    mut stream: OwnedWriteHalf,
    mut replies: mpsc::UnboundedReceiver<Vec<u32>>,
) {
    while let Some(words) = replies.recv().await {
        if let Err(e) = stream.write_all(&protocol::to_bytes(&words)).await {
            debug!("Connection {conn}: reply dropped: {e}");
            return;
        }
    }
    let _ = stream.shutdown().await;
}
