//! Single-writer, multi-reader transaction coordinator.
//!
//! [`Coordinator`] is a synchronous state machine. The server feeds it
//! [`Event`]s in arrival order and delivers the [`Reply`]s it returns;
//! nothing in here blocks or touches a socket. Connections, pids and
//! readers are tracked in plain maps keyed by id:
//!
//! - connection id to pid, filled by the pid handshake
//! - pid to connection id, used to answer a deferred commit
//! - pid to reader entry, inside the [`ResourceGovernor`]
//! - pid to pinned index version, inside [`VersionPins`]
//!
//! A disconnect removes the pid from all of them in one step.

pub mod footprint;
pub mod shadow;
pub mod status;

pub use footprint::{Footprint, VersionPins};
pub use shadow::{Recovery, ShadowFiles};

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use crate::config::GovernorLimits;
use crate::governor::{Admission, ResourceGovernor};
use crate::ipc::protocol::{self, Command};
use crate::{DispatchError, Result};

/// Server-assigned connection id.
pub type ConnId = u64;

/// Input to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A client connected.
    Connected(ConnId),
    /// The client sent its pid.
    Identified {
        /// Connection.
        conn: ConnId,
        /// Client process.
        pid: u32,
    },
    /// A complete command arrived.
    Message {
        /// Connection.
        conn: ConnId,
        /// Decoded command.
        command: Command,
    },
    /// The connection reached EOF or failed.
    Disconnected(ConnId),
    /// Periodic liveness and statistics tick.
    Tick,
}

/// Words to send on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Target connection.
    pub conn: ConnId,
    /// Reply words.
    pub words: Vec<u32>,
}

impl Reply {
    fn new(conn: ConnId, words: Vec<u32>) -> Vec<Self> {
        vec![Self { conn, words }]
    }
}

/// Phase of an admitted reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Admitted, still loading index files.
    ReadingIndex,
    /// Index released, reading data.
    Reading,
}

impl ReaderState {
    /// Label used in the status dump.
    pub const fn label(self) -> &'static str {
        match self {
            Self::ReadingIndex => "reading_index",
            Self::Reading => "reading",
        }
    }
}

/// Coordinator state.
#[derive(Debug)]
pub struct Coordinator {
    files: ShadowFiles,
    governor: ResourceGovernor,
    pins: VersionPins,
    pid_by_conn: BTreeMap<ConnId, Option<u32>>,
    conn_by_pid: BTreeMap<u32, ConnId>,
    reading_idx: BTreeSet<u32>,
    writer: Option<u32>,
    pending_commit: bool,
    reads_started: u64,
    reads_finished: u64,
    terminate: bool,
}

impl Coordinator {
    /// Recover the controlled files, then start with no clients.
    pub fn new(files: ShadowFiles, limits: GovernorLimits) -> Result<Self> {
        let recovery = files.recover()?;
        let footprint = files.footprint()?;
        info!(
            "Coordinator ready in {} ({recovery:?})",
            files.db_dir().display()
        );
        Ok(Self {
            files,
            governor: ResourceGovernor::new(limits),
            pins: VersionPins::new(Some(footprint)),
            pid_by_conn: BTreeMap::new(),
            conn_by_pid: BTreeMap::new(),
            reading_idx: BTreeSet::new(),
            writer: None,
            pending_commit: false,
            reads_started: 0,
            reads_finished: 0,
            terminate: false,
        })
    }

    /// Controlled files.
    pub const fn files(&self) -> &ShadowFiles {
        &self.files
    }

    /// Admission state.
    pub const fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    /// Index versions readers still hold.
    pub const fn pins(&self) -> &VersionPins {
        &self.pins
    }

    /// Pid of the writer holding the lock.
    pub const fn writer(&self) -> Option<u32> {
        self.writer
    }

    /// Whether a commit waits for readers to release the index.
    pub const fn pending_commit(&self) -> bool {
        self.pending_commit
    }

    /// Connections that sent their pid.
    pub fn connection_count(&self) -> usize {
        self.conn_by_pid.len()
    }

    /// Connections still waiting for the pid handshake.
    pub fn unidentified_count(&self) -> usize {
        self.pid_by_conn.values().filter(|pid| pid.is_none()).count()
    }

    /// Admissions granted so far, including aborted reads.
    pub const fn reads_started(&self) -> u64 {
        self.reads_started
    }

    /// Reads that signalled completion.
    pub const fn reads_finished(&self) -> u64 {
        self.reads_finished
    }

    /// Whether `TERMINATE` was received.
    pub const fn should_terminate(&self) -> bool {
        self.terminate
    }

    /// Phase of reader `pid`, if admitted.
    pub fn reader_state(&self, pid: u32) -> Option<ReaderState> {
        if !self.governor.is_active(pid) {
            None
        } else if self.reading_idx.contains(&pid) {
            Some(ReaderState::ReadingIndex)
        } else {
            Some(ReaderState::Reading)
        }
    }

    /// Apply one event at unix time `now`.
    pub fn handle(&mut self, event: Event, now: u64) -> Vec<Reply> {
        match event {
            Event::Connected(conn) => {
                self.pid_by_conn.insert(conn, None);
                Vec::new()
            }
            Event::Identified { conn, pid } => {
                debug!("Connection {conn} belongs to pid {pid}");
                self.pid_by_conn.insert(conn, Some(pid));
                self.conn_by_pid.insert(pid, conn);
                Vec::new()
            }
            Event::Message { conn, command } => {
                let Some(pid) = self.pid_by_conn.get(&conn).copied().flatten() else {
                    debug!("Ignoring command on connection {conn} before its pid");
                    return Vec::new();
                };
                self.command(conn, pid, command, now)
            }
            Event::Disconnected(conn) => self.disconnect(conn, now),
            Event::Tick => {
                self.governor.tick(now);
                self.purge(now)
            }
        }
    }

    fn command(&mut self, conn: ConnId, pid: u32, command: Command, now: u64) -> Vec<Reply> {
        debug!("pid {pid}: {command:?}");
        match command {
            Command::Terminate => {
                info!("Terminate requested by pid {pid}");
                self.terminate = true;
                Reply::new(conn, vec![protocol::TERMINATE])
            }
            Command::OutputStatus => {
                let word = match status::write(self, now) {
                    Ok(path) => {
                        debug!("Status written to {}", path.display());
                        protocol::OUTPUT_STATUS
                    }
                    Err(e) => {
                        warn!("Status dump failed: {e}");
                        0
                    }
                };
                Reply::new(conn, vec![word])
            }
            Command::WriteStart => Reply::new(conn, vec![self.write_start(pid)]),
            Command::WriteCommit => self.write_commit(conn, pid),
            Command::WriteRollback => {
                self.write_rollback(pid);
                Reply::new(conn, vec![protocol::WRITE_ROLLBACK])
            }
            Command::Hangup => {
                let mut replies = Reply::new(conn, vec![protocol::READ_ABORTED]);
                replies.extend(self.read_aborted(pid, now));
                replies
            }
            Command::ReadFinished => {
                if self.governor.remove(pid, now).is_some() {
                    self.reads_finished += 1;
                }
                self.release_reader(pid);
                let mut replies = Reply::new(conn, vec![protocol::READ_FINISHED]);
                replies.extend(self.try_pending_commit());
                replies
            }
            Command::ReadIdxFinished => {
                self.reading_idx.remove(&pid);
                let mut replies = Reply::new(conn, vec![protocol::READ_IDX_FINISHED]);
                replies.extend(self.try_pending_commit());
                replies
            }
            Command::RequestReadAndIdx {
                max_time,
                max_space,
                token,
            } => {
                let admission = if self.pending_commit || !self.refresh_footprint() {
                    Admission::NotYet
                } else {
                    let was_active = self.governor.is_active(pid);
                    let admission = self.governor.probe(pid, token, max_time, max_space, now);
                    if admission == Admission::Granted && !was_active {
                        self.pins.pin(pid);
                        self.reading_idx.insert(pid);
                        self.reads_started += 1;
                    }
                    admission
                };
                Reply::new(conn, vec![admission.reply_word()])
            }
            Command::Purge { pid: target } => {
                let mut replies = Reply::new(conn, vec![protocol::PURGE]);
                replies.extend(self.read_aborted(target, now));
                replies
            }
            Command::QueryByToken { token } => Reply::new(
                conn,
                vec![self.governor.query_by_token(token).unwrap_or(0)],
            ),
            Command::QueryMyStatus { token } => Reply::new(
                conn,
                protocol::encode_token_status(&self.governor.status_for_token(token, now)),
            ),
            Command::SetGlobalLimits {
                space,
                time,
                rate_limit,
            } => {
                self.governor.set_limits(GovernorLimits {
                    space,
                    time,
                    rate_limit,
                });
                Reply::new(conn, vec![protocol::SET_GLOBAL_LIMITS])
            }
        }
    }

    fn write_start(&mut self, pid: u32) -> u32 {
        if let Some(writer) = self.writer {
            return if writer == pid {
                protocol::WRITE_START
            } else {
                protocol::WRITE_ROLLBACK
            };
        }
        match self.files.lock(pid) {
            Ok(fresh) => {
                if fresh && let Err(e) = self.files.snapshot(&self.pins.held()) {
                    error!("Shadow copy for pid {pid} failed: {e}");
                    if let Err(e) = self.files.discard() {
                        error!("Cleanup after failed shadow copy failed: {e}");
                    }
                    return protocol::WRITE_ROLLBACK;
                }
                self.writer = Some(pid);
                info!("Write transaction started by pid {pid}");
                protocol::WRITE_START
            }
            Err(DispatchError::LockHeld { pid: holder }) => {
                debug!("Write lock held by {holder}, pid {pid} must retry");
                protocol::WRITE_ROLLBACK
            }
            Err(e) => {
                error!("Write lock for pid {pid} failed: {e}");
                protocol::WRITE_ROLLBACK
            }
        }
    }

    fn write_commit(&mut self, conn: ConnId, pid: u32) -> Vec<Reply> {
        if self.writer != Some(pid) {
            warn!("Commit from pid {pid} without a write transaction");
            return Reply::new(conn, vec![protocol::WRITE_ROLLBACK]);
        }
        if !self.reading_idx.is_empty() {
            self.pending_commit = true;
            info!(
                "Commit deferred, {} readers still on the index",
                self.reading_idx.len()
            );
            return Vec::new();
        }
        Reply::new(conn, vec![self.commit()])
    }

    /// Promote the shadows. On failure the transaction stays open, so the
    /// writer can send `WRITE_COMMIT` again or roll back.
    fn commit(&mut self) -> u32 {
        self.pending_commit = false;
        match self.files.promote() {
            Ok(()) => {
                info!("Write transaction of pid {:?} committed", self.writer);
                self.writer = None;
                let footprint = self
                    .files
                    .footprint()
                    .inspect_err(|e| warn!("Footprint of the new indexes unavailable: {e}"))
                    .ok();
                self.pins.advance(footprint);
                protocol::WRITE_COMMIT
            }
            Err(e) => {
                let left: Vec<String> = self
                    .files
                    .leftovers()
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                error!(
                    "Commit of pid {:?} failed, transaction kept open with {}: {e}",
                    self.writer,
                    left.join(", ")
                );
                0
            }
        }
    }

    /// Make sure the footprint of the current indexes is known.
    fn refresh_footprint(&mut self) -> bool {
        if self.pins.has_current() {
            return true;
        }
        match self.files.footprint() {
            Ok(footprint) => {
                self.pins.set_current(footprint);
                true
            }
            Err(e) => {
                warn!("Cannot read index footprint, admissions wait: {e}");
                false
            }
        }
    }

    fn release_reader(&mut self, pid: u32) {
        self.reading_idx.remove(&pid);
        self.pins.unpin(pid);
    }

    fn try_pending_commit(&mut self) -> Vec<Reply> {
        if !self.pending_commit || !self.reading_idx.is_empty() {
            return Vec::new();
        }
        let writer_conn = self
            .writer
            .and_then(|pid| self.conn_by_pid.get(&pid).copied());
        let word = self.commit();
        writer_conn.map_or_else(Vec::new, |conn| Reply::new(conn, vec![word]))
    }

    fn write_rollback(&mut self, pid: u32) {
        if self.writer != Some(pid) {
            return;
        }
        if let Err(e) = self.files.discard() {
            error!("Rollback of pid {pid} failed: {e}");
            return;
        }
        self.writer = None;
        self.pending_commit = false;
        info!("Write transaction of pid {pid} rolled back");
    }

    fn read_aborted(&mut self, pid: u32, now: u64) -> Vec<Reply> {
        if self.governor.remove(pid, now).is_some() {
            debug!("Read of pid {pid} aborted");
        }
        self.release_reader(pid);
        self.try_pending_commit()
    }

    fn disconnect(&mut self, conn: ConnId, now: u64) -> Vec<Reply> {
        let Some(pid) = self.pid_by_conn.remove(&conn).flatten() else {
            return Vec::new();
        };
        if self.conn_by_pid.get(&pid) != Some(&conn) {
            return Vec::new();
        }
        self.conn_by_pid.remove(&pid);

        if self.writer == Some(pid) && !self.pending_commit {
            warn!("Writer {pid} disconnected without commit");
            self.write_rollback(pid);
        }
        self.read_aborted(pid, now)
    }

    fn purge(&mut self, now: u64) -> Vec<Reply> {
        let live: BTreeSet<u32> = self.conn_by_pid.keys().copied().collect();
        for pid in self.governor.purge(&live, now) {
            self.release_reader(pid);
        }
        let gone: Vec<u32> = self
            .reading_idx
            .iter()
            .copied()
            .filter(|pid| !live.contains(pid))
            .collect();
        for pid in gone {
            self.release_reader(pid);
        }
        self.try_pending_commit()
    }
}
