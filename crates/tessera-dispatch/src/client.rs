//! Blocking dispatcher client.
//!
//! Reader and writer processes use this to talk to the dispatcher. Every
//! call sends one command and reads its reply. Calls that the dispatcher
//! may answer with "not yet" are retried with a fixed sleep, bounded by a
//! [`RetryPolicy`].

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::config::{GovernorLimits, RetryPolicy};
use crate::governor::TokenStatus;
use crate::ipc::protocol::{self, Command, TokenStatusDecoder};
use crate::ipc::{SharedSegment, socket_path};
use crate::{DispatchError, Result};

/// Default read timeout on the socket.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a dispatcher.
#[derive(Debug)]
pub struct DispatcherClient {
    stream: UnixStream,
    path: PathBuf,
    pid: u32,
}

impl DispatcherClient {
    /// Connect as the current process.
    pub fn connect(path: &Path) -> Result<Self> {
        Self::connect_as(path, std::process::id())
    }

    /// Connect announcing `pid`.
    pub fn connect_as(path: &Path, pid: u32) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(DispatchError::io("connect", path))?;
        stream
            .set_read_timeout(Some(DEFAULT_READ_TIMEOUT))
            .map_err(DispatchError::io("set_read_timeout", path))?;
        let mut client = Self {
            stream,
            path: path.to_path_buf(),
            pid,
        };
        client.send_words(&[pid])?;
        debug!("Connected to {} as pid {pid}", path.display());
        Ok(client)
    }

    /// Find the dispatcher through its shared memory segment and connect.
    pub fn discover(shared_name: &str) -> Result<Self> {
        let block = SharedSegment::read(shared_name)?;
        Self::connect(&socket_path(&block.db_dir, shared_name))
    }

    /// Pid announced at connect.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Change the socket read timeout.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(DispatchError::io("set_read_timeout", &self.path))
    }

    /// Take the write lock, polling while another writer holds it.
    pub fn write_start(&mut self, policy: &RetryPolicy) -> Result<()> {
        for attempt in 1..=policy.attempts {
            match self.call(Command::WriteStart)? {
                protocol::WRITE_START => return Ok(()),
                protocol::WRITE_ROLLBACK => {
                    debug!("Write lock busy, attempt {attempt}");
                    thread::sleep(policy.interval);
                }
                other => return Err(unexpected(Command::WriteStart, other)),
            }
        }
        Err(DispatchError::Timeout {
            attempts: policy.attempts,
        })
    }

    /// Commit, waiting while readers still hold the index.
    pub fn write_commit(&mut self, policy: &RetryPolicy) -> Result<()> {
        self.send(Command::WriteCommit)?;
        let mut waited = 0;
        loop {
            match self.read_word() {
                Ok(protocol::WRITE_COMMIT) => return Ok(()),
                Ok(0) => return Err(DispatchError::CommitFailed),
                Ok(protocol::WRITE_ROLLBACK) => {
                    return Err(DispatchError::Protocol(
                        "commit without a write transaction".to_string(),
                    ));
                }
                Ok(other) => return Err(unexpected(Command::WriteCommit, other)),
                Err(DispatchError::Io { source, .. }) if is_timeout(&source) => {
                    waited += 1;
                    if waited >= policy.attempts {
                        return Err(DispatchError::Timeout { attempts: waited });
                    }
                    debug!("Commit still deferred after {waited} waits");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Abandon the write transaction.
    pub fn write_rollback(&mut self) -> Result<()> {
        self.expect_ack(Command::WriteRollback, protocol::WRITE_ROLLBACK)
    }

    /// Ask for admission as a reader.
    pub fn request_read_and_idx(
        &mut self,
        max_time: u32,
        max_space: u64,
        token: u32,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let command = Command::RequestReadAndIdx {
            max_time,
            max_space,
            token,
        };
        let mut rejections = 0;
        for attempt in 1..=policy.attempts {
            match self.call(command)? {
                protocol::REQUEST_READ_AND_IDX => return Ok(()),
                protocol::RATE_LIMITED => return Err(DispatchError::RateLimited { token }),
                protocol::QUERY_REJECTED => rejections += 1,
                0 => {}
                other => return Err(unexpected(command, other)),
            }
            debug!("Admission pending, attempt {attempt}");
            thread::sleep(policy.interval);
        }
        if rejections == policy.attempts {
            return Err(DispatchError::Rejected {
                attempts: rejections,
            });
        }
        Err(DispatchError::Timeout {
            attempts: policy.attempts,
        })
    }

    /// Release the index files.
    pub fn read_idx_finished(&mut self) -> Result<()> {
        self.expect_ack(Command::ReadIdxFinished, protocol::READ_IDX_FINISHED)
    }

    /// Release the reservation after a successful read.
    pub fn read_finished(&mut self) -> Result<()> {
        self.expect_ack(Command::ReadFinished, protocol::READ_FINISHED)
    }

    /// Release the reservation after a failed read.
    pub fn read_aborted(&mut self) -> Result<()> {
        self.expect_ack(Command::Hangup, protocol::READ_ABORTED)
    }

    /// Release the reservation of another process.
    pub fn purge(&mut self, pid: u32) -> Result<()> {
        self.expect_ack(Command::Purge { pid }, protocol::PURGE)
    }

    /// Some live reader of `token`.
    pub fn query_by_token(&mut self, token: u32) -> Result<Option<u32>> {
        let pid = self.call(Command::QueryByToken { token })?;
        Ok((pid != 0).then_some(pid))
    }

    /// Readers and penalties of `token`.
    pub fn query_my_status(&mut self, token: u32) -> Result<TokenStatus> {
        self.send(Command::QueryMyStatus { token })?;
        let mut decoder = TokenStatusDecoder::default();
        loop {
            if let Some(status) = decoder.push(self.read_word()?) {
                return Ok(status);
            }
        }
    }

    /// Replace the global budgets.
    pub fn set_global_limits(&mut self, limits: GovernorLimits) -> Result<()> {
        self.expect_ack(
            Command::SetGlobalLimits {
                space: limits.space,
                time: limits.time,
                rate_limit: limits.rate_limit,
            },
            protocol::SET_GLOBAL_LIMITS,
        )
    }

    /// Ask the dispatcher to write its status file.
    pub fn output_status(&mut self) -> Result<()> {
        self.expect_ack(Command::OutputStatus, protocol::OUTPUT_STATUS)
    }

    /// Stop the dispatcher.
    pub fn terminate(&mut self) -> Result<()> {
        self.expect_ack(Command::Terminate, protocol::TERMINATE)
    }

    fn expect_ack(&mut self, command: Command, ack: u32) -> Result<()> {
        match self.call(command)? {
            word if word == ack => Ok(()),
            other => Err(unexpected(command, other)),
        }
    }

    fn call(&mut self, command: Command) -> Result<u32> {
        self.send(command)?;
        self.read_word()
    }

    fn send(&mut self, command: Command) -> Result<()> {
        self.send_words(&command.encode())
    }

    fn send_words(&mut self, words: &[u32]) -> Result<()> {
        self.stream
            .write_all(&protocol::to_bytes(words))
            .map_err(DispatchError::io("send", &self.path))
    }

    fn read_word(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.stream
            .read_exact(&mut buf)
            .map_err(DispatchError::io("receive", &self.path))?;
        Ok(u32::from_le_bytes(buf))
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn unexpected(command: Command, word: u32) -> DispatchError {
    DispatchError::Protocol(format!("unexpected reply {word} to {command:?}"))
}
