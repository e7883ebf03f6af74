//! Word protocol between clients and the dispatcher.
//!
//! A message is an opcode word followed by a fixed number of argument
//! words. 64-bit values travel as a low word then a high word. The first
//! word a client sends after connecting is its process id.

use crate::governor::TokenStatus;

/// Stop the dispatcher.
pub const TERMINATE: u32 = 1;
/// Write the status dump.
pub const OUTPUT_STATUS: u32 = 2;
/// Begin a write transaction.
pub const WRITE_START: u32 = 101;
/// Abandon the write transaction.
pub const WRITE_ROLLBACK: u32 = 102;
/// Promote the write transaction.
pub const WRITE_COMMIT: u32 = 103;
/// The client is going away mid-read.
pub const HANGUP: u32 = 201;
/// Alias of [`HANGUP`].
pub const READ_ABORTED: u32 = HANGUP;
/// The reader is done.
pub const READ_FINISHED: u32 = 202;
/// The reader no longer needs the index files.
pub const READ_IDX_FINISHED: u32 = 203;
/// Ask for reader admission.
pub const REQUEST_READ_AND_IDX: u32 = 301;
/// Release another process's reservation.
pub const PURGE: u32 = 302;
/// Find a reader by client token.
pub const QUERY_BY_TOKEN: u32 = 303;
/// Readers and penalties of a client token.
pub const QUERY_MY_STATUS: u32 = 304;
/// Replace the global budgets.
pub const SET_GLOBAL_LIMITS: u32 = 305;
/// Admission status: the token is over its rate limit.
pub const RATE_LIMITED: u32 = 502;
/// Admission status: the request can never be admitted.
pub const QUERY_REJECTED: u32 = 503;

/// A decoded client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `TERMINATE`
    Terminate,
    /// `OUTPUT_STATUS`
    OutputStatus,
    /// `WRITE_START`
    WriteStart,
    /// `WRITE_ROLLBACK`
    WriteRollback,
    /// `WRITE_COMMIT`
    WriteCommit,
    /// `HANGUP` / `READ_ABORTED`
    Hangup,
    /// `READ_FINISHED`
    ReadFinished,
    /// `READ_IDX_FINISHED`
    ReadIdxFinished,
    /// `REQUEST_READ_AND_IDX(max_time, space_lo, space_hi, token)`
    RequestReadAndIdx {
        /// Declared time in seconds.
        max_time: u32,
        /// Declared space in bytes.
        max_space: u64,
        /// Client token.
        token: u32,
    },
    /// `PURGE(pid)`
    Purge {
        /// Process to release.
        pid: u32,
    },
    /// `QUERY_BY_TOKEN(token)`
    QueryByToken {
        /// Client token.
        token: u32,
    },
    /// `QUERY_MY_STATUS(token)`
    QueryMyStatus {
        /// Client token.
        token: u32,
    },
    /// `SET_GLOBAL_LIMITS(space_lo, space_hi, time, rate_limit)`
    SetGlobalLimits {
        /// Space budget in bytes.
        space: u64,
        /// Time budget in seconds.
        time: u32,
        /// Readers per token.
        rate_limit: u32,
    },
}

/// Argument words following `opcode`, or `None` for an unknown opcode.
pub const fn arg_count(opcode: u32) -> Option<usize> {
    match opcode {
        TERMINATE | OUTPUT_STATUS | WRITE_START | WRITE_ROLLBACK | WRITE_COMMIT | HANGUP
        | READ_FINISHED | READ_IDX_FINISHED => Some(0),
        PURGE | QUERY_BY_TOKEN | QUERY_MY_STATUS => Some(1),
        REQUEST_READ_AND_IDX | SET_GLOBAL_LIMITS => Some(4),
        _ => None,
    }
}

impl Command {
    /// Decode an opcode and its arguments. Returns `None` when the opcode is
    /// unknown or `args` has the wrong length.
    pub fn decode(opcode: u32, args: &[u32]) -> Option<Self> {
        if arg_count(opcode)? != args.len() {
            return None;
        }
        let command = match opcode {
            TERMINATE => Self::Terminate,
            OUTPUT_STATUS => Self::OutputStatus,
            WRITE_START => Self::WriteStart,
            WRITE_ROLLBACK => Self::WriteRollback,
            WRITE_COMMIT => Self::WriteCommit,
            HANGUP => Self::Hangup,
            READ_FINISHED => Self::ReadFinished,
            READ_IDX_FINISHED => Self::ReadIdxFinished,
            REQUEST_READ_AND_IDX => Self::RequestReadAndIdx {
                max_time: args[0],
                max_space: join_u64(args[1], args[2]),
                token: args[3],
            },
            PURGE => Self::Purge { pid: args[0] },
            QUERY_BY_TOKEN => Self::QueryByToken { token: args[0] },
            QUERY_MY_STATUS => Self::QueryMyStatus { token: args[0] },
            SET_GLOBAL_LIMITS => Self::SetGlobalLimits {
                space: join_u64(args[0], args[1]),
                time: args[2],
                rate_limit: args[3],
            },
            _ => return None,
        };
        Some(command)
    }

    /// Opcode word.
    pub const fn opcode(&self) -> u32 {
        match self {
            Self::Terminate => TERMINATE,
            Self::OutputStatus => OUTPUT_STATUS,
            Self::WriteStart => WRITE_START,
            Self::WriteRollback => WRITE_ROLLBACK,
            Self::WriteCommit => WRITE_COMMIT,
            Self::Hangup => HANGUP,
            Self::ReadFinished => READ_FINISHED,
            Self::ReadIdxFinished => READ_IDX_FINISHED,
            Self::RequestReadAndIdx { .. } => REQUEST_READ_AND_IDX,
            Self::Purge { .. } => PURGE,
            Self::QueryByToken { .. } => QUERY_BY_TOKEN,
            Self::QueryMyStatus { .. } => QUERY_MY_STATUS,
            Self::SetGlobalLimits { .. } => SET_GLOBAL_LIMITS,
        }
    }

    /// Opcode followed by its arguments.
    pub fn encode(&self) -> Vec<u32> {
        let mut words = vec![self.opcode()];
        match *self {
            Self::RequestReadAndIdx {
                max_time,
                max_space,
                token,
            } => {
                let (lo, hi) = split_u64(max_space);
                words.extend([max_time, lo, hi, token]);
            }
            Self::Purge { pid } => words.push(pid),
            Self::QueryByToken { token } | Self::QueryMyStatus { token } => words.push(token),
            Self::SetGlobalLimits {
                space,
                time,
                rate_limit,
            } => {
                let (lo, hi) = split_u64(space);
                words.extend([lo, hi, time, rate_limit]);
            }
            _ => {}
        }
        words
    }
}

/// Split into low and high words.
pub const fn split_u64(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

/// Join low and high words.
#[allow(clippy::cast_lossless)]
pub const fn join_u64(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Encode words as little-endian bytes.
pub fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Reply to `QUERY_MY_STATUS`: rate limit, `(pid, max_time, start)` triples
/// closed by `0`, then penalty expirations closed by `0`.
pub fn encode_token_status(status: &TokenStatus) -> Vec<u32> {
    let mut words = vec![status.rate_limit];
    for &(pid, max_time, start) in &status.readers {
        words.extend([pid, max_time, clamp_u32(start)]);
    }
    words.push(0);
    words.extend(status.penalties.iter().map(|&e| clamp_u32(e)));
    words.push(0);
    words
}

/// Incremental decoder for a `QUERY_MY_STATUS` reply.
#[derive(Debug, Default)]
pub struct TokenStatusDecoder {
    status: TokenStatus,
    stage: StatusStage,
    reader: Vec<u32>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum StatusStage {
    #[default]
    RateLimit,
    Readers,
    Penalties,
    Done,
}

impl TokenStatusDecoder {
    /// Feed one word; returns the status once the reply is complete.
    pub fn push(&mut self, word: u32) -> Option<TokenStatus> {
        match self.stage {
            StatusStage::RateLimit => {
                self.status.rate_limit = word;
                self.stage = StatusStage::Readers;
            }
            StatusStage::Readers => {
                if self.reader.is_empty() && word == 0 {
                    self.stage = StatusStage::Penalties;
                } else {
                    self.reader.push(word);
                    if let [pid, max_time, start] = self.reader[..] {
                        self.status
                            .readers
                            .push((pid, max_time, u64::from(start)));
                        self.reader.clear();
                    }
                }
            }
            StatusStage::Penalties => {
                if word == 0 {
                    self.stage = StatusStage::Done;
                    return Some(std::mem::take(&mut self.status));
                }
                self.status.penalties.push(u64::from(word));
            }
            StatusStage::Done => {}
        }
        None
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
