//! Reader admission under global budgets and per-token rate limits.
//!
//! Every reader declares the space and time it may use. A request is
//! admitted only while it fits into half of the budget nobody has claimed
//! yet, so one large query always leaves room for others. Readers share a
//! client token; a token may hold at most `rate_limit` slots, where a slot
//! is a live reader or an unexpired penalty window. A caller over the limit
//! hears "not yet" for a grace period and is rate limited after that.
//!
//! When a reader leaves, its token receives a penalty window proportional
//! to how long it ran and how busy the dispatcher was on average over the
//! last 15 seconds.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::config::GovernorLimits;
use crate::ipc::protocol;

/// Seconds a rate-limited caller may keep waiting before it is rejected.
pub const RATE_LIMIT_GRACE_SECS: u64 = 15;

/// Slots in the rolling utilization average, one per second.
pub const AVERAGE_SLOTS: usize = 15;

/// An admitted reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderEntry {
    /// Reader process.
    pub pid: u32,
    /// Client token the reader counts against.
    pub token: u32,
    /// Declared space in bytes.
    pub max_space: u64,
    /// Declared time in seconds.
    pub max_time: u32,
    /// Admission time, unix seconds.
    pub start_time: u64,
}

/// A caller waiting behind a full rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingClient {
    /// Waiting process.
    pub pid: u32,
    /// First refusal, unix seconds.
    pub first_seen: u64,
}

/// A penalty window held by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEntry {
    /// Penalized token.
    pub token: u32,
    /// End of the window, unix seconds.
    pub expiration: u64,
}

/// Outcome of an admission probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The reader is admitted.
    Granted,
    /// Not now, ask again.
    NotYet,
    /// The token stayed over its limit past the grace period.
    RateLimited,
    /// The request exceeds what could ever be granted.
    Rejected,
}

impl Admission {
    /// Reply word on the wire.
    pub const fn reply_word(self) -> u32 {
        match self {
            Self::Granted => protocol::REQUEST_READ_AND_IDX,
            Self::NotYet => 0,
            Self::RateLimited => protocol::RATE_LIMITED,
            Self::Rejected => protocol::QUERY_REJECTED,
        }
    }
}

/// Per-token answer to `QUERY_MY_STATUS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenStatus {
    /// Current rate limit.
    pub rate_limit: u32,
    /// Live readers as `(pid, max_time, start_time)`.
    pub readers: Vec<(u32, u32, u64)>,
    /// Expirations of the token's penalty windows.
    pub penalties: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
struct RollingAverage {
    slots: [(u64, u64); AVERAGE_SLOTS],
    last_second: Option<u64>,
}

impl RollingAverage {
    fn record(&mut self, now: u64, space: u64, time: u64) {
        let from = match self.last_second {
            Some(last) if now <= last => {
                self.slots[slot(now)] = (space, time);
                return;
            }
            Some(last) => (last + 1).max(now.saturating_sub(AVERAGE_SLOTS as u64 - 1)),
            None => now,
        };
        for second in from..=now {
            self.slots[slot(second)] = (space, time);
        }
        self.last_second = Some(now);
    }

    fn space(&self) -> u64 {
        self.slots.iter().map(|s| s.0).sum::<u64>() / AVERAGE_SLOTS as u64
    }

    fn time(&self) -> u64 {
        self.slots.iter().map(|s| s.1).sum::<u64>() / AVERAGE_SLOTS as u64
    }
}

const fn slot(second: u64) -> usize {
    (second % AVERAGE_SLOTS as u64) as usize
}

/// Admission state for all readers.
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    limits: GovernorLimits,
    active: BTreeMap<u32, ReaderEntry>,
    pending: BTreeMap<u32, PendingClient>,
    penalties: Vec<QuotaEntry>,
    claimed_space: u64,
    claimed_time: u64,
    average: RollingAverage,
}

impl ResourceGovernor {
    /// Governor with no readers.
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            active: BTreeMap::new(),
            pending: BTreeMap::new(),
            penalties: Vec::new(),
            claimed_space: 0,
            claimed_time: 0,
            average: RollingAverage::default(),
        }
    }

    /// Current budgets.
    pub const fn limits(&self) -> GovernorLimits {
        self.limits
    }

    /// Space declared by admitted readers.
    pub const fn claimed_space(&self) -> u64 {
        self.claimed_space
    }

    /// Time declared by admitted readers.
    pub const fn claimed_time(&self) -> u64 {
        self.claimed_time
    }

    /// Claimed space averaged over the last 15 seconds.
    pub fn average_space(&self) -> u64 {
        self.average.space()
    }

    /// Claimed time averaged over the last 15 seconds.
    pub fn average_time(&self) -> u64 {
        self.average.time()
    }

    /// Admitted readers by pid.
    pub const fn active(&self) -> &BTreeMap<u32, ReaderEntry> {
        &self.active
    }

    /// Callers waiting behind a rate limit, by pid.
    pub const fn pending(&self) -> &BTreeMap<u32, PendingClient> {
        &self.pending
    }

    /// Penalty windows not yet purged.
    pub fn penalties(&self) -> &[QuotaEntry] {
        &self.penalties
    }

    /// Whether `pid` is an admitted reader.
    pub fn is_active(&self, pid: u32) -> bool {
        self.active.contains_key(&pid)
    }

    /// Ask to admit `pid` under `token`.
    pub fn probe(
        &mut self,
        pid: u32,
        token: u32,
        max_time: u32,
        max_space: u64,
        now: u64,
    ) -> Admission {
        self.expire_penalties(now);

        if self.active.contains_key(&pid) {
            return Admission::Granted;
        }

        if max_space > self.limits.space / 2
            || u64::from(max_time) > u64::from(self.limits.time) / 2
        {
            self.pending.remove(&pid);
            debug!(
                "Rejected pid {pid}: space {max_space}, time {max_time} exceed half the budget"
            );
            return Admission::Rejected;
        }

        if self.limits.rate_limit > 0
            && token != 0
            && self.token_slots(token) >= self.limits.rate_limit as usize
        {
            let first_seen = self
                .pending
                .entry(pid)
                .or_insert(PendingClient {
                    pid,
                    first_seen: now,
                })
                .first_seen;
            if now.saturating_sub(first_seen) >= RATE_LIMIT_GRACE_SECS {
                self.pending.remove(&pid);
                warn!("Token {token} rate limited, pid {pid} waited since {first_seen}");
                return Admission::RateLimited;
            }
            return Admission::NotYet;
        }

        let unused_space = self.limits.space.saturating_sub(self.claimed_space);
        let unused_time = u64::from(self.limits.time).saturating_sub(self.claimed_time);
        if max_space > unused_space / 2 || u64::from(max_time) > unused_time / 2 {
            return Admission::NotYet;
        }

        self.average.record(now, self.claimed_space, self.claimed_time);
        self.pending.remove(&pid);
        self.claimed_space += max_space;
        self.claimed_time += u64::from(max_time);
        self.active.insert(
            pid,
            ReaderEntry {
                pid,
                token,
                max_space,
                max_time,
                start_time: now,
            },
        );
        debug!("Admitted pid {pid} (token {token}, space {max_space}, time {max_time})");
        Admission::Granted
    }

    /// Release `pid`, penalizing its token by its share of recent load.
    pub fn remove(&mut self, pid: u32, now: u64) -> Option<ReaderEntry> {
        self.pending.remove(&pid);
        let entry = self.active.remove(&pid)?;

        self.average.record(now, self.claimed_space, self.claimed_time);
        self.claimed_space -= entry.max_space;
        self.claimed_time -= u64::from(entry.max_time);

        let penalty = self.penalty_secs(now.saturating_sub(entry.start_time));
        if penalty > 0 && entry.token != 0 {
            self.penalties.push(QuotaEntry {
                token: entry.token,
                expiration: now + penalty,
            });
            debug!("Token {} penalized for {penalty}s", entry.token);
        }
        Some(entry)
    }

    /// Drop readers and waiting callers whose process is gone.
    pub fn purge(&mut self, live_pids: &BTreeSet<u32>, now: u64) -> Vec<u32> {
        let dead: Vec<u32> = self
            .active
            .keys()
            .filter(|pid| !live_pids.contains(pid))
            .copied()
            .collect();
        for pid in &dead {
            self.remove(*pid, now);
        }
        self.pending.retain(|pid, _| live_pids.contains(pid));
        self.expire_penalties(now);
        if !dead.is_empty() {
            warn!("Purged {} readers without a live process", dead.len());
        }
        dead
    }

    /// Advance the rolling average to `now`.
    pub fn tick(&mut self, now: u64) {
        self.average.record(now, self.claimed_space, self.claimed_time);
    }

    /// Replace the budgets; never below what is already claimed.
    pub fn set_limits(&mut self, limits: GovernorLimits) {
        let claimed_time = u32::try_from(self.claimed_time).unwrap_or(u32::MAX);
        self.limits = GovernorLimits {
            space: limits.space.max(self.claimed_space),
            time: limits.time.max(claimed_time),
            rate_limit: limits.rate_limit,
        };
        debug!("Limits now {:?}", self.limits);
    }

    /// Some live reader of `token`.
    pub fn query_by_token(&self, token: u32) -> Option<u32> {
        self.active
            .values()
            .find(|entry| entry.token == token)
            .map(|entry| entry.pid)
    }

    /// Readers and penalty windows of `token`.
    pub fn status_for_token(&self, token: u32, now: u64) -> TokenStatus {
        TokenStatus {
            rate_limit: self.limits.rate_limit,
            readers: self
                .active
                .values()
                .filter(|entry| entry.token == token)
                .map(|entry| (entry.pid, entry.max_time, entry.start_time))
                .collect(),
            penalties: self
                .penalties
                .iter()
                .filter(|quota| quota.token == token && quota.expiration > now)
                .map(|quota| quota.expiration)
                .collect(),
        }
    }

    fn token_slots(&self, token: u32) -> usize {
        self.active.values().filter(|e| e.token == token).count()
            + self.penalties.iter().filter(|q| q.token == token).count()
    }

    fn expire_penalties(&mut self, now: u64) {
        self.penalties.retain(|quota| quota.expiration > now);
    }

    #[allow(clippy::cast_precision_loss)]
    fn penalty_secs(&self, duration: u64) -> u64 {
        let space = self.average.space() as f64 / self.limits.space.max(1) as f64;
        let time = self.average.time() as f64 / f64::from(self.limits.time.max(1));
        let utilization = space.max(time).clamp(0.0, 1.0);
        (duration as f64 * utilization) as u64
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn limits(space: u64, time: u32, rate_limit: u32) -> GovernorLimits {
        GovernorLimits {
            space,
            time,
            rate_limit,
        }
    }

    #[test]
    fn test_half_of_unused_budget() {
        let mut gov = ResourceGovernor::new(limits(1000, 1000, 0));
        assert_eq!(gov.probe(1, 0, 10, 500, 100), Admission::Granted);
        // 500 unused, 250 is the ceiling now
        assert_eq!(gov.probe(2, 0, 10, 300, 100), Admission::NotYet);
        assert_eq!(gov.probe(3, 0, 10, 250, 100), Admission::Granted);
        assert_eq!(gov.claimed_space(), 750);

        gov.remove(1, 101);
        assert_eq!(gov.probe(2, 0, 10, 300, 101), Admission::Granted);
    }

    #[test]
    fn test_rejected_over_half_total() {
        let mut gov = ResourceGovernor::new(limits(1000, 100, 0));
        assert_eq!(gov.probe(1, 0, 10, 501, 0), Admission::Rejected);
        assert_eq!(gov.probe(1, 0, 51, 10, 0), Admission::Rejected);
        assert!(gov.active().is_empty());
    }

    #[test]
    fn test_rate_limit_grace_window() {
        let mut gov = ResourceGovernor::new(limits(1 << 30, 1 << 20, 2));
        assert_eq!(gov.probe(1, 7, 10, 10, 1000), Admission::Granted);
        assert_eq!(gov.probe(2, 7, 10, 10, 1000), Admission::Granted);

        assert_eq!(gov.probe(3, 7, 10, 10, 1000), Admission::NotYet);
        assert_eq!(gov.pending()[&3].first_seen, 1000);
        assert_eq!(gov.probe(3, 7, 10, 10, 1014), Admission::NotYet);
        assert_eq!(gov.probe(3, 7, 10, 10, 1015), Admission::RateLimited);
        assert!(gov.pending().is_empty());

        // Other tokens and token 0 are unaffected
        assert_eq!(gov.probe(4, 8, 10, 10, 1015), Admission::Granted);
        assert_eq!(gov.probe(5, 0, 10, 10, 1015), Admission::Granted);
    }

    #[test]
    fn test_penalty_scales_with_load() {
        let mut gov = ResourceGovernor::new(limits(1000, 1000, 1));
        assert_eq!(gov.probe(1, 9, 400, 10, 0), Admission::Granted);
        for second in 1..=20 {
            gov.tick(second);
        }
        // Averaged 400 of 1000 time units for the whole window
        assert_eq!(gov.average_time(), 400);
        gov.remove(1, 20);

        assert_eq!(gov.penalties(), &[QuotaEntry {
            token: 9,
            expiration: 28
        }]);
        // The penalty window holds the only slot of token 9
        assert_eq!(gov.probe(2, 9, 10, 10, 21), Admission::NotYet);
        assert_eq!(gov.probe(2, 9, 10, 10, 28), Admission::Granted);
    }

    #[test]
    fn test_idle_dispatcher_no_penalty() {
        let mut gov = ResourceGovernor::new(limits(1 << 40, 1 << 30, 1));
        assert_eq!(gov.probe(1, 9, 1, 1, 0), Admission::Granted);
        gov.remove(1, 5);
        assert!(gov.penalties().is_empty());
    }

    #[test]
    fn test_purge_dead_processes() {
        let mut gov = ResourceGovernor::new(limits(1000, 1000, 1));
        gov.probe(1, 3, 10, 10, 0);
        gov.probe(2, 4, 10, 10, 0);
        gov.probe(3, 3, 10, 10, 0);
        assert!(gov.pending().contains_key(&3));

        let live = BTreeSet::from([2]);
        assert_eq!(gov.purge(&live, 1), vec![1]);
        assert!(gov.pending().is_empty());
        assert_eq!(gov.claimed_space(), 10);
    }

    #[test]
    fn test_set_limits_never_below_claimed() {
        let mut gov = ResourceGovernor::new(limits(1000, 1000, 0));
        gov.probe(1, 0, 300, 400, 0);
        gov.set_limits(limits(100, 100, 5));
        assert_eq!(gov.limits(), limits(400, 300, 5));
    }

    #[test]
    fn test_token_queries() {
        let mut gov = ResourceGovernor::new(limits(1000, 1000, 0));
        gov.probe(11, 5, 20, 10, 50);
        gov.probe(12, 6, 30, 10, 51);
        assert_eq!(gov.query_by_token(6), Some(12));
        assert_eq!(gov.query_by_token(7), None);

        let status = gov.status_for_token(5, 60);
        assert_eq!(status.readers, vec![(11, 20, 50)]);
        assert!(status.penalties.is_empty());
    }

    #[test]
    fn test_reply_words() {
        assert_eq!(Admission::Granted.reply_word(), protocol::REQUEST_READ_AND_IDX);
        assert_eq!(Admission::NotYet.reply_word(), 0);
        assert_eq!(Admission::Rejected.reply_word(), protocol::QUERY_REJECTED);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;

        #[derive(Debug, Clone)]
        enum Op {
            Probe { pid: u32, token: u32, time: u32, space: u64 },
            Remove { pid: u32 },
            Limits { space: u64, time: u32 },
            Tick,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (1u32..20, 0u32..4, 0u32..600, 0u64..600)
                    .prop_map(|(pid, token, time, space)| Op::Probe { pid, token, time, space }),
                2 => (1u32..20).prop_map(|pid| Op::Remove { pid }),
                1 => (0u64..2000, 0u32..2000).prop_map(|(space, time)| Op::Limits { space, time }),
                1 => Just(Op::Tick),
            ]
        }

        proptest! {
            #[test]
            fn admission_conservation(ops in prop::collection::vec(op(), 1..200)) {
                let mut gov = ResourceGovernor::new(limits(1000, 1000, 2));
                for (now, op) in ops.into_iter().enumerate() {
                    let now = now as u64;
                    match op {
                        Op::Probe { pid, token, time, space } => {
                            gov.probe(pid, token, time, space, now);
                        }
                        Op::Remove { pid } => {
                            gov.remove(pid, now);
                        }
                        Op::Limits { space, time } => {
                            gov.set_limits(limits(space, time, 2));
                        }
                        Op::Tick => gov.tick(now),
                    }

                    let space: u64 = gov.active().values().map(|e| e.max_space).sum();
                    let time: u64 = gov.active().values().map(|e| u64::from(e.max_time)).sum();
                    if space != gov.claimed_space() || time != gov.claimed_time() {
                        return Err(TestCaseError::fail("claimed totals drifted"));
                    }
                    prop_assert!(space <= gov.limits().space);
                    prop_assert!(time <= u64::from(gov.limits().time));
                }
            }
        }
    }
}
