//! Human-readable status dump, written to `<shadow_name>.status`.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use super::Coordinator;
use crate::{DispatchError, Result};

/// Render the status report at unix time `now`.
pub fn render(coordinator: &Coordinator, now: u64) -> String {
    let governor = coordinator.governor();
    let limits = governor.limits();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Number of not yet opened connections: {}",
        coordinator.unidentified_count()
    );
    let _ = writeln!(
        out,
        "Number of connected clients: {}",
        coordinator.connection_count()
    );
    let _ = writeln!(out, "Rate limit: {}", limits.rate_limit);
    let _ = writeln!(out, "Total available space: {}", limits.space);
    let _ = writeln!(out, "Total claimed space: {}", governor.claimed_space());
    let _ = writeln!(out, "Average claimed space: {}", governor.average_space());
    let _ = writeln!(out, "Total available time units: {}", limits.time);
    let _ = writeln!(out, "Total claimed time units: {}", governor.claimed_time());
    let _ = writeln!(
        out,
        "Average claimed time units: {}",
        governor.average_time()
    );
    let _ = writeln!(
        out,
        "Counter of started reads (including aborted reads): {}",
        coordinator.reads_started()
    );
    let _ = writeln!(
        out,
        "Counter of finished reads: {}",
        coordinator.reads_finished()
    );
    if let Some(writer) = coordinator.writer() {
        let _ = writeln!(
            out,
            "Writer: {writer}{}",
            if coordinator.pending_commit() {
                " (commit pending)"
            } else {
                ""
            }
        );
    }

    for entry in governor.active().values() {
        let state = coordinator
            .reader_state(entry.pid)
            .map_or("unknown", |state| state.label());
        let _ = writeln!(
            out,
            "{state} {} {} {} {} {}",
            entry.pid, entry.token, entry.max_space, entry.max_time, entry.start_time
        );
    }
    for pending in governor.pending().values() {
        let _ = writeln!(out, "pending {} {}", pending.pid, pending.first_seen);
    }
    for quota in governor.penalties().iter().filter(|q| q.expiration > now) {
        let _ = writeln!(out, "quota {} {}", quota.token, quota.expiration);
    }
    out
}

/// Write the report next to the shadow files; returns its path.
pub fn write(coordinator: &Coordinator, now: u64) -> Result<PathBuf> {
    let path = coordinator.files().status_path();
    fs::write(&path, render(coordinator, now)).map_err(DispatchError::io("write_status", &path))?;
    Ok(path)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::GovernorLimits;
    use crate::coordinator::{Event, ShadowFiles};
    use crate::ipc::protocol::Command;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_status_report() {
        let dir = tempdir().expect("tempdir");
        let files = ShadowFiles::new(dir.path(), dir.path().join("osm.shadow"), &[]);
        let limits = GovernorLimits {
            space: 8000,
            time: 600,
            rate_limit: 1,
        };
        let mut c = Coordinator::new(files, limits).expect("coordinator");
        c.handle(Event::Connected(1), 0);
        c.handle(Event::Identified { conn: 1, pid: 77 }, 0);
        c.handle(Event::Connected(2), 0);
        c.handle(Event::Identified { conn: 2, pid: 78 }, 0);
        c.handle(Event::Connected(3), 0);
        for (conn, now) in [(1, 10), (2, 11)] {
            c.handle(
                Event::Message {
                    conn,
                    command: Command::RequestReadAndIdx {
                        max_time: 60,
                        max_space: 1000,
                        token: 4,
                    },
                },
                now,
            );
        }

        let text = render(&c, 12);
        assert_eq!(
            text,
            "Number of not yet opened connections: 1\n\
             Number of connected clients: 2\n\
             Rate limit: 1\n\
             Total available space: 8000\n\
             Total claimed space: 1000\n\
             Average claimed space: 0\n\
             Total available time units: 600\n\
             Total claimed time units: 60\n\
             Average claimed time units: 0\n\
             Counter of started reads (including aborted reads): 1\n\
             Counter of finished reads: 0\n\
             reading_index 77 4 1000 60 10\n\
             pending 78 11\n"
        );

        let path = write(&c, 12).expect("write");
        assert_eq!(path, dir.path().join("osm.shadow.status"));
        assert_eq!(fs::read_to_string(path).expect("read"), text);
    }
}
