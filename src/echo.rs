//! Line-oriented session used by the daemon binary, the demo and the
//! integration tests.
//!
//! * `QUIT` ends the session.
//! * `BINLOG DUMP` turns it into a replication-dump session that streams
//!   `event <n>` lines until killed.
//! * Anything else is echoed back.

use crate::{ExitReason, SessionExecutor, SessionHandle};
use gatehouse_core::KillState;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

pub struct EchoExecutor {
    /// Read timeout; bounds how late a soft kill is noticed.
    pub poll: Duration,
    pub dump_interval: Duration,
}

impl Default for EchoExecutor {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(50),
            dump_interval: Duration::from_millis(20),
        }
    }
}

impl EchoExecutor {
    fn stream_dump(&self, handle: &SessionHandle) -> ExitReason {
        let mut out = handle.stream();
        let mut n = 0u64;
        loop {
            if handle.wait_for_kill(self.dump_interval) != KillState::None {
                return ExitReason::Killed;
            }
            n += 1;
            if writeln!(out, "event {}", n).is_err() {
                return ExitReason::Disconnected;
            }
        }
    }
}

impl SessionExecutor for EchoExecutor {
    fn run_session(&self, handle: &Arc<SessionHandle>) -> ExitReason {
        let stream = handle.stream();
        if let Err(e) = stream.set_read_timeout(Some(self.poll)) {
            return ExitReason::Error(e.to_string());
        }
        let mut reader = BufReader::new(stream);
        let mut out = stream;
        let mut line = String::new();

        loop {
            if handle.is_killed() {
                return ExitReason::Killed;
            }
            match reader.read_line(&mut line) {
                Ok(0) => return ExitReason::Disconnected,
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
                Err(e) => {
                    return if handle.is_killed() {
                        ExitReason::Killed
                    } else {
                        ExitReason::Error(e.to_string())
                    };
                }
            }

            // A timed-out read may leave a partial line buffered.
            if !line.ends_with('\n') {
                continue;
            }
            let command = line.trim_end().to_string();
            line.clear();

            match command.as_str() {
                "QUIT" => return ExitReason::Disconnected,
                "BINLOG DUMP" => {
                    if handle.mark_replication_dump() {
                        return self.stream_dump(handle);
                    }
                    let _ = writeln!(out, "ERROR admin sessions cannot dump");
                }
                _ => {
                    if writeln!(out, "{}", command).is_err() {
                        return ExitReason::Disconnected;
                    }
                }
            }
        }
    }
}
