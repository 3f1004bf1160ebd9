//! Timer bookkeeping: KCP tick, keepalive, timeout sweep. A single fixed-interval pass
//! over the live session set folds keepalive-write and dead-session eviction together,
//! since KCP's own `update`/`check` cadence is much finer-grained than the
//! keepalive/timeout/linger sweep.

use crate::session::{Session, SessionState};
use crate::tlv;
use std::time::{Duration, Instant};

/// Durations driving the four independent timers: keepalive, timeout, linger, time_wait.
/// Built from the matching config fields (seconds).
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub keepalive: Duration,
    pub timeout: Duration,
    pub linger: Duration,
    pub time_wait: Duration,
}

/// What the sweep wants done with a session after evaluating its timers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SweepOutcome {
    /// Keep the session in the table, no state change beyond what was already applied
    /// in-place (e.g. a graceful LINGER -> TIME_WAIT aging transition).
    Retain,
    /// The session timed out while live (INIT/CONNECT/CONNECTED past `timeout`). The
    /// caller must run the reset path, which sends an outbound session-0 RESET and moves
    /// the session to TIME_WAIT.
    Reset,
    /// The session has finished TIME_WAIT and can be dropped from the table outright, no
    /// RESET needed -- it already sent or received one to get here.
    Evict,
}

/// Drives one session's timer-triggered behavior for a single sweep tick.
///
/// - INIT/CONNECT/CONNECTED, idle past `timeout`: `Reset` (caller sends RESET, moves to
///   TIME_WAIT).
/// - CONNECTED, idle past `keepalive` but not yet `timeout`: emit one KEEPALIVE TLV,
///   `Retain`.
/// - LINGER, past `linger`: move to TIME_WAIT in place, `Retain` (no RESET -- LINGER was
///   entered via a clean EOF, not a protocol violation).
/// - TIME_WAIT, past `time_wait`: `Evict`.
///
/// LINGER and TIME_WAIT are measured from when the session entered that state, not from
/// `last_rx`: a session reset directly out of CONNECT must still clear TIME_WAIT after a
/// plain `time_wait` seconds, not `timeout + linger + time_wait`.
pub fn sweep_session(session: &mut Session, now: Instant, timers: &Timers) -> SweepOutcome {
    match session.state() {
        SessionState::Init | SessionState::Connect => {
            if session.idle_for(now) >= timers.timeout {
                SweepOutcome::Reset
            } else {
                SweepOutcome::Retain
            }
        }
        SessionState::Connected => {
            if session.idle_for(now) >= timers.timeout {
                return SweepOutcome::Reset;
            }
            if session.since_last_keepalive(now) >= timers.keepalive {
                let _ = session.send_tlv(&tlv::Frame::Keepalive);
                session.mark_keepalive_sent(now);
            }
            SweepOutcome::Retain
        }
        SessionState::Linger => {
            if session.since_state_change(now) >= timers.linger {
                session.set_state(SessionState::TimeWait);
            }
            SweepOutcome::Retain
        }
        SessionState::TimeWait => {
            if session.since_state_change(now) >= timers.time_wait {
                SweepOutcome::Evict
            } else {
                SweepOutcome::Retain
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::SessionKey;
    use crate::crypto::{self, Codec};
    use crate::msgframe::FramePool;
    use crate::queue::PacketQueue;
    use crate::session::{KcpTuning, SharedIo};
    use std::cell::RefCell;
    use std::net::SocketAddr;
    use std::rc::Rc;

    fn make_session(now: Instant) -> Session {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let key = SessionKey::new(peer, 1);
        let io = SharedIo {
            pool: Rc::new(RefCell::new(FramePool::new(4))),
            send: Rc::new(RefCell::new(PacketQueue::new(4))),
            codec: Rc::new(RefCell::new(Codec::new(crypto::generate_key(), true))),
        };
        let log = crate::logging::root_logger(crate::logging::Verbosity::Quiet);
        Session::new(key, peer, true, &KcpTuning::default(), io, now, log)
    }

    #[test]
    fn connected_session_times_out_to_reset() {
        let start = Instant::now();
        let mut session = make_session(start);
        session.set_state(SessionState::Connected);

        let timers = Timers {
            keepalive: Duration::from_secs(10),
            timeout: Duration::from_millis(1),
            linger: Duration::from_secs(30),
            time_wait: Duration::from_secs(60),
        };
        std::thread::sleep(Duration::from_millis(5));
        let outcome = sweep_session(&mut session, Instant::now(), &timers);
        assert_eq!(outcome, SweepOutcome::Reset);
        // sweep_session itself doesn't touch state on Reset -- that's the caller's job
        // (Server::reset_session), so the session is still CONNECTED here.
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn fresh_session_is_retained() {
        let start = Instant::now();
        let mut session = make_session(start);
        session.set_state(SessionState::Connected);

        let timers = Timers {
            keepalive: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            linger: Duration::from_secs(30),
            time_wait: Duration::from_secs(60),
        };
        assert_eq!(sweep_session(&mut session, Instant::now(), &timers), SweepOutcome::Retain);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn linger_expiry_moves_to_time_wait_without_reset() {
        let start = Instant::now();
        let mut session = make_session(start);
        session.set_state(SessionState::Linger);

        let timers = Timers {
            keepalive: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            linger: Duration::from_millis(1),
            time_wait: Duration::from_secs(60),
        };
        std::thread::sleep(Duration::from_millis(5));
        let outcome = sweep_session(&mut session, Instant::now(), &timers);
        assert_eq!(outcome, SweepOutcome::Retain);
        assert_eq!(session.state(), SessionState::TimeWait);
    }

    #[test]
    fn time_wait_expiry_evicts() {
        let start = Instant::now();
        let mut session = make_session(start);
        session.set_state(SessionState::TimeWait);

        let timers = Timers {
            keepalive: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            linger: Duration::from_secs(30),
            time_wait: Duration::from_millis(1),
        };
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(sweep_session(&mut session, Instant::now(), &timers), SweepOutcome::Evict);
    }
}
