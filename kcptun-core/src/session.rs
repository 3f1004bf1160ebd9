//! The per-conversation `Session`: a KCP control block bridged to one downstream TCP
//! socket, carrying its own read/write buffers, last-ingress/egress timestamps and a
//! child logger. `KcpOutput` adapts the `kcp` crate's `Output: Write` generic to a small
//! `Write`-implementing type that seals each flushed segment into a `MessageFrame` and
//! enqueues it on the shared send queue.

use crate::addr::SessionKey;
use crate::crypto::Codec;
use crate::logging::{debug, o, warn, Logger};
use crate::msgframe::FramePool;
use crate::queue::PacketQueue;
use crate::tlv;
use kcp::Kcp;
use mio::net::TcpStream;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

/// Per-direction reassembly buffer size for a session's TLV stream. A TLV whose declared
/// length exceeds this must reset the session rather than be partially buffered.
pub const SESSION_BUF_SIZE: usize = 16384;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Init,
    Connect,
    Connected,
    Linger,
    TimeWait,
}

/// Shared, reference-counted access to the server's single frame pool, send queue and
/// AEAD codec. All three are process-wide singletons (one key, one nonce sequence, one
/// pool) that every session's KCP output callback must reach into; `Rc<RefCell<_>>` is the
/// idiomatic single-threaded substitute for the raw back-pointer the design notes warn
/// against, since the event loop never re-enters across threads.
#[derive(Clone)]
pub struct SharedIo {
    pub pool: Rc<RefCell<FramePool>>,
    pub send: Rc<RefCell<PacketQueue>>,
    pub codec: Rc<RefCell<Codec>>,
}

/// Adapts the `kcp` crate's `Output: Write` generic to the packet pipeline: every buffer
/// KCP flushes is sealed in place and pushed onto the shared send queue addressed to this
/// session's peer.
pub struct KcpOutput {
    peer: SocketAddr,
    io: SharedIo,
    stats: Rc<RefCell<SessionStats>>,
    log: Logger,
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stats.borrow_mut().kcp_tx += buf.len() as u64;
        let overhead = self.io.codec.borrow().overhead();
        let mut frame = match self.io.pool.borrow_mut().checkout() {
            Some(f) => f,
            None => {
                warn!(self.log, "frame pool exhausted, dropping kcp output");
                return Ok(buf.len());
            }
        };
        if buf.len() + overhead > frame.capacity() {
            self.io.pool.borrow_mut().reclaim(frame);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "kcp segment too large"));
        }
        {
            let full = frame.full_mut();
            full[..buf.len()].copy_from_slice(buf);
            let sealed_len = self.io.codec.borrow_mut().seal_in_place(full, buf.len());
            frame.set_len(sealed_len);
        }
        frame.peer = Some(self.peer);

        if let Err(returned) = self.io.send.borrow_mut().push(frame) {
            warn!(self.log, "send queue full, dropping kcp output");
            self.io.pool.borrow_mut().reclaim(returned);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct KcpTuning {
    pub mtu: usize,
    pub sndwnd: u16,
    pub rcvwnd: u16,
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub nc: bool,
    /// Whether to eagerly call `ikcp_flush` right after a successful `send`, trading an
    /// extra syscall-free flush for lower latency instead of waiting for the next tick.
    pub flush: bool,
}

impl Default for KcpTuning {
    fn default() -> KcpTuning {
        KcpTuning {
            mtu: 1400,
            sndwnd: 256,
            rcvwnd: 256,
            nodelay: true,
            interval: 10,
            resend: 2,
            nc: true,
            flush: true,
        }
    }
}

/// Per-session link byte counters, bumped on the TCP and KCP/UDP data paths. Used by the
/// server's 30-second stats pass to compute per-direction throughput and the
/// tcp-bytes/udp-bytes efficiency ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub tcp_rx: u64,
    pub tcp_tx: u64,
    pub kcp_rx: u64,
    pub kcp_tx: u64,
}

/// One multiplexed KCP conversation, paired with the TCP socket it bridges to (a local
/// listener's accepted client on the server side, or a dial target on the client side).
pub struct Session {
    key: SessionKey,
    peer: SocketAddr,
    kcp: Kcp<KcpOutput>,
    tcp: Option<TcpStream>,
    tcp_connecting: bool,
    pending_tcp_write: Vec<u8>,
    state: SessionState,
    wbuf: Vec<u8>,
    wbuf_flush: usize,
    rbuf: Vec<u8>,
    last_rx: Instant,
    last_tx_keepalive: Instant,
    state_since: Instant,
    flush: bool,
    stats: Rc<RefCell<SessionStats>>,
    log: Logger,
}

impl Session {
    pub fn new(
        key: SessionKey,
        peer: SocketAddr,
        is_server: bool,
        tuning: &KcpTuning,
        io: SharedIo,
        now: Instant,
        log: Logger,
    ) -> Session {
        let conv = key.conv();
        let session_log = log.new(o!("conv" => conv, "peer" => peer.to_string()));
        let stats = Rc::new(RefCell::new(SessionStats::default()));
        let output = KcpOutput {
            peer,
            io,
            stats: stats.clone(),
            log: session_log.new(o!("role" => if is_server { "server" } else { "client" })),
        };
        let mut kcp = Kcp::new(conv, output);
        kcp.set_mtu(tuning.mtu).expect("mtu within kcp limits");
        kcp.set_wndsize(tuning.sndwnd, tuning.rcvwnd);
        kcp.set_nodelay(tuning.nodelay, tuning.interval, tuning.resend, tuning.nc);

        Session {
            key,
            peer,
            kcp,
            tcp: None,
            tcp_connecting: false,
            pending_tcp_write: Vec::new(),
            state: SessionState::Init,
            wbuf: Vec::with_capacity(SESSION_BUF_SIZE),
            wbuf_flush: 0,
            rbuf: Vec::with_capacity(SESSION_BUF_SIZE),
            last_rx: now,
            last_tx_keepalive: now,
            state_since: now,
            flush: tuning.flush,
            stats,
            log: session_log,
        }
    }

    /// A snapshot of this session's cumulative link byte counters.
    #[inline]
    pub fn stats(&self) -> SessionStats {
        *self.stats.borrow()
    }

    #[inline]
    pub fn key(&self) -> SessionKey {
        self.key
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: SessionState) {
        debug!(self.log, "session state change"; "from" => format!("{:?}", self.state), "to" => format!("{:?}", state));
        self.state = state;
        self.state_since = Instant::now();
    }

    /// How long the session has held its current `tcp_state`/`kcp_state` pair. The
    /// timeout sweep measures LINGER/TIME_WAIT expiry from this, not from `last_rx`,
    /// so a session reset straight out of CONNECT doesn't inherit CONNECTED's timeout
    /// budget before TIME_WAIT can expire it.
    pub fn since_state_change(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.state_since)
    }

    /// Attaches an already-established TCP socket (the client's locally-accepted
    /// connection) and moves straight to CONNECTED.
    pub fn attach_tcp(&mut self, stream: TcpStream) {
        self.tcp = Some(stream);
        self.tcp_connecting = false;
        self.set_state(SessionState::Connected);
    }

    /// Attaches a freshly-initiated non-blocking outbound TCP connect (the server's
    /// downstream dial): the session sits in CONNECT until the socket reports writable
    /// and `finish_tcp_connect` confirms success via `SO_ERROR`.
    pub fn begin_tcp_connect(&mut self, stream: TcpStream) {
        self.tcp = Some(stream);
        self.tcp_connecting = true;
        self.set_state(SessionState::Connect);
    }

    #[inline]
    pub fn tcp_connecting(&self) -> bool {
        self.tcp_connecting
    }

    /// Called when the pending outbound connect's socket becomes writable. Checks
    /// `SO_ERROR` to decide whether the connect succeeded; on success transitions to
    /// CONNECTED, on failure returns the error for the caller to reset the session.
    pub fn finish_tcp_connect(&mut self) -> io::Result<()> {
        let err = match self.tcp.as_ref() {
            Some(stream) => stream.take_error()?,
            None => return Ok(()),
        };
        match err {
            None => {
                self.tcp_connecting = false;
                self.set_state(SessionState::Connected);
                if !self.pending_tcp_write.is_empty() {
                    let pending = std::mem::take(&mut self.pending_tcp_write);
                    if let Some(stream) = self.tcp.as_mut() {
                        stream.write_all(&pending)?;
                    }
                }
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    #[inline]
    pub fn tcp(&self) -> Option<&TcpStream> {
        self.tcp.as_ref()
    }

    /// Feeds a cleartext KCP-layer datagram (already opened by the caller) into the ARQ
    /// state machine.
    pub fn input(&mut self, buf: &[u8]) -> kcp::KcpResult<usize> {
        self.last_rx = Instant::now();
        self.stats.borrow_mut().kcp_rx += buf.len() as u64;
        self.kcp.input(buf)
    }

    pub fn update(&mut self, now_ms: u32) -> kcp::KcpResult<()> {
        self.kcp.update(now_ms)
    }

    pub fn check(&self, now_ms: u32) -> u32 {
        self.kcp.check(now_ms)
    }

    /// Drains every complete TLV frame currently sitting in KCP's recv buffer, invoking
    /// `handler` for each. Returns an error if a frame is malformed or oversized, in which
    /// case the caller must reset this session.
    pub fn poll_tlv<F: FnMut(tlv::Frame) -> io::Result<()>>(
        &mut self,
        mut handler: F,
    ) -> Result<(), tlv::TlvError> {
        loop {
            let size = match self.kcp.peeksize() {
                Ok(s) => s,
                Err(_) => return Ok(()),
            };
            let mut tmp = vec![0u8; size];
            if self.kcp.recv(&mut tmp).is_err() {
                return Ok(());
            }
            self.rbuf.extend_from_slice(&tmp);

            loop {
                match tlv::parse(&self.rbuf, SESSION_BUF_SIZE)? {
                    Some((frame, consumed)) => {
                        let _ = handler(frame);
                        self.rbuf.drain(..consumed);
                    }
                    None => break,
                }
            }
        }
    }

    /// Queues a TLV frame for transmission: appends to the write buffer, then flushes as
    /// much as fits into KCP's own send window.
    pub fn send_tlv(&mut self, frame: &tlv::Frame) -> io::Result<()> {
        if self.wbuf.len() + frame.encoded_len() > SESSION_BUF_SIZE {
            return Err(io::Error::new(io::ErrorKind::Other, "session write buffer full"));
        }
        frame.write_to(&mut self.wbuf)?;
        self.flush_wbuf()
    }

    fn flush_wbuf(&mut self) -> io::Result<()> {
        let pending = &self.wbuf[self.wbuf_flush..];
        if pending.is_empty() {
            return Ok(());
        }
        match self.kcp.send(pending) {
            Ok(_) => {
                self.wbuf.clear();
                self.wbuf_flush = 0;
                if self.flush {
                    let _ = self.kcp.flush();
                }
                Ok(())
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::WouldBlock, "kcp send window full")),
        }
    }

    /// Pumps bytes from the attached TCP socket into the session's outbound KCP stream,
    /// wrapping each read as one PUSH TLV. Called when the TCP fd is readable.
    pub fn pump_tcp_read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        if let Some(stream) = self.tcp.as_mut() {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        self.send_tlv(&tlv::Frame::Eof)?;
                        break;
                    }
                    Ok(n) => {
                        total += n;
                        self.stats.borrow_mut().tcp_rx += n as u64;
                        self.send_tlv(&tlv::Frame::Push(&buf[..n]))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(total)
    }

    /// Writes `data` (a PUSH TLV's payload) to the attached downstream TCP socket. While a
    /// dial is still in flight (or no socket is attached yet), the bytes are buffered and
    /// flushed once `finish_tcp_connect` confirms the connect succeeded -- otherwise a PUSH
    /// arriving in the same batch as DIAL would be silently dropped.
    pub fn pump_tcp_write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.tcp_connecting || self.tcp.is_none() {
            self.pending_tcp_write.extend_from_slice(data);
            return Ok(());
        }
        if let Some(stream) = self.tcp.as_mut() {
            stream.write_all(data)?;
            self.stats.borrow_mut().tcp_tx += data.len() as u64;
        }
        Ok(())
    }

    pub fn close_tcp(&mut self) {
        if let Some(stream) = self.tcp.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.last_rx)
    }

    pub fn mark_keepalive_sent(&mut self, now: Instant) {
        self.last_tx_keepalive = now;
    }

    pub fn since_last_keepalive(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.last_tx_keepalive)
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, Codec};
    use crate::msgframe::FramePool;
    use crate::queue::PacketQueue;

    fn make_io() -> SharedIo {
        let key = crypto::generate_key();
        SharedIo {
            pool: Rc::new(RefCell::new(FramePool::new(16))),
            send: Rc::new(RefCell::new(PacketQueue::new(16))),
            codec: Rc::new(RefCell::new(Codec::new(key, true))),
        }
    }

    #[test]
    fn new_session_starts_in_init() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let key = SessionKey::new(peer, 7);
        let log = crate::logging::root_logger(crate::logging::Verbosity::Quiet);
        let session = Session::new(key, peer, true, &KcpTuning::default(), make_io(), Instant::now(), log);
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.key().conv(), 7);
    }

    #[test]
    fn pump_tcp_write_buffers_while_not_connected() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let key = SessionKey::new(peer, 3);
        let log = crate::logging::root_logger(crate::logging::Verbosity::Quiet);
        let mut session = Session::new(key, peer, true, &KcpTuning::default(), make_io(), Instant::now(), log);

        assert!(session.tcp().is_none());
        session.pump_tcp_write(b"hello").unwrap();
        assert_eq!(session.pending_tcp_write, b"hello");
    }

    #[test]
    fn send_tlv_enqueues_kcp_output() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let key = SessionKey::new(peer, 1);
        let log = crate::logging::root_logger(crate::logging::Verbosity::Quiet);
        let io = make_io();
        let mut session = Session::new(key, peer, true, &KcpTuning::default(), io.clone(), Instant::now(), log);

        session.send_tlv(&tlv::Frame::Push(b"hi")).unwrap();
        session.update(0).unwrap();
        assert!(io.send.borrow().len() > 0 || io.pool.borrow().available() < 16);
    }
}
