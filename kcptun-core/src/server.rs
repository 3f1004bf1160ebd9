//! The orchestrator: owns the config, session table, frame pool, packet queues, UDP pump
//! and timers, and runs the cooperative event loop, multiplexing many KCP sessions over a
//! single UDP socket and (optionally) a local TCP listener.

use crate::addr::{AddrRecord, SessionKey};
use crate::config::Config;
use crate::crypto::Codec;
use crate::error::{Error, Result};
use crate::logging::{debug, info, o, warn, Logger};
use crate::msgframe::FramePool;
use crate::queue::{PacketQueue, MQ_RECV_CAP, MQ_SEND_CAP, POOL_CAPACITY};
use crate::scheduler::{self, SweepOutcome, Timers};
use crate::session::{KcpTuning, Session, SessionState, SessionStats, SharedIo};
use crate::session0::{self, Message as S0Message, Rendezvous};
use crate::table::SessionTable;
use crate::tlv;
use crate::udpio::{UdpPump, UdpTuning};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

const TCP_LISTENER_TOKEN: Token = Token(1);
const TCP_STREAM_TOKEN_BASE: usize = 2;

/// The tunnel's operating role: a server accepts KCP conversations and dials out over
/// TCP; a client accepts local TCP connections and dials out over KCP. Most of the packet
/// pipeline is shared; only DIAL handling and session creation differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub struct Server {
    role: Role,
    config: Config,
    log: Logger,

    poll: Poll,
    events: Events,

    udp: UdpPump,
    tcp_listener: Option<TcpListener>,
    /// Maps an `mio` readiness token to the session whose attached `TcpStream` it was
    /// registered for. The stream itself lives inside the `Session`, not here, since a
    /// session exclusively owns its downstream TCP fd.
    tcp_tokens: hashbrown::HashMap<usize, SessionKey>,
    next_tcp_token: usize,

    pool: Rc<RefCell<FramePool>>,
    recv_q: PacketQueue,
    send_q: Rc<RefCell<PacketQueue>>,
    codec: Rc<RefCell<Codec>>,

    table: SessionTable,
    rendezvous: Rendezvous,
    timers: Timers,
    kcp_tuning: KcpTuning,

    /// Where a client's next KCP session dials to. Seeded from `config.kcp_connect`,
    /// later overwritten by a PONG's peer-commit or by the keepalive timer's re-resolve.
    /// `Config` itself stays an immutable snapshot of the file on disk.
    kcp_target: Option<SocketAddr>,

    /// Client-role-only keepalive bookkeeping (`event_timer.c`'s `timer_cb`): last time
    /// any UDP traffic was seen from the server, last time a session-0 PING was sent, and
    /// last time addresses were re-resolved.
    last_server_rx: Instant,
    last_client_ping: Instant,
    last_client_resolve: Instant,

    /// Running totals folded in from sessions evicted mid-window, so a session that's
    /// swept away inside a 30s stats window doesn't lose its contribution.
    stats_total: SessionStats,
    stats_last: SessionStats,
    stats_last_at: Instant,

    epoch: Instant,
    last_sweep: Instant,
    next_conv: u32,
}

impl Server {
    /// Binds the UDP socket (and, for a client, nothing yet; for a server in rendezvous
    /// mode, nothing extra either -- the TCP listener is bound separately via
    /// `bind_tcp_listener` once `listen`/`connect` roles are known) and constructs the
    /// orchestrator. Fatal bind errors propagate.
    pub fn bind(role: Role, config: Config, log: Logger) -> Result<Server> {
        let udp_addr = match role {
            Role::Server => config.kcp_bind.ok_or_else(|| {
                Error::Config("server role requires kcp_bind".to_string())
            })?,
            Role::Client => config.kcp_connect.ok_or_else(|| {
                Error::Config("client role requires kcp_connect".to_string())
            })?,
        };
        let bind_addr = match role {
            Role::Server => udp_addr,
            // A client's UDP socket binds ephemerally and connects-by-convention to the
            // server's address at the session layer (peer is recorded per-session).
            Role::Client => SocketAddr::new(
                if udp_addr.is_ipv4() {
                    "0.0.0.0".parse().unwrap()
                } else {
                    "::".parse().unwrap()
                },
                0,
            ),
        };

        let tuning = UdpTuning {
            sndbuf: config.udp_sndbuf,
            rcvbuf: config.udp_rcvbuf,
        };
        let udp = UdpPump::bind(bind_addr, &tuning, log.new(o!("component" => "udpio")))?;
        let poll = Poll::new()?;
        udp.register(&poll)?;

        let is_server = role == Role::Server;
        let pool = Rc::new(RefCell::new(FramePool::new(POOL_CAPACITY)));
        let send_q = Rc::new(RefCell::new(PacketQueue::send(MQ_SEND_CAP)));
        let codec = Rc::new(RefCell::new(Codec::new(config.key, is_server)));

        let timers = Timers {
            keepalive: Duration::from_secs(config.keepalive_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            linger: Duration::from_secs(config.linger_secs),
            time_wait: Duration::from_secs(config.time_wait_secs),
        };
        let kcp_tuning = KcpTuning {
            mtu: config.kcp.mtu,
            sndwnd: config.kcp.sndwnd,
            rcvwnd: config.kcp.rcvwnd,
            nodelay: config.kcp.nodelay,
            interval: config.kcp.interval,
            resend: config.kcp.resend,
            nc: config.kcp.nc,
            flush: config.kcp.flush,
        };

        let now = Instant::now();
        let kcp_target = config.kcp_connect;
        let mut server = Server {
            role,
            config,
            log,
            poll,
            events: Events::with_capacity(1024),
            udp,
            tcp_listener: None,
            tcp_tokens: hashbrown::HashMap::new(),
            next_tcp_token: TCP_STREAM_TOKEN_BASE,
            pool,
            recv_q: PacketQueue::recv(MQ_RECV_CAP),
            send_q,
            codec,
            table: SessionTable::new(),
            rendezvous: Rendezvous::new(),
            timers,
            kcp_tuning,
            kcp_target,
            last_server_rx: now,
            last_client_ping: now,
            last_client_resolve: now,
            stats_total: SessionStats::default(),
            stats_last: SessionStats::default(),
            stats_last_at: now,
            epoch: now,
            last_sweep: now,
            next_conv: 1,
        };

        // Either role may bind a local TCP listener: a client's listener is the tunnel's
        // public entry point, a server's
        // listener (if present) is a second, directly-reachable entry point alongside its
        // KCP socket. Only a client actually dials out over KCP on accept; a server dials
        // out over plain TCP to `connect` once a DIAL TLV names a conversation.
        if let Some(listen_addr) = server.config.listen {
            server.bind_tcp_listener(listen_addr)?;
        }

        Ok(server)
    }

    fn bind_tcp_listener(&mut self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(&addr).map_err(Error::Bind)?;
        self.poll
            .register(&listener, TCP_LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;
        self.tcp_listener = Some(listener);
        info!(self.log, "tcp listener bound"; "addr" => addr.to_string());
        Ok(())
    }

    fn shared_io(&self) -> SharedIo {
        SharedIo {
            pool: self.pool.clone(),
            send: self.send_q.clone(),
            codec: self.codec.clone(),
        }
    }

    fn fresh_conv(&mut self) -> u32 {
        let conv = self.next_conv;
        self.next_conv = self.next_conv.wrapping_add(1).max(1);
        conv
    }

    /// Runs one iteration of the event loop: polls with a zero timeout (cooperative,
    /// never blocks the caller), pumps UDP in both directions, services TCP readiness,
    /// advances every session's KCP clock, and performs the timer sweep once per
    /// housekeeping interval.
    pub fn tick(&mut self) -> Result<()> {
        self.udp.pump_recv(&mut self.pool.borrow_mut(), &mut self.recv_q);
        self.drain_recv_queue();

        self.poll.poll(&mut self.events, Some(Duration::from_millis(0)))?;
        let events: Vec<_> = self.events.iter().collect();
        for event in events {
            match event.token() {
                TCP_LISTENER_TOKEN => self.accept_tcp()?,
                token if token.0 >= TCP_STREAM_TOKEN_BASE => {
                    self.service_tcp(token.0, event.readiness())
                }
                _ => {}
            }
        }

        let now_ms = crate::time::kcp_now_ms(self.epoch);
        for (_, session) in self.table.iter_mut() {
            let _ = session.update(now_ms);
        }

        self.udp.pump_send(&mut self.pool.borrow_mut(), &mut self.send_q.borrow_mut());

        let now = Instant::now();
        if now.duration_since(self.last_sweep) >= Duration::from_secs(1) {
            self.sweep(now);
            if self.role == Role::Client {
                self.client_keepalive_tick(now);
            }
            self.emit_stats(now);
            self.last_sweep = now;
        }

        Ok(())
    }

    fn drain_recv_queue(&mut self) {
        while let Some(mut frame) = self.recv_q.pop() {
            let peer = match frame.peer {
                Some(p) => p,
                None => {
                    self.pool.borrow_mut().reclaim(frame);
                    continue;
                }
            };
            if self.role == Role::Client {
                self.last_server_rx = Instant::now();
            }
            let len = frame.len();
            let opened = {
                let mut codec = self.codec.borrow_mut();
                codec.open_in_place(frame.full_mut(), len)
            };
            let plain_len = match opened {
                Some(l) => l,
                None => {
                    debug!(self.log, "dropping packet: auth/replay failure"; "peer" => peer.to_string());
                    self.pool.borrow_mut().reclaim(frame);
                    continue;
                }
            };
            let plain = frame.as_slice()[..plain_len].to_vec();
            self.pool.borrow_mut().reclaim(frame);
            self.dispatch_plaintext(peer, &plain);
        }
    }

    /// Mirrors `packet.c`'s `packet_recv_one`: on an unknown `(peer, conv)` a server role
    /// always dials a fresh session (there is no way to distinguish a genuine new DIAL
    /// from a stray packet for an in-flight conversation at this point -- the original
    /// doesn't either). A restarted server spinning up a bogus INIT session for a conv
    /// the peer still thinks is live gets torn down correctly anyway: any non-DIAL TLV on
    /// that fresh INIT session trips `service_session_tlv`'s pre-DIAL guard below, which
    /// now actually sends the peer a session-0 RESET via `reset_session`.
    fn dispatch_plaintext(&mut self, peer: SocketAddr, plain: &[u8]) {
        if session0::is_session0(plain) {
            self.handle_session0(peer, plain);
            return;
        }
        if plain.len() < 4 {
            return;
        }
        let conv = u32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
        let key = SessionKey::new(peer, conv);
        if self.table.get(&key).map(|s| s.state() == SessionState::TimeWait).unwrap_or(false) {
            return;
        }
        if !self.table.contains(&key) {
            if self.role == Role::Server {
                self.accept_new_session(key, peer);
            } else {
                debug!(self.log, "unknown conv on client role, dropping"; "peer" => peer.to_string(), "conv" => conv);
                return;
            }
        }
        let input_ok = match self.table.get_mut(&key) {
            Some(session) => session.input(plain).is_ok(),
            None => false,
        };
        if !input_ok {
            warn!(self.log, "protocol violation, resetting session"; "conv" => conv);
            self.reset_session(&key);
            return;
        }
        if !self.service_session_tlv(&key) {
            warn!(self.log, "malformed tlv, resetting session"; "conv" => conv);
            self.reset_session(&key);
        }
    }

    /// Drains the TLV frames a session's `input()` just unlocked and bridges PUSH/EOF to
    /// the attached TCP socket. Returns `false` if a malformed/oversized TLV, an
    /// out-of-order DIAL, or a pre-DIAL message on a server-side session was encountered,
    /// in which case the caller must reset the session.
    fn service_session_tlv(&mut self, key: &SessionKey) -> bool {
        let mut to_write: Vec<Vec<u8>> = Vec::new();
        let mut saw_eof = false;
        let mut saw_dial = false;
        let mut saw_keepalive = false;
        let parsed_ok = if let Some(session) = self.table.get_mut(key) {
            session
                .poll_tlv(|frame| {
                    match frame {
                        tlv::Frame::Push(payload) => to_write.push(payload.to_vec()),
                        tlv::Frame::Eof => saw_eof = true,
                        tlv::Frame::Dial => saw_dial = true,
                        tlv::Frame::Keepalive => saw_keepalive = true,
                    }
                    Ok(())
                })
                .is_ok()
        } else {
            true
        };
        if !parsed_ok {
            return false;
        }

        let awaiting_dial = self
            .table
            .get(key)
            .map(|s| s.state() == SessionState::Init)
            .unwrap_or(true);

        if saw_dial {
            if self.role != Role::Server {
                warn!(self.log, "unexpected DIAL on client-role session"; "conv" => key.conv());
                return false;
            }
            let already_dialed = self.table.get(key).map(|s| s.tcp().is_some()).unwrap_or(false);
            if already_dialed {
                warn!(self.log, "duplicate DIAL, resetting"; "conv" => key.conv());
                return false;
            }
            self.dial_tcp(key);
        } else if self.role == Role::Server
            && awaiting_dial
            && (!to_write.is_empty() || saw_eof || saw_keepalive)
        {
            warn!(self.log, "tlv received before dial, resetting"; "conv" => key.conv());
            return false;
        }

        if saw_keepalive && self.role == Role::Server {
            if let Some(session) = self.table.get_mut(key) {
                let _ = session.send_tlv(&tlv::Frame::Keepalive);
            }
        }
        if let Some(session) = self.table.get_mut(key) {
            for payload in to_write {
                let _ = session.pump_tcp_write(&payload);
            }
            if saw_eof {
                session.set_state(SessionState::Linger);
                session.close_tcp();
            }
        }
        true
    }

    /// Initiates a non-blocking downstream connect for a session that just received
    /// DIAL. Registers for both readable and writable readiness: per §4.6, a non-blocking
    /// `connect` that returns without error is merely *in progress*, not complete --
    /// completion is decided by `finish_tcp_connect`'s `SO_ERROR` check once the socket
    /// reports writable.
    fn dial_tcp(&mut self, key: &SessionKey) {
        let target = match self.config.connect {
            Some(t) => t,
            None => return,
        };
        match TcpStream::connect(&target) {
            Ok(stream) => {
                let token = Token(self.next_tcp_token);
                self.next_tcp_token += 1;
                let registered = self
                    .poll
                    .register(&stream, token, Ready::readable() | Ready::writable(), PollOpt::edge())
                    .is_ok();
                if registered {
                    if let Some(session) = self.table.get_mut(key) {
                        session.begin_tcp_connect(stream);
                        self.tcp_tokens.insert(token.0, *key);
                    }
                }
            }
            Err(e) => {
                warn!(self.log, "dial failed"; "target" => target.to_string(), "error" => e.to_string());
                self.reset_session(key);
            }
        }
    }

    fn accept_tcp(&mut self) -> Result<()> {
        let listener = match &self.tcp_listener {
            Some(l) => l,
            None => return Ok(()),
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.role == Role::Client {
                        self.new_client_session(stream, peer)?;
                    } else {
                        debug!(self.log, "ignoring direct tcp connection on server role listener"; "peer" => peer.to_string());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// A fresh local TCP client connected; dials out over KCP to the configured
    /// `kcp_connect` target, creating a new session and sending the initial DIAL TLV.
    fn new_client_session(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let kcp_peer = self
            .kcp_target
            .ok_or_else(|| Error::Config("missing kcp_connect for client role".to_string()))?;
        let conv = self.fresh_conv();
        let key = SessionKey::new(kcp_peer, conv);

        let io = self.shared_io();
        let log = self.log.new(o!("component" => "session"));
        let mut session = Session::new(key, kcp_peer, false, &self.kcp_tuning, io, Instant::now(), log);
        session.attach_tcp(stream);
        session.set_state(SessionState::Connect);
        let _ = session.send_tlv(&tlv::Frame::Dial);

        let token = Token(self.next_tcp_token);
        self.next_tcp_token += 1;
        if let Some(tcp) = session.tcp() {
            self.poll
                .register(tcp, token, Ready::readable(), PollOpt::edge())?;
        }
        self.tcp_tokens.insert(token.0, key);
        self.table.insert(session);

        debug!(self.log, "new client session dialed"; "conv" => conv, "peer" => peer.to_string());
        Ok(())
    }

    fn service_tcp(&mut self, token: usize, readiness: Ready) {
        let key = match self.tcp_tokens.get(&token) {
            Some(key) => *key,
            None => return,
        };
        let connecting = self
            .table
            .get(&key)
            .map(|s| s.tcp_connecting())
            .unwrap_or(false);
        if connecting {
            if readiness.is_writable() {
                self.finish_dial(&key, token);
            }
            return;
        }
        if let Some(session) = self.table.get_mut(&key) {
            let _ = session.pump_tcp_read();
        }
    }

    /// A pending outbound connect's socket became writable: resolves `SO_ERROR` to decide
    /// between CONNECTED and a reset, then drops the now-unneeded writable interest.
    fn finish_dial(&mut self, key: &SessionKey, token: usize) {
        let result = match self.table.get_mut(key) {
            Some(session) => session.finish_tcp_connect(),
            None => return,
        };
        match result {
            Ok(()) => {
                if let Some(session) = self.table.get(key) {
                    if let Some(tcp) = session.tcp() {
                        let _ = self.poll.reregister(
                            tcp,
                            Token(token),
                            Ready::readable(),
                            PollOpt::edge(),
                        );
                    }
                }
            }
            Err(e) => {
                warn!(self.log, "downstream connect failed"; "conv" => key.conv(), "error" => e.to_string());
                self.reset_session(key);
            }
        }
    }

    /// Creates a fresh, unconnected server-side session for a conversation id the table
    /// hasn't seen before (§4.4.1a). Its `tcp_state` stays INIT until a DIAL TLV arrives;
    /// any other first message is a protocol violation and resets the session right back.
    fn accept_new_session(&mut self, key: SessionKey, peer: SocketAddr) {
        let io = self.shared_io();
        let log = self.log.new(o!("component" => "session"));
        let session = Session::new(key, peer, true, &self.kcp_tuning, io, Instant::now(), log);
        self.table.insert(session);
        debug!(self.log, "new server session accepted"; "conv" => key.conv(), "peer" => peer.to_string());
    }

    fn handle_session0(&mut self, peer: SocketAddr, plain: &[u8]) {
        let msg = match session0::parse(plain) {
            Ok(m) => m,
            Err(e) => {
                debug!(self.log, "bad session-0 message"; "peer" => peer.to_string(), "error" => e.to_string());
                return;
            }
        };
        match msg {
            S0Message::Ping { tstamp } => self.send_session0(peer, S0Message::Pong { tstamp }),
            S0Message::Pong { tstamp } => self.handle_pong(peer, tstamp),
            S0Message::Keepalive { tstamp } => {
                self.send_session0(peer, S0Message::Keepalive { tstamp })
            }
            S0Message::Reset { conv } => {
                let key = SessionKey::new(peer, conv);
                self.reset_session(&key);
            }
            S0Message::Listen { addr } => self.rendezvous.listen(peer, addr),
            S0Message::Connect { addr } => {
                if let Some(addr_self) = self.local_addr_record(peer) {
                    if let Some(punches) = self.rendezvous.connect(peer, addr_self, addr) {
                        for (dest, msg) in punches {
                            self.send_session0(dest, msg);
                        }
                    }
                }
            }
            S0Message::Punch { a, b } => {
                // A rendezvous client receiving PUNCH begins sending PING to both
                // advertised addresses to open its NAT mapping.
                self.send_session0(a.0, S0Message::Ping { tstamp: crate::time::now_ms() });
                self.send_session0(b.0, S0Message::Ping { tstamp: crate::time::now_ms() });
            }
        }
    }

    fn local_addr_record(&self, from: SocketAddr) -> Option<AddrRecord> {
        Some(AddrRecord(from))
    }

    /// A PONG closes the PING round trip. In rendezvous-client mode (the only mode where
    /// a bare, session-less PONG is meaningful) this commits `peer` as the kcp-connect
    /// target for the next dialed session, per §4.5 -- the address PUNCH opened up is now
    /// known reachable.
    fn handle_pong(&mut self, peer: SocketAddr, tstamp: u32) {
        let rtt_ms = crate::time::now_ms().wrapping_sub(tstamp);
        if self.role != Role::Client {
            return;
        }
        let was_target = self.kcp_target;
        self.kcp_target = Some(peer);
        if was_target != Some(peer) {
            info!(self.log, "kcp-connect target committed from pong"; "peer" => peer.to_string(), "rtt_ms" => rtt_ms);
        } else {
            debug!(self.log, "pong rtt"; "peer" => peer.to_string(), "rtt_ms" => rtt_ms);
        }
    }

    fn send_session0(&mut self, dest: SocketAddr, msg: S0Message) {
        let mut plain = Vec::new();
        if msg.write_to(&mut plain).is_err() {
            return;
        }
        let mut frame = match self.pool.borrow_mut().checkout() {
            Some(f) => f,
            None => {
                warn!(self.log, "frame pool exhausted sending session-0 message");
                return;
            }
        };
        let overhead = self.codec.borrow().overhead();
        if plain.len() + overhead > frame.capacity() {
            self.pool.borrow_mut().reclaim(frame);
            return;
        }
        {
            let full = frame.full_mut();
            full[..plain.len()].copy_from_slice(&plain);
            let sealed_len = self.codec.borrow_mut().seal_in_place(full, plain.len());
            frame.set_len(sealed_len);
        }
        frame.peer = Some(dest);
        if let Err(returned) = self.send_q.borrow_mut().push(frame) {
            warn!(self.log, "send queue full, dropping session-0 message");
            self.pool.borrow_mut().reclaim(returned);
        }
    }

    /// Moves a session to TIME_WAIT in place rather than dropping it from the table
    /// immediately: a reset session stays addressable through its `time_wait` window, so
    /// a second RESET for the same (peer, conv) observes it already in TIME_WAIT rather
    /// than "no such session". Idempotent: a session already in TIME_WAIT is left
    /// untouched.
    ///
    /// Mirrors `event_kcp.c`'s `kcp_reset`: an outbound session-0 RESET is sent to the
    /// peer only when the session was actually live (CONNECT/CONNECTED) when the reset
    /// happened -- never for a session still in INIT (nothing to tear down on the far
    /// side yet) and never for a session already LINGER/TIME_WAIT (that path already
    /// notified, or is winding down cleanly via EOF, not a protocol violation).
    fn reset_session(&mut self, key: &SessionKey) {
        let notify = match self.table.get_mut(key) {
            Some(session) if session.state() != SessionState::TimeWait => {
                let should_notify =
                    matches!(session.state(), SessionState::Connect | SessionState::Connected);
                session.close_tcp();
                let peer = session.peer();
                session.set_state(SessionState::TimeWait);
                if should_notify {
                    Some(peer)
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(peer) = notify {
            warn!(self.log, "session reset, sending session-0 reset"; "conv" => key.conv(), "peer" => peer.to_string());
            self.send_session0(peer, S0Message::Reset { conv: key.conv() });
        }
    }

    /// Runs `scheduler::sweep_session` over every live session: CONNECTED sessions emit a
    /// keepalive TLV in place, LINGER sessions age into TIME_WAIT in place, and anything
    /// the sweep marks `Reset` or `Evict` is handled after the iteration (the reset path
    /// needs `&mut self`, which can't coexist with the live `table.iter_mut()` borrow).
    fn sweep(&mut self, now: Instant) {
        let timers = self.timers;
        let mut reset_keys = Vec::new();
        let mut evict_keys = Vec::new();
        for (key, session) in self.table.iter_mut() {
            match scheduler::sweep_session(session, now, &timers) {
                SweepOutcome::Retain => {}
                SweepOutcome::Reset => reset_keys.push(*key),
                SweepOutcome::Evict => evict_keys.push(*key),
            }
        }
        for key in reset_keys {
            self.reset_session(&key);
        }
        for key in evict_keys {
            if let Some(mut session) = self.table.remove(&key) {
                self.stats_total = add_stats(self.stats_total, session.stats());
                session.close_tcp();
            }
        }
    }

    /// Client-only keepalive timer, modeled on `event_timer.c`'s `timer_cb`: if no UDP
    /// traffic has been seen from the server for more than `keepalive`, emit a session-0
    /// PING; if it's been silent for more than 3x `keepalive`, re-resolve the peer address
    /// and reinitialize the send nonce, independently rate-limited so the two branches
    /// don't have to coincide.
    fn client_keepalive_tick(&mut self, now: Instant) {
        let keepalive = self.timers.keepalive;
        if keepalive.is_zero() {
            return;
        }
        let idle = now.duration_since(self.last_server_rx);
        let resolve_timeout = keepalive * 3;
        if idle > resolve_timeout && now.duration_since(self.last_client_resolve) > resolve_timeout {
            if let Some(target) = self.config.kcp_connect {
                debug!(self.log, "remote not seen, re-resolving and resetting send nonce"; "idle_secs" => idle.as_secs());
                self.kcp_target = Some(target);
            }
            self.codec.borrow_mut().reset_send_nonce();
            self.last_client_resolve = now;
        }
        if now.duration_since(self.last_client_ping) < keepalive {
            return;
        }
        if let Some(target) = self.kcp_target {
            self.send_session0(target, S0Message::Ping { tstamp: crate::time::now_ms() });
            self.last_client_ping = now;
        }
    }

    fn current_stats_total(&self) -> SessionStats {
        let mut total = self.stats_total;
        for (_, session) in self.table.iter() {
            total = add_stats(total, session.stats());
        }
        total
    }

    /// Every 30s, logs per-direction KiB/s and the tcp-bytes/udp-bytes efficiency ratio
    /// across every session this process has ever carried, live or evicted.
    fn emit_stats(&mut self, now: Instant) {
        if now.duration_since(self.stats_last_at) < Duration::from_secs(30) {
            return;
        }
        let total = self.current_stats_total();
        let elapsed = now.duration_since(self.stats_last_at).as_secs_f64().max(1.0);
        let kibps = |then: u64, nowv: u64| -> f64 {
            (nowv.saturating_sub(then) as f64 / 1024.0) / elapsed
        };
        let tcp_rx_kibps = kibps(self.stats_last.tcp_rx, total.tcp_rx);
        let tcp_tx_kibps = kibps(self.stats_last.tcp_tx, total.tcp_tx);
        let kcp_rx_kibps = kibps(self.stats_last.kcp_rx, total.kcp_rx);
        let kcp_tx_kibps = kibps(self.stats_last.kcp_tx, total.kcp_tx);
        let tcp_bytes = total.tcp_rx + total.tcp_tx;
        let kcp_bytes = total.kcp_rx + total.kcp_tx;
        let efficiency = if kcp_bytes > 0 {
            tcp_bytes as f64 / kcp_bytes as f64
        } else {
            1.0
        };
        debug!(self.log, "link stats";
            "tcp_rx_kibps" => format!("{:.2}", tcp_rx_kibps),
            "tcp_tx_kibps" => format!("{:.2}", tcp_tx_kibps),
            "kcp_rx_kibps" => format!("{:.2}", kcp_rx_kibps),
            "kcp_tx_kibps" => format!("{:.2}", kcp_tx_kibps),
            "efficiency" => format!("{:.3}", efficiency));
        self.stats_last = total;
        self.stats_last_at = now;
    }
}

fn add_stats(a: SessionStats, b: SessionStats) -> SessionStats {
    SessionStats {
        tcp_rx: a.tcp_rx + b.tcp_rx,
        tcp_tx: a.tcp_tx + b.tcp_tx,
        kcp_rx: a.kcp_rx + b.kcp_rx,
        kcp_tx: a.kcp_tx + b.kcp_tx,
    }
}

