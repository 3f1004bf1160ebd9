//! UDP I/O pump: registers one `mio::net::UdpSocket` and drains/fills it in batches each
//! tick. `socket2` sets the socket's send/receive buffer sizes before it is handed to
//! `mio`.

use crate::error::{Error, Result};
use crate::logging::{debug, warn, Logger};
use crate::msgframe::FramePool;
use crate::queue::PacketQueue;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Poll, PollOpt, Ready, Token};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;

pub const UDP_TOKEN: Token = Token(0);

pub struct UdpTuning {
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
}

impl Default for UdpTuning {
    fn default() -> UdpTuning {
        UdpTuning {
            sndbuf: None,
            rcvbuf: None,
        }
    }
}

/// Owns the single UDP socket this process binds (one per process: the tunnel
/// multiplexes every session over it). Batches reads into the recv queue and writes from
/// the send queue, degrading gracefully to one-message-at-a-time syscalls since `mio`
/// 0.6's `UdpSocket` exposes no vectored `recvmmsg`/`sendmmsg`.
pub struct UdpPump {
    socket: MioUdpSocket,
    log: Logger,
}

impl UdpPump {
    pub fn bind(addr: SocketAddr, tuning: &UdpTuning, log: Logger) -> Result<UdpPump> {
        let domain = if addr.is_ipv4() {
            Domain::ipv4()
        } else {
            Domain::ipv6()
        };
        let sock2 = Socket::new(domain, Type::dgram(), None).map_err(Error::Bind)?;
        if let Some(sz) = tuning.rcvbuf {
            sock2.set_recv_buffer_size(sz).map_err(Error::Bind)?;
        }
        if let Some(sz) = tuning.sndbuf {
            sock2.set_send_buffer_size(sz).map_err(Error::Bind)?;
        }
        sock2.set_nonblocking(true).map_err(Error::Bind)?;
        sock2.bind(&addr.into()).map_err(Error::Bind)?;

        let socket = MioUdpSocket::from_socket(sock2.into_udp_socket()).map_err(Error::Bind)?;
        Ok(UdpPump { socket, log })
    }

    pub fn register(&self, poll: &Poll) -> Result<()> {
        poll.register(&self.socket, UDP_TOKEN, Ready::readable(), PollOpt::edge())?;
        Ok(())
    }

    pub fn reregister(&self, poll: &Poll) -> Result<()> {
        poll.reregister(
            &self.socket,
            UDP_TOKEN,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )?;
        Ok(())
    }

    /// Drains the socket into `recv` until it would block, the pool is exhausted, or the
    /// recv array is full -- at which point the reader yields for this tick.
    pub fn pump_recv(&self, pool: &mut FramePool, recv: &mut PacketQueue) {
        loop {
            if recv.is_full() {
                break;
            }
            let mut frame = match pool.checkout() {
                Some(f) => f,
                None => {
                    warn!(self.log, "frame pool exhausted, yielding recv pump");
                    break;
                }
            };
            let result = self.socket.recv_from(frame.full_mut());
            match result {
                Ok((len, peer)) => {
                    frame.set_len(len);
                    frame.peer = Some(peer);
                    if recv.push(frame).is_err() {
                        // Can't happen: checked is_full above, but handle defensively by
                        // reclaiming rather than leaking the checked-out frame.
                        pool.reclaim(recv.pop().unwrap());
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    pool.reclaim(frame);
                    break;
                }
                Err(_) => {
                    // Transient I/O: never logged.
                    pool.reclaim(frame);
                    break;
                }
            }
        }
    }

    /// Flushes queued outbound frames until the socket would block, returning them to the
    /// pool as they're sent. On `WouldBlock`, the frame about to be sent is pushed back to
    /// the head of the queue and the batch stops; any other persistent error drops the whole
    /// remaining send array to avoid a head-of-line stall.
    pub fn pump_send(&self, pool: &mut FramePool, send: &mut PacketQueue) {
        while let Some(frame) = send.pop() {
            let peer = match frame.peer {
                Some(p) => p,
                None => {
                    debug!(self.log, "outbound frame missing peer address, dropping");
                    pool.reclaim(frame);
                    continue;
                }
            };
            match self.socket.send_to(frame.as_slice(), &peer) {
                Ok(_) => pool.reclaim(frame),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    send.push_front(frame);
                    break;
                }
                Err(e) => {
                    warn!(self.log, "persistent send error, dropping send queue"; "error" => e.to_string());
                    pool.reclaim(frame);
                    while let Some(remaining) = send.pop() {
                        pool.reclaim(remaining);
                    }
                    break;
                }
            }
        }
    }
}
