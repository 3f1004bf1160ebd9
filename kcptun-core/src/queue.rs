//! Bounded recv/send arrays over the frame pool.

use crate::msgframe::{FramePool, MessageFrame};
use std::collections::VecDeque;

/// The UDP reader yields (stops draining the socket for this tick) once this many frames
/// are queued for session dispatch.
pub const MQ_RECV_CAP: usize = 256;

/// Producers (sessions, session-0 replies) test-and-enqueue; enqueueing past this cap
/// drops the frame with a rate-limited WARNING rather than growing the queue unbounded.
pub const MQ_SEND_CAP: usize = 256;

/// Total frames the pool is constructed with. Sized so the recv array, the send array and
/// in-flight KCP output frames can never simultaneously exceed it.
pub const POOL_CAPACITY: usize = 512;

/// A bounded FIFO of checked-out `MessageFrame`s. Shared structure for both the recv and
/// send directions; which cap applies is passed in at construction.
pub struct PacketQueue {
    frames: VecDeque<MessageFrame>,
    cap: usize,
}

impl PacketQueue {
    pub fn new(cap: usize) -> PacketQueue {
        PacketQueue {
            frames: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn recv(cap: usize) -> PacketQueue {
        PacketQueue::new(cap)
    }

    pub fn send(cap: usize) -> PacketQueue {
        PacketQueue::new(cap)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.cap
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Enqueues `frame`, returning it back on failure (queue full) so the caller can
    /// reclaim it into the pool and log the drop.
    pub fn push(&mut self, frame: MessageFrame) -> Result<(), MessageFrame> {
        if self.is_full() {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Puts `frame` back at the head of the queue, ignoring the cap: used to undo a `pop`
    /// when a transient I/O error (would-block, interrupted) means the batch must stop
    /// without discarding the frame it was about to send.
    pub fn push_front(&mut self, frame: MessageFrame) {
        self.frames.push_front(frame);
    }

    pub fn pop(&mut self) -> Option<MessageFrame> {
        self.frames.pop_front()
    }

    /// Drains every queued frame back into `pool`, as the event loop does at the top of
    /// each tick before the next batch of I/O.
    pub fn drain_into(&mut self, pool: &mut FramePool) {
        for frame in self.frames.drain(..) {
            pool.reclaim(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_respects_cap() {
        let mut pool = FramePool::new(4);
        let mut q = PacketQueue::new(2);

        assert!(q.push(pool.checkout().unwrap()).is_ok());
        assert!(q.push(pool.checkout().unwrap()).is_ok());
        assert!(q.is_full());

        let rejected = pool.checkout().unwrap();
        assert!(q.push(rejected).is_err());
    }

    #[test]
    fn pop_is_fifo() {
        let mut pool = FramePool::new(4);
        let mut q = PacketQueue::new(4);

        let mut first = pool.checkout().unwrap();
        first.copy_from("127.0.0.1:1".parse().unwrap(), b"a");
        let mut second = pool.checkout().unwrap();
        second.copy_from("127.0.0.1:2".parse().unwrap(), b"b");

        q.push(first).unwrap();
        q.push(second).unwrap();

        assert_eq!(q.pop().unwrap().as_slice(), b"a");
        assert_eq!(q.pop().unwrap().as_slice(), b"b");
        assert!(q.pop().is_none());
    }

    #[test]
    fn drain_into_returns_frames_to_pool() {
        let mut pool = FramePool::new(2);
        let mut q = PacketQueue::new(2);
        q.push(pool.checkout().unwrap()).unwrap();
        q.push(pool.checkout().unwrap()).unwrap();
        assert_eq!(pool.available(), 0);

        q.drain_into(&mut pool);
        assert_eq!(pool.available(), 2);
        assert!(q.is_empty());
    }
}
