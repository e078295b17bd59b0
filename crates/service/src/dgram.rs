//! The unreliable datagram transport.
//!
//! Messages ride the same SAL and resolution plumbing as the stream
//! transport, but with no flows, no retransmission and no ordering:
//! every send resolves the destination service-id at that moment, and
//! delivery hands whole messages to the socket bound to the destination
//! id.

use crate::{Error, StackInner};

use std::{
    collections::VecDeque,
    sync::Weak,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use codec::{FlowId, ServiceId, sal::{SalHeader, SalOption}};
use parking_lot::{Condvar, Mutex};

/// Largest datagram payload accepted by `send_to`.
pub const MAX_DGRAM: usize = 65_535;

const QUEUE_LIMIT: usize = 512;

struct Inner {
    queue: VecDeque<(ServiceId, Bytes)>,
    peer: Option<ServiceId>,
    nonblocking: bool,
    rcvtimeo: Option<Duration>,
}

/// A datagram socket bound to a local service identifier.
pub struct DgramSocket {
    pub(crate) stack: Weak<StackInner>,
    local_sid: ServiceId,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl DgramSocket {
    pub(crate) fn new(stack: Weak<StackInner>, local_sid: ServiceId) -> Self {
        Self {
            stack,
            local_sid,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                peer: None,
                nonblocking: false,
                rcvtimeo: None,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn local_service(&self) -> &ServiceId {
        &self.local_sid
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.inner.lock().nonblocking = nonblocking;
    }

    pub fn set_rcvtimeo(&self, timeout: Option<Duration>) {
        self.inner.lock().rcvtimeo = timeout;
    }

    /// Fix the peer for subsequent `send` calls.
    pub fn connect(&self, peer: ServiceId) {
        self.inner.lock().peer = Some(peer);
    }

    /// Send one message to a service, resolving the destination now.
    ///
    /// The destination id rides the SAL header; the datagram's own
    /// header is the 32-byte source service-id, so the receiver can
    /// answer.
    pub fn send_to(&self, dst: &ServiceId, data: &[u8], now: u64) -> Result<usize, Error> {
        if data.len() > MAX_DGRAM {
            return Err(Error::MessageTooLarge);
        }

        let ctx = self.stack.upgrade().ok_or(Error::NotConnected)?;

        let sal = SalHeader::data(FlowId::NONE, FlowId::NONE)
            .with_option(SalOption::ServiceId(*dst));

        let mut buf = BytesMut::with_capacity(sal.encoded_len() + 32 + data.len());
        sal.encode(&mut buf);
        buf.extend_from_slice(self.local_sid.as_bytes());
        buf.extend_from_slice(data);

        ctx.route_and_emit(dst, Some(&self.local_sid), buf.freeze());

        // A locally registered destination lands on the loopback.
        ctx.drain_loopback(now);
        Ok(data.len())
    }

    /// Send to the connected peer.
    pub fn send(&self, data: &[u8], now: u64) -> Result<usize, Error> {
        let peer = self.inner.lock().peer.ok_or(Error::AddrRequired)?;
        self.send_to(&peer, data, now)
    }

    /// Receive one whole message and its source service-id.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, ServiceId), Error> {
        let mut inner = self.inner.lock();

        loop {
            if let Some((src, bytes)) = inner.queue.pop_front() {
                let n = buf.len().min(bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                return Ok((n, src));
            }

            if inner.nonblocking {
                return Err(Error::WouldBlock);
            }

            match inner.rcvtimeo {
                Some(timeout) => {
                    if self.wake.wait_for(&mut inner, timeout).timed_out() {
                        return Err(Error::TimedOut);
                    }
                }
                None => self.wake.wait(&mut inner),
            }
        }
    }

    pub(crate) fn deliver(&self, src: ServiceId, bytes: Bytes) {
        {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= QUEUE_LIMIT {
                // Unreliable transport: shed silently.
                return;
            }
            inner.queue.push_back((src, bytes));
        }

        self.wake.notify_all();
    }

    /// Drop the binding; the socket stops receiving.
    pub fn close(&self) {
        if let Some(ctx) = self.stack.upgrade() {
            ctx.dgrams.write().remove(&self.local_sid);
        }
    }
}
