//! The reliable byte-stream socket.
//!
//! A socket is one `Core` behind a mutex: SAL connection state, the
//! control queue, and the send/receive engines. I/O workers that find
//! the core locked park packets on the backlog; whoever holds the lock
//! drains the backlog before releasing, so a send/recv call observes
//! every arrival that landed before its release point.

pub mod congestion;
pub mod recv;
pub mod send;
pub(crate) mod seq;

use crate::{
    Error, Outbound, RouteOutcome, StackInner,
    mem::ForwardAlloc,
    sal::{ControlQueue, CtrlTimer, QueuedControl, SalState},
};

use self::{
    recv::{RecvEngine, Validation},
    send::{RtoOutcome, SendEngine},
};

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{Arc, Weak},
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use codec::{
    FlowId, ServiceId,
    sal::{SalFlags, SalHeader, SalOption, caps},
    segment::{SegmentHeader, seg_flags},
};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

// Inbound packets a locked socket will hold before shedding load.
const BACKLOG_LIMIT: usize = 256;

/// A demultiplexed inbound packet: the parsed SAL header plus the
/// residue after it, with arrival metadata.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub sal: SalHeader,
    pub payload: Bytes,
    pub src: Ipv4Addr,
    pub if_index: u32,
    pub now: u64,
}

pub(crate) struct Core {
    pub(crate) me: Weak<StreamSocket>,
    pub(crate) parent: Option<Weak<StreamSocket>>,

    pub(crate) local_sid: Option<ServiceId>,
    pub(crate) local_bits: u16,
    pub(crate) peer_sid: Option<ServiceId>,
    pub(crate) local_flow: FlowId,
    pub(crate) peer_flow: FlowId,
    pub(crate) peer_addr: Ipv4Addr,
    pub(crate) if_index: u32,

    pub(crate) state: SalState,
    pub(crate) migrating: bool,
    pub(crate) listening: bool,
    pub(crate) dead: bool,
    pub(crate) nonblocking: bool,
    pub(crate) err: Option<Error>,

    pub(crate) ctrl: ControlQueue,
    pub(crate) send: SendEngine,
    pub(crate) recv: RecvEngine,
    pub(crate) fwd: ForwardAlloc,

    pub(crate) iss: u32,
    pub(crate) irs: u32,
    pub(crate) fin_seq: Option<u32>,
    pub(crate) fin_pending: bool,
    pub(crate) migrate_seq: Option<u32>,
    pub(crate) migrate_to_if: u32,
    pub(crate) timewait_deadline: Option<u64>,

    pub(crate) accept_queue: VecDeque<Arc<StreamSocket>>,
    pub(crate) pending_children: HashMap<u32, Arc<StreamSocket>>,

    pub(crate) rcvtimeo: Option<Duration>,
    pub(crate) sndtimeo: Option<Duration>,
}

impl Core {
    pub(crate) fn new(ctx: &StackInner, local_flow: FlowId) -> Self {
        Self {
            me: Weak::new(),
            parent: None,
            local_sid: None,
            local_bits: ServiceId::BITS,
            peer_sid: None,
            local_flow,
            peer_flow: FlowId::NONE,
            peer_addr: Ipv4Addr::UNSPECIFIED,
            if_index: 0,
            state: SalState::Closed,
            migrating: false,
            listening: false,
            dead: false,
            nonblocking: false,
            err: None,
            ctrl: ControlQueue::new(ctx.config.sal.clone()),
            send: SendEngine::new(ctx.config.send.clone()),
            recv: RecvEngine::new(ctx.config.recv.clone(), ctx.config.mss),
            fwd: ForwardAlloc::default(),
            iss: 0,
            irs: 0,
            fin_seq: None,
            fin_pending: false,
            migrate_seq: None,
            migrate_to_if: 0,
            timewait_deadline: None,
            accept_queue: VecDeque::new(),
            pending_children: HashMap::new(),
            rcvtimeo: None,
            sndtimeo: None,
        }
    }

    // ---- wire output ------------------------------------------------

    fn emit(&mut self, ctx: &StackInner, bytes: Bytes, _now: u64) {
        if !self.peer_addr.is_unspecified() {
            ctx.emit(Outbound {
                bytes,
                next_hop: self.peer_addr,
                if_index: self.if_index,
            });
            return;
        }

        let Some(dst) = self.peer_sid else {
            log::debug!("{}: no peer to send to", self.local_flow);
            return;
        };

        match ctx.route_and_emit(&dst, self.local_sid.as_ref(), bytes) {
            RouteOutcome::Sent { next_hop, if_index } => {
                self.peer_addr = next_hop;
                self.if_index = if_index;
            }
            RouteOutcome::Loopback | RouteOutcome::Parked => {}
        }
    }

    fn control_bytes(&self, packet: &QueuedControl) -> Bytes {
        let mut hdr = SalHeader::control(packet.flags, self.local_flow, self.peer_flow);
        hdr.options = packet.options.clone();

        let mut buf = BytesMut::with_capacity(hdr.encoded_len());
        hdr.encode(&mut buf);
        buf.freeze()
    }

    fn queue_control(
        &mut self,
        ctx: &StackInner,
        flags: SalFlags,
        options: Vec<SalOption>,
        seqno: u32,
        now: u64,
    ) -> Result<(), Error> {
        let packet = QueuedControl {
            seqno,
            flags,
            options,
        };
        let bytes = self.control_bytes(&packet);
        self.ctrl.push(packet, now)?;
        self.emit(ctx, bytes, now);
        Ok(())
    }

    fn send_sal_ack(&mut self, ctx: &StackInner, ackno: u32, now: u64) {
        let hdr = SalHeader::control(SalFlags::ACK, self.local_flow, self.peer_flow)
            .with_option(SalOption::Ack { ackno });

        let mut buf = BytesMut::with_capacity(hdr.encoded_len());
        hdr.encode(&mut buf);
        self.emit(ctx, buf.freeze(), now);
    }

    fn send_rst(&mut self, ctx: &StackInner, now: u64) {
        let hdr = SalHeader::control(SalFlags::RST, self.local_flow, self.peer_flow);
        let mut buf = BytesMut::with_capacity(hdr.encoded_len());
        hdr.encode(&mut buf);
        self.emit(ctx, buf.freeze(), now);
    }

    fn frame_segment(&self, hdr: &SegmentHeader, payload: &[u8]) -> Bytes {
        let sal = SalHeader::data(self.local_flow, self.peer_flow);
        let mut buf =
            BytesMut::with_capacity(sal.encoded_len() + hdr.encoded_len() + payload.len());

        sal.encode(&mut buf);
        hdr.encode(&mut buf);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    fn emit_segment(&mut self, ctx: &StackInner, seg_seq: u32, payload: Bytes, now: u64) {
        let hdr = SegmentHeader {
            seq: seg_seq,
            ack: self.recv.rcv_nxt,
            flags: seg_flags::ACK | seg_flags::PSH,
            window: self.recv.select_window(),
            urgent: 0,
            timestamp: Some((now as u32, self.recv.ts_recent)),
            unknown_options: false,
        };

        let bytes = self.frame_segment(&hdr, &payload);
        self.emit(ctx, bytes, now);
    }

    fn emit_ack(&mut self, ctx: &StackInner, now: u64) {
        if !self.state.is_synchronized() {
            return;
        }

        let hdr = SegmentHeader {
            seq: self.send.snd_nxt,
            ack: self.recv.rcv_nxt,
            flags: seg_flags::ACK,
            window: self.recv.select_window(),
            urgent: 0,
            timestamp: Some((now as u32, self.recv.ts_recent)),
            unknown_options: false,
        };

        let bytes = self.frame_segment(&hdr, &[]);
        self.emit(ctx, bytes, now);
    }

    /// Push writable data onto the wire and the fin behind it.
    fn output(&mut self, ctx: &StackInner, now: u64) {
        for (seg_seq, payload) in self.send.transmit(now) {
            self.emit_segment(ctx, seg_seq, payload, now);
        }

        self.maybe_send_fin(ctx, now);
    }

    fn maybe_send_fin(&mut self, ctx: &StackInner, now: u64) {
        if !self.fin_pending || self.send.has_unsent() || self.fin_seq.is_some() {
            return;
        }

        let seqno = self.send.take_seqno();
        self.fin_seq = Some(seqno);
        self.fin_pending = false;

        if let Err(err) =
            self.queue_control(ctx, SalFlags::FIN, vec![SalOption::Fin { seqno }], seqno, now)
        {
            log::warn!("{}: fin not queued: {}", self.local_flow, err);
        }
    }

    // ---- SAL input --------------------------------------------------

    pub(crate) fn on_packet(&mut self, ctx: &StackInner, pkt: RawPacket) {
        if pkt.sal.flags.is_control() {
            self.on_sal(ctx, &pkt);
        } else {
            self.on_stream(ctx, &pkt);
        }
    }

    fn on_sal(&mut self, ctx: &StackInner, pkt: &RawPacket) {
        let flags = pkt.sal.flags;
        let now = pkt.now;

        if flags.contains(SalFlags::RST) {
            self.on_reset(ctx);
            return;
        }

        if flags.contains(SalFlags::CONNECT) {
            if flags.contains(SalFlags::ACK) {
                self.on_connect_ack(ctx, pkt);
            } else {
                self.on_connect_request(ctx, pkt);
            }
            return;
        }

        if let Some(ackno) = pkt.sal.find_ack() {
            self.process_level_ack(ctx, ackno, now);
        }

        if flags.contains(SalFlags::MIGRATE) {
            if let Some((seqno, addr)) = pkt.sal.find_migrate() {
                self.on_peer_migrate(ctx, seqno, addr, now);
            }
        }

        if flags.contains(SalFlags::FIN) {
            if let Some(seqno) = pkt.sal.find_fin() {
                self.on_peer_fin(ctx, seqno, pkt.sal.find_ack(), now);
            }
        }
    }

    fn on_connect_request(&mut self, ctx: &StackInner, pkt: &RawPacket) {
        if !self.listening {
            // A connect addressed at a non-listening socket; answer
            // straight to the source, there is no flow to route by.
            respond_rst(ctx, pkt);
            return;
        }

        let Some((_, _, _, caps_bits)) = pkt.sal.find_connect() else {
            return;
        };

        // Reno-only: refuse peers that insist on selective acks.
        if caps_bits & caps::SACK_PERMITTED != 0 {
            respond_rst(ctx, pkt);
            return;
        }

        // A retransmitted connect; the child's own control timer will
        // resend the connect-ack.
        if self.pending_children.contains_key(&pkt.sal.src_flow.get()) {
            return;
        }

        match ctx.spawn_respond_socket(self, pkt) {
            Ok(child) => {
                self.pending_children.insert(pkt.sal.src_flow.get(), child);
            }
            Err(err) => {
                log::warn!("passive open failed: {}", err);
            }
        }
    }

    fn on_connect_ack(&mut self, ctx: &StackInner, pkt: &RawPacket) {
        let now = pkt.now;

        if self.state != SalState::Request {
            // Lost final ack: the peer repeats its connect-ack.
            if self.state == SalState::Established && pkt.sal.src_flow == self.peer_flow {
                self.send_sal_ack(ctx, self.irs.wrapping_add(1), now);
            }
            return;
        }

        let Some((irs, ackno, peer_mss, peer_wscale, caps_bits)) = pkt.sal.find_connect_ack()
        else {
            return;
        };

        if ackno != self.iss.wrapping_add(1) {
            return;
        }

        if caps_bits & caps::SACK_PERMITTED != 0 {
            self.send_rst(ctx, now);
            self.fail(ctx, Error::ConnectionRefused);
            return;
        }

        self.peer_flow = pkt.sal.src_flow;
        self.peer_addr = pkt.src;
        self.if_index = pkt.if_index;
        self.irs = irs;

        self.ctrl.on_ack(ackno, now);
        self.send.establish(self.iss, peer_mss, peer_wscale);
        self.recv.establish(irs, now);
        self.state = SalState::Established;

        ctx.handler.on_established(self.local_flow);
        self.send_sal_ack(ctx, irs.wrapping_add(1), now);
        self.output(ctx, now);
    }

    // Shared between SAL ack options and the ack field of stream
    // segments: advance the control queue and run the state machine.
    fn process_level_ack(&mut self, ctx: &StackInner, ackno: u32, now: u64) {
        self.ctrl.on_ack(ackno, now);

        match self.state {
            SalState::Respond if ackno == self.iss.wrapping_add(1) => {
                self.state = SalState::Established;
                ctx.handler.on_established(self.local_flow);
                self.notify_parent_established();
            }
            SalState::FinWait1 if self.fin_acked(ackno) => {
                self.state = SalState::FinWait2;
            }
            SalState::Closing if self.fin_acked(ackno) => {
                self.enter_timewait(now);
            }
            SalState::LastAck if self.fin_acked(ackno) => {
                self.finish_close(ctx);
            }
            _ => {}
        }

        if self.migrating {
            if let Some(mseq) = self.migrate_seq {
                if seq::after(ackno, mseq) {
                    self.migrating = false;
                    self.migrate_seq = None;
                    self.if_index = self.migrate_to_if;
                }
            }
        }
    }

    fn fin_acked(&self, ackno: u32) -> bool {
        self.fin_seq.is_some_and(|fin| seq::after(ackno, fin))
    }

    fn notify_parent_established(&mut self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let Some(parent) = self.parent.take().and_then(|weak| weak.upgrade()) else {
            return;
        };

        let mut parent_core = parent.core.lock();
        parent_core.pending_children.remove(&self.peer_flow.get());
        parent_core.accept_queue.push_back(me);
        drop(parent_core);
        parent.wake.notify_all();
    }

    fn on_peer_fin(&mut self, ctx: &StackInner, fin_seq: u32, ackno: Option<u32>, now: u64) {
        if !self.state.is_synchronized() {
            return;
        }

        if !self.recv.on_fin(fin_seq, &mut self.fwd) {
            // Out of order or already seen: restate our position.
            self.send_sal_ack(ctx, self.recv.rcv_nxt, now);
            return;
        }

        self.send_sal_ack(ctx, self.recv.rcv_nxt, now);

        self.state = match self.state {
            SalState::Established => SalState::CloseWait,
            SalState::FinWait1 => {
                // Fin together with the ack of ours collapses straight to
                // time-wait.
                if ackno.is_some_and(|a| self.fin_acked(a)) {
                    self.enter_timewait(now);
                    return;
                }
                SalState::Closing
            }
            SalState::FinWait2 => {
                self.enter_timewait(now);
                return;
            }
            other => other,
        };
    }

    fn on_peer_migrate(&mut self, ctx: &StackInner, seqno: u32, addr: Ipv4Addr, now: u64) {
        if !self.state.is_synchronized() {
            return;
        }

        if seqno == self.recv.rcv_nxt {
            self.recv.rcv_nxt = self.recv.rcv_nxt.wrapping_add(1);
            log::info!("{}: peer migrated to {}", self.local_flow, addr);
        }

        // The deprecated address stops being used the moment the
        // announcement lands; retransmissions only need re-acking.
        self.peer_addr = addr;
        self.send_sal_ack(ctx, self.recv.rcv_nxt, now);
    }

    fn on_reset(&mut self, ctx: &StackInner) {
        let err = if self.state == SalState::Request {
            Error::ConnectionRefused
        } else {
            Error::ConnectionReset
        };

        self.fail(ctx, err);
    }

    fn fail(&mut self, ctx: &StackInner, err: Error) {
        log::debug!("{}: failed: {}", self.local_flow, err);

        self.err = Some(err);
        self.ctrl.purge();
        self.state = SalState::Closed;
        self.unhash(ctx);
    }

    fn enter_timewait(&mut self, now: u64) {
        self.state = SalState::TimeWait;
        self.timewait_deadline = Some(now + 2 * self.ctrl.msl_ms());
    }

    fn finish_close(&mut self, ctx: &StackInner) {
        self.state = SalState::Closed;
        self.dead = true;
        self.ctrl.purge();
        self.fwd.release(&ctx.memory);
        self.unhash(ctx);
        ctx.handler.on_closed(self.local_flow);
    }

    fn unhash(&mut self, ctx: &StackInner) {
        ctx.sockets.unhash_flow(self.local_flow);

        if let (Some(sid), Some(me)) = (self.local_sid, self.me.upgrade()) {
            ctx.sockets.unhash_service(&sid, self.local_bits, &me);
        }
    }

    // ---- stream input -----------------------------------------------

    fn on_stream(&mut self, ctx: &StackInner, pkt: &RawPacket) {
        let now = pkt.now;

        if !self.state.is_synchronized() {
            // A data segment completes the passive open when the pure
            // ack was lost.
            if self.state == SalState::Respond {
                if let Ok((hdr, _)) = SegmentHeader::decode(&pkt.payload) {
                    if hdr.ack_set() && hdr.ack == self.iss.wrapping_add(1) {
                        self.process_level_ack(ctx, hdr.ack, now);
                    }
                }
            }

            if !self.state.is_synchronized() {
                return;
            }
        }

        let Ok((hdr, hdr_len)) = SegmentHeader::decode(&pkt.payload) else {
            ctx.count_malformed();
            return;
        };
        let payload = pkt.payload.slice(hdr_len..);

        if !self.recv.fast_path(&hdr, self.send.snd_una, self.send.snd_nxt) {
            match self.recv.validate(&hdr, payload.len(), now) {
                Validation::Ok => {}
                Validation::DropAck => {
                    self.emit_ack(ctx, now);
                    return;
                }
                Validation::Drop => return,
                Validation::Reset => {
                    self.fail(ctx, Error::ConnectionReset);
                    return;
                }
            }
        }

        self.recv.note_timestamp(&hdr, now);

        if hdr.ack_set() {
            let outcome = self
                .send
                .on_ack(hdr.ack, hdr.window, !payload.is_empty(), now);

            if let Some((seg_seq, bytes)) = outcome.fast_retransmit {
                self.emit_segment(ctx, seg_seq, bytes, now);
            }

            if outcome.acked > 0 {
                self.send.maybe_grow_sndbuf(ctx.memory.under_pressure());
            }

            self.process_level_ack(ctx, hdr.ack, now);
        }

        let data = self
            .recv
            .queue_data(hdr.seq, payload, hdr.timestamp, now, &ctx.memory, &mut self.fwd);

        if data.dropped {
            // Transient receive overrun: back off locally.
            self.send.enter_cwr();
        }

        // Acked data may have opened the window.
        self.output(ctx, now);

        if data.ack_now {
            self.recv.schedule_ack();
            self.emit_ack(ctx, now);
        } else if self.recv.ack_now(now) {
            self.emit_ack(ctx, now);
        }
    }

    // ---- timers -----------------------------------------------------

    pub(crate) fn on_tick(&mut self, ctx: &StackInner, now: u64) {
        match self.ctrl.fire(now) {
            CtrlTimer::Retransmit => {
                if let Some(packet) = self.ctrl.head().cloned() {
                    log::debug!(
                        "{}: control retransmit seqno={} state={}",
                        self.local_flow,
                        packet.seqno,
                        self.state
                    );

                    let bytes = self.control_bytes(&packet);
                    self.emit(ctx, bytes, now);
                }
            }
            CtrlTimer::Failed => {
                let err = if self.state == SalState::Request {
                    Error::TimedOut
                } else {
                    Error::ConnectionReset
                };
                self.fail(ctx, err);
                return;
            }
            CtrlTimer::Idle => {}
        }

        if let Some(deadline) = self.send.rto_deadline() {
            if now >= deadline {
                match self.send.on_rto(now) {
                    RtoOutcome::Retransmit { seq: seg_seq, bytes } => {
                        self.emit_segment(ctx, seg_seq, bytes, now);
                    }
                    RtoOutcome::Failed => {
                        self.fail(ctx, Error::ConnectionReset);
                        return;
                    }
                    RtoOutcome::Idle => {}
                }
            }
        }

        if self.recv.on_delack_timer(now) {
            self.emit_ack(ctx, now);
        }

        if let Some(deadline) = self.timewait_deadline {
            if now >= deadline {
                self.timewait_deadline = None;
                self.finish_close(ctx);
            }
        }
    }
}

impl Core {
    /// Announce a new source address to the peer and switch egress once
    /// it acknowledges.
    pub(crate) fn start_migrate(
        &mut self,
        ctx: &StackInner,
        to_if_index: u32,
        new_source: Ipv4Addr,
        now: u64,
    ) {
        self.migrating = true;
        self.migrate_to_if = to_if_index;

        let seqno = self.send.take_seqno();
        self.migrate_seq = Some(seqno);

        if let Err(err) = self.queue_control(
            ctx,
            SalFlags::MIGRATE,
            vec![SalOption::Migrate {
                seqno,
                addr: new_source,
            }],
            seqno,
            now,
        ) {
            log::warn!("{}: migrate not queued: {}", self.local_flow, err);
            self.migrating = false;
            self.migrate_seq = None;
        }
    }
}

impl StackInner {
    /// Passive open: clone a socket off the listener for an incoming
    /// connect, answer with the connect-ack, and index the new flow.
    pub(crate) fn spawn_respond_socket(
        &self,
        listener: &Core,
        pkt: &RawPacket,
    ) -> Result<Arc<StreamSocket>, Error> {
        let Some((irs, peer_mss, peer_wscale, _)) = pkt.sal.find_connect() else {
            return Err(Error::Malformed);
        };

        let flow = self.sockets.alloc_flow();
        let mut core = Core::new(self, flow);

        core.local_sid = listener.local_sid;
        core.local_bits = listener.local_bits;
        core.peer_flow = pkt.sal.src_flow;
        core.peer_addr = pkt.src;
        core.if_index = pkt.if_index;
        core.parent = Some(listener.me.clone());
        core.state = SalState::Respond;
        core.iss = rand::rng().random();
        core.irs = irs;

        core.send.establish(core.iss, peer_mss, peer_wscale);
        core.recv.establish(irs, pkt.now);

        let options = vec![SalOption::ConnectAck {
            seqno: core.iss,
            ackno: irs.wrapping_add(1),
            mss: self.config.mss as u16,
            wscale: core.recv.wscale(),
            caps: 0,
        }];
        let iss = core.iss;
        core.queue_control(self, SalFlags::CONNECT | SalFlags::ACK, options, iss, pkt.now)?;

        let stack = self.me.clone();
        let sock = StreamSocket::from_core(stack, core);
        self.sockets.hash_flow(flow, sock.clone())?;

        log::debug!(
            "passive open: flow={} peer_flow={} from {}",
            flow,
            pkt.sal.src_flow,
            pkt.src
        );

        Ok(sock)
    }
}

impl StreamSocket {
    /// Start migration when this socket matches the directive's
    /// selector. Returns whether it matched.
    pub(crate) fn migrate_if_matches(
        &self,
        selector: &crate::MigrateSelector,
        to_if_index: u32,
        new_source: Ipv4Addr,
        now: u64,
    ) -> bool {
        let Some(ctx) = self.stack.upgrade() else {
            return false;
        };

        let mut core = self.core.lock();

        let matched = match selector {
            crate::MigrateSelector::Interface(if_index) => core.if_index == *if_index,
            crate::MigrateSelector::Flow(flow) => core.local_flow == *flow,
            crate::MigrateSelector::Service(sid) => core.local_sid.as_ref() == Some(sid),
        };

        let eligible = matched && core.state.is_synchronized() && !core.migrating;
        if eligible {
            core.start_migrate(&ctx, to_if_index, new_source, now);
        }

        self.finish_locked(core, &ctx);
        eligible
    }
}

// Standalone because the listener must answer before any child exists.
fn respond_rst(ctx: &StackInner, pkt: &RawPacket) {
    let hdr = SalHeader::control(SalFlags::RST, pkt.sal.dst_flow, pkt.sal.src_flow);
    let mut buf = BytesMut::with_capacity(hdr.encoded_len());
    hdr.encode(&mut buf);

    ctx.emit(Outbound {
        bytes: buf.freeze(),
        next_hop: pkt.src,
        if_index: pkt.if_index,
    });
}

/// A reliable byte-stream socket handle.
pub struct StreamSocket {
    pub(crate) stack: Weak<StackInner>,
    pub(crate) core: Mutex<Core>,
    pub(crate) wake: Condvar,
    pub(crate) backlog: Mutex<VecDeque<RawPacket>>,
}

impl StreamSocket {
    pub(crate) fn from_core(stack: Weak<StackInner>, mut core: Core) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            core.me = me.clone();
            Self {
                stack,
                core: Mutex::new(core),
                wake: Condvar::new(),
                backlog: Mutex::new(VecDeque::new()),
            }
        })
    }

    fn ctx(&self) -> Result<Arc<StackInner>, Error> {
        self.stack.upgrade().ok_or(Error::NotConnected)
    }

    /// The local flow identifier.
    pub fn local_flow(&self) -> FlowId {
        self.core.lock().local_flow
    }

    pub fn state(&self) -> SalState {
        self.core.lock().state
    }

    pub fn local_service(&self) -> Option<ServiceId> {
        self.core.lock().local_sid
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.core.lock().nonblocking = nonblocking;
    }

    pub fn set_rcvtimeo(&self, timeout: Option<Duration>) {
        self.core.lock().rcvtimeo = timeout;
    }

    pub fn set_sndtimeo(&self, timeout: Option<Duration>) {
        self.core.lock().sndtimeo = timeout;
    }

    /// The last asynchronous error, consumed.
    pub fn take_error(&self) -> Option<Error> {
        self.core.lock().err.take()
    }

    /// Bind to a local service identifier.
    pub fn bind(&self, service: ServiceId) -> Result<(), Error> {
        self.bind_prefix(service, ServiceId::BITS)
    }

    /// Bind to a service-id prefix. A listener bound this way answers
    /// connects for every id under the prefix; `bits` of 0 makes it the
    /// default listener.
    pub fn bind_prefix(&self, service: ServiceId, bits: u16) -> Result<(), Error> {
        let ctx = self.ctx()?;
        let mut core = self.core.lock();

        if core.local_sid.is_some() {
            return Err(Error::AddrInUse);
        }

        let prefix = service.masked(bits);
        ctx.sockets
            .hash_service(&prefix, bits, self.me_arc(&core)?)?;
        core.local_sid = Some(prefix);
        core.local_bits = bits;

        Ok(())
    }

    fn me_arc(&self, core: &Core) -> Result<Arc<StreamSocket>, Error> {
        core.me.upgrade().ok_or(Error::NotConnected)
    }

    /// Enter the passive-open role.
    pub fn listen(&self) -> Result<(), Error> {
        let ctx = self.ctx()?;
        let mut core = self.core.lock();

        let Some(service) = core.local_sid else {
            return Err(Error::AddrRequired);
        };

        ctx.sockets
            .promote_listener(&service, core.local_bits, &self.me_arc(&core)?)?;
        core.listening = true;

        Ok(())
    }

    /// Active open towards a destination service.
    ///
    /// In non-blocking mode this returns immediately after emitting the
    /// connect; otherwise it waits for the handshake or the timeout.
    pub fn connect(&self, dst: ServiceId, now: u64) -> Result<(), Error> {
        let ctx = self.ctx()?;
        let mut core = self.core.lock();

        if core.listening || core.state != SalState::Closed || core.dead {
            return Err(Error::AddrInUse);
        }

        core.peer_sid = Some(dst);
        core.iss = rand::rng().random();
        core.state = SalState::Request;

        let options = vec![
            SalOption::Connect {
                seqno: core.iss,
                mss: ctx.config.mss as u16,
                wscale: core.recv.wscale(),
                caps: 0,
            },
            SalOption::ServiceId(dst),
        ];
        let iss = core.iss;
        core.queue_control(&ctx, SalFlags::CONNECT, options, iss, now)?;

        if core.nonblocking {
            self.finish_locked(core, &ctx);
            return Ok(());
        }

        let timeout = core.sndtimeo;
        loop {
            match core.state {
                SalState::Established => {
                    self.finish_locked(core, &ctx);
                    return Ok(());
                }
                SalState::Closed => {
                    let err = core.err.take().unwrap_or(Error::ConnectionRefused);
                    self.finish_locked(core, &ctx);
                    return Err(err);
                }
                _ => {}
            }

            if !self.wait(&mut core, timeout) {
                self.finish_locked(core, &ctx);
                return Err(Error::TimedOut);
            }
        }
    }

    /// Take one established connection off the listen queue.
    pub fn accept(&self) -> Result<Arc<StreamSocket>, Error> {
        let ctx = self.ctx()?;
        let mut core = self.core.lock();

        if !core.listening {
            return Err(Error::AddrRequired);
        }

        let timeout = core.rcvtimeo;
        loop {
            if let Some(child) = core.accept_queue.pop_front() {
                self.finish_locked(core, &ctx);
                return Ok(child);
            }

            if core.nonblocking {
                self.finish_locked(core, &ctx);
                return Err(Error::WouldBlock);
            }

            if !self.wait(&mut core, timeout) {
                self.finish_locked(core, &ctx);
                return Err(Error::TimedOut);
            }
        }
    }

    /// Write bytes to the stream. Returns the number accepted into the
    /// send buffer; blocks for buffer space unless non-blocking.
    pub fn send(&self, data: &[u8], now: u64) -> Result<usize, Error> {
        let ctx = self.ctx()?;
        let mut core = self.core.lock();

        let timeout = core.sndtimeo;
        loop {
            if let Some(err) = core.err.take() {
                self.finish_locked(core, &ctx);
                return Err(err);
            }

            if core.dead || core.state.local_closed() {
                self.finish_locked(core, &ctx);
                return Err(Error::BrokenPipe);
            }

            if !core.state.is_synchronized() {
                self.finish_locked(core, &ctx);
                return Err(Error::NotConnected);
            }

            core.recv.note_interactive(now);

            let n = core.send.write(data);
            if n > 0 {
                core.output(&ctx, now);
                self.finish_locked(core, &ctx);
                return Ok(n);
            }

            if core.nonblocking {
                self.finish_locked(core, &ctx);
                return Err(Error::WouldBlock);
            }

            if !self.wait(&mut core, timeout) {
                self.finish_locked(core, &ctx);
                return Err(Error::TimedOut);
            }
        }
    }

    /// Read bytes from the stream. Returns 0 at end of stream.
    pub fn recv(&self, buf: &mut [u8], now: u64) -> Result<usize, Error> {
        let ctx = self.ctx()?;
        let mut core = self.core.lock();

        let timeout = core.rcvtimeo;
        loop {
            let split = &mut *core;
            let n = split.recv.read(buf, now, &ctx.memory, &mut split.fwd);
            if n > 0 {
                core.maybe_update_window(&ctx, now);
                self.finish_locked(core, &ctx);
                return Ok(n);
            }

            if core.recv.half_closed || core.dead || core.state == SalState::Closed {
                if let Some(err) = core.err.take() {
                    self.finish_locked(core, &ctx);
                    return Err(err);
                }
                self.finish_locked(core, &ctx);
                return Ok(0);
            }

            if !core.state.is_synchronized() {
                self.finish_locked(core, &ctx);
                return Err(Error::NotConnected);
            }

            if core.nonblocking {
                self.finish_locked(core, &ctx);
                return Err(Error::WouldBlock);
            }

            if !self.wait(&mut core, timeout) {
                self.finish_locked(core, &ctx);
                return Err(Error::TimedOut);
            }
        }
    }

    /// Close the sending direction and run the teardown handshake.
    pub fn close(&self, now: u64) -> Result<(), Error> {
        let ctx = self.ctx()?;
        let mut core = self.core.lock();

        match core.state {
            SalState::Closed | SalState::Request | SalState::Respond => {
                // Orphaned before establishment: nothing to hand over.
                core.state = SalState::Closed;
                core.dead = true;
                core.ctrl.purge();
                core.unhash(&ctx);
            }
            SalState::Established => {
                core.state = SalState::FinWait1;
                core.fin_pending = true;
                core.maybe_send_fin(&ctx, now);
            }
            SalState::CloseWait => {
                core.state = SalState::LastAck;
                core.fin_pending = true;
                core.maybe_send_fin(&ctx, now);
            }
            _ => {}
        }

        self.finish_locked(core, &ctx);
        Ok(())
    }

    /// Hand an inbound packet to the socket. Runs it inline when the
    /// core is free, otherwise leaves it on the backlog for the lock
    /// holder.
    pub(crate) fn deliver(&self, pkt: RawPacket) {
        let Some(ctx) = self.stack.upgrade() else {
            return;
        };

        {
            let mut backlog = self.backlog.lock();
            if backlog.len() >= BACKLOG_LIMIT {
                ctx.count_drop();
                return;
            }
            backlog.push_back(pkt);
        }

        if let Some(core) = self.core.try_lock() {
            self.finish_locked(core, &ctx);
        }
    }

    pub(crate) fn tick(&self, now: u64) {
        let Some(ctx) = self.stack.upgrade() else {
            return;
        };

        let mut core = self.core.lock();
        core.on_tick(&ctx, now);
        self.finish_locked(core, &ctx);
    }

    // Drain the backlog, then release the core strictly before the
    // backlog lock so a racing worker either queues before our last
    // check or finds the core free.
    fn finish_locked(&self, core: parking_lot::MutexGuard<'_, Core>, ctx: &Arc<StackInner>) {
        let mut guard = Some(core);

        loop {
            let mut backlog = self.backlog.lock();
            match backlog.pop_front() {
                Some(pkt) => {
                    drop(backlog);
                    if let Some(core) = guard.as_mut() {
                        core.on_packet(ctx, pkt);
                    }
                }
                None => {
                    guard.take();
                    drop(backlog);
                    break;
                }
            }
        }

        self.wake.notify_all();
    }

    // Wait for a state change; returns false on timeout.
    fn wait(&self, core: &mut parking_lot::MutexGuard<'_, Core>, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(duration) => !self.wake.wait_for(core, duration).timed_out(),
            None => {
                self.wake.wait(core);
                true
            }
        }
    }
}

impl Core {
    // Advertise newly freed receive space once it amounts to a full
    // segment.
    fn maybe_update_window(&mut self, ctx: &StackInner, now: u64) {
        let advertised = self.recv.receive_window();
        let free = (self.recv.rcvbuf - self.recv.readable()) as u32;

        if free > advertised && free - advertised >= self.recv.mss {
            self.emit_ack(ctx, now);
        }
    }
}
