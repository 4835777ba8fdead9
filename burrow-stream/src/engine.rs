//! The reliable-stream engine.
//!
//! Sans-IO: callers feed datagrams and timer ticks in, and drain queued
//! transmits and events out; the engine never touches a socket and never
//! re-enters its caller. One engine instance serves every stream in the
//! process, across all shared UDP ports.
//!
//! Wire format of one engine datagram:
//!
//! ```text
//! 0..16   connection tag (chosen by the connector; tag[0..2] mirrors the
//!         peer's UDP source port by convention)
//! 16      packet type (SYN/SYNACK/DATA/ACK/FIN/RST)
//! 17      flags (reserved, 0)
//! 18..22  seq   (LE)
//! 22..26  ack   (LE, highest contiguously received seq)
//! 26..30  window (LE, receiver's free buffer in bytes)
//! 30..    payload (DATA only)
//! ```
//!
//! Sequence numbers count segments, not bytes. Acks are cumulative and may
//! be deferred until the owner flushes them at end of a receive burst;
//! retransmission is driven by the 500 ms housekeeping tick with exponential
//! backoff and a bounded retry budget.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::net::Ipv4Addr;

use burrow_core::consts::{STREAM_BUFF_SIZE, TAG_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use nom::bytes::complete::take;
use nom::number::complete::{le_u32, u8 as nom_u8};
use nom::IResult;
use rand::RngCore;
use tracing::{trace, warn};

/// Engine datagram header length after the tag.
pub const HEADER_LEN: usize = 14;
/// Smallest datagram the engine will look at.
pub const MIN_DATAGRAM: usize = TAG_LEN + HEADER_LEN;
/// Payload carried per DATA segment.
pub const MAX_SEGMENT: usize = 1300;

/// Ticks (of 500 ms) before the first retransmission.
const RTO_TICKS: u32 = 1;
/// Backoff cap in ticks.
const RTO_MAX_TICKS: u32 = 8;
/// Retransmissions before the stream is declared dead.
const MAX_RETRIES: u32 = 12;
/// Duplicate acks that trigger a fast retransmit.
const DUP_ACK_FAST_RETRANSMIT: u32 = 3;

/// Opaque 16-byte connection label carried at the front of every datagram.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub [u8; TAG_LEN]);

impl Tag {
    /// Tag for a peer reachable at UDP source port `port`: the first two
    /// bytes mirror the port, the rest is random.
    pub fn for_peer(port: u16) -> Self {
        let mut bytes = [0u8; TAG_LEN];
        bytes[..2].copy_from_slice(&port.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[2..]);
        Self(bytes)
    }

    pub fn from_wire(data: &[u8]) -> Option<Self> {
        if data.len() < TAG_LEN {
            return None;
        }
        let mut bytes = [0u8; TAG_LEN];
        bytes.copy_from_slice(&data[..TAG_LEN]);
        Some(Self(bytes))
    }

    /// The port convention encoded in the first two bytes.
    pub fn port_hint(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}..", self.0[0], self.0[1])
    }
}

/// Engine socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
    Syn = 1,
    SynAck = 2,
    Data = 3,
    Ack = 4,
    Fin = 5,
    Rst = 6,
}

impl PacketType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => PacketType::Syn,
            2 => PacketType::SynAck,
            3 => PacketType::Data,
            4 => PacketType::Ack,
            5 => PacketType::Fin,
            6 => PacketType::Rst,
            _ => return None,
        })
    }
}

struct Header {
    tag: Tag,
    ptype: PacketType,
    seq: u32,
    ack: u32,
    window: u32,
}

fn parse_header(input: &[u8]) -> IResult<&[u8], Header> {
    let (input, tag) = take(TAG_LEN)(input)?;
    let (input, ptype) = nom_u8(input)?;
    let (input, _flags) = nom_u8(input)?;
    let (input, seq) = le_u32(input)?;
    let (input, ack) = le_u32(input)?;
    let (input, window) = le_u32(input)?;
    let ptype = PacketType::from_u8(ptype).ok_or(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Tag,
    )))?;
    let tag = Tag::from_wire(tag).ok_or(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Eof,
    )))?;
    Ok((
        input,
        Header {
            tag,
            ptype,
            seq,
            ack,
            window,
        },
    ))
}

fn encode_packet(
    tag: &Tag,
    ptype: PacketType,
    seq: u32,
    ack: u32,
    window: u32,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_DATAGRAM + payload.len());
    buf.extend_from_slice(&tag.0);
    buf.put_u8(ptype as u8);
    buf.put_u8(0);
    buf.put_u32_le(seq);
    buf.put_u32_le(ack);
    buf.put_u32_le(window);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// An outbound datagram. The payload already begins with the tag; the
/// multiplexer translates the tag to the peer's actual UDP port.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub local_port: u16,
    pub peer_ip: Ipv4Addr,
    pub tag: Tag,
    pub payload: Bytes,
}

/// Engine-to-owner notifications, drained via [`Engine::poll_event`].
#[derive(Debug)]
pub enum EngineEvent {
    /// Connector handshake finished; the stream is writable.
    Connected,
    /// Send-buffer space became available.
    Writable,
    /// Ordered payload ready for the consumer.
    Readable(Bytes),
    /// The peer acknowledged this many payload bytes.
    Sent(usize),
    /// Peer finished its side of the stream.
    Eof,
    /// The stream died.
    Error(ErrorKind),
    /// Teardown finished; the socket id is gone after this event.
    Destroying,
    /// A new inbound stream on the acceptor's port.
    Accepted {
        sock: SockId,
        peer_ip: Ipv4Addr,
        tag: Tag,
    },
}

/// What [`Engine::process_datagram`] did with a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Routed to an existing stream.
    Handled,
    /// Created a new accepted stream.
    Accepted(SockId),
    /// No stream claimed the tag.
    Unhandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    SynSent,
    Connected,
    /// FIN queued or sent, waiting for it to be acked.
    Closing,
}

struct Segment {
    seq: u32,
    payload: Bytes,
    sent: bool,
    sent_at_tick: u64,
    retries: u32,
}

struct Sock {
    local_port: u16,
    peer_ip: Ipv4Addr,
    tag: Tag,
    state: SockState,
    /// Next sequence number for outgoing segments. The SYN consumes seq 0.
    next_seq: u32,
    /// Unacknowledged (and not-yet-sent) segments, oldest first.
    unacked: VecDeque<Segment>,
    /// Bytes currently held in `unacked`.
    buffered: usize,
    /// Highest contiguous seq received from the peer.
    recv_cursor: u32,
    /// Out-of-order segments waiting for the gap to fill.
    reorder: BTreeMap<u32, Bytes>,
    /// Free receive buffer advertised to the peer.
    recv_window: u32,
    /// Peer's advertised window.
    peer_window: u32,
    /// Cumulative ack owed to the peer.
    ack_pending: bool,
    dup_acks: u32,
    last_ack_seen: u32,
    /// Sequence carried by the peer's FIN, once seen.
    peer_fin: Option<u32>,
    fin_queued: bool,
    fin_sent: bool,
    eof_delivered: bool,
}

impl Sock {
    fn new(local_port: u16, peer_ip: Ipv4Addr, tag: Tag, state: SockState) -> Self {
        Self {
            local_port,
            peer_ip,
            tag,
            state,
            next_seq: 1,
            unacked: VecDeque::new(),
            buffered: 0,
            recv_cursor: 0,
            reorder: BTreeMap::new(),
            recv_window: STREAM_BUFF_SIZE as u32,
            peer_window: STREAM_BUFF_SIZE as u32,
            ack_pending: false,
            dup_acks: 0,
            last_ack_seen: 0,
            peer_fin: None,
            fin_queued: false,
            fin_sent: false,
            eof_delivered: false,
        }
    }

    fn send_space(&self) -> usize {
        STREAM_BUFF_SIZE.saturating_sub(self.buffered)
    }

    /// Never stalls completely: at least one segment may always be in
    /// flight so a zero-window peer still sees progress probes.
    fn window_budget(&self) -> usize {
        (self.peer_window as usize).max(MAX_SEGMENT)
    }

    fn in_flight(&self) -> usize {
        self.unacked
            .iter()
            .filter(|seg| seg.sent)
            .map(|seg| seg.payload.len())
            .sum()
    }
}

enum PacketKind {
    Syn,
    SynAck,
    Ack,
    Data(u32, Bytes),
    Fin(u32),
    Rst,
}

/// The reliable-stream engine; one per process, shared by all ports.
pub struct Engine {
    sockets: HashMap<SockId, Sock>,
    index: HashMap<(u16, Ipv4Addr, Tag), SockId>,
    next_id: u32,
    tick: u64,
    transmits: VecDeque<Transmit>,
    events: VecDeque<(SockId, EngineEvent)>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
            index: HashMap::new(),
            next_id: 1,
            tick: 0,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<(SockId, EngineEvent)> {
        self.events.pop_front()
    }

    pub fn peer_of(&self, sock: SockId) -> Option<(Ipv4Addr, Tag)> {
        self.sockets.get(&sock).map(|s| (s.peer_ip, s.tag))
    }

    pub fn local_port_of(&self, sock: SockId) -> Option<u16> {
        self.sockets.get(&sock).map(|s| s.local_port)
    }

    pub fn is_alive(&self, sock: SockId) -> bool {
        self.sockets.contains_key(&sock)
    }

    /// Open a connector stream on `local_port` towards `(peer_ip, tag)`.
    /// Queues the SYN; [`EngineEvent::Connected`] follows on handshake.
    pub fn connect(&mut self, local_port: u16, peer_ip: Ipv4Addr, tag: Tag) -> SockId {
        let id = self.alloc_id();
        let mut sock = Sock::new(local_port, peer_ip, tag, SockState::SynSent);
        // The SYN occupies seq 0 for retransmission accounting.
        sock.unacked.push_back(Segment {
            seq: 0,
            payload: Bytes::new(),
            sent: true,
            sent_at_tick: self.tick,
            retries: 0,
        });
        self.index.insert((local_port, peer_ip, tag), id);
        self.sockets.insert(id, sock);
        self.emit(id, PacketKind::Syn);
        id
    }

    /// Route one inbound datagram (tag still at the front). `accept`
    /// reflects whether an acceptor handle is bound on `local_port`.
    pub fn process_datagram(
        &mut self,
        local_port: u16,
        src_ip: Ipv4Addr,
        data: &[u8],
        accept: bool,
    ) -> Disposition {
        let Ok((payload, hdr)) = parse_header(data) else {
            warn!("undecodable engine datagram ({} bytes)", data.len());
            return Disposition::Unhandled;
        };

        if let Some(&id) = self.index.get(&(local_port, src_ip, hdr.tag)) {
            self.handle_packet(id, &hdr, payload);
            return Disposition::Handled;
        }

        if hdr.ptype == PacketType::Syn && accept {
            let id = self.alloc_id();
            let mut sock = Sock::new(local_port, src_ip, hdr.tag, SockState::Connected);
            sock.peer_window = hdr.window;
            self.index.insert((local_port, src_ip, hdr.tag), id);
            self.sockets.insert(id, sock);
            self.emit(id, PacketKind::SynAck);
            self.events.push_back((
                id,
                EngineEvent::Accepted {
                    sock: id,
                    peer_ip: src_ip,
                    tag: hdr.tag,
                },
            ));
            return Disposition::Accepted(id);
        }

        trace!(
            "no stream for tag {:?} on port {local_port} (type {:?})",
            hdr.tag,
            hdr.ptype
        );
        Disposition::Unhandled
    }

    /// Queue payload bytes for sending. Returns how many were accepted
    /// (bounded by send-buffer space); zero means wait for
    /// [`EngineEvent::Writable`].
    pub fn write(&mut self, sock: SockId, data: &[u8]) -> usize {
        let accepted = {
            let Some(s) = self.sockets.get_mut(&sock) else {
                return 0;
            };
            if s.state != SockState::Connected || s.fin_queued {
                return 0;
            }
            let accepted = s.send_space().min(data.len());
            let mut off = 0;
            while off < accepted {
                let chunk = (accepted - off).min(MAX_SEGMENT);
                let seq = s.next_seq;
                s.next_seq += 1;
                s.unacked.push_back(Segment {
                    seq,
                    payload: Bytes::copy_from_slice(&data[off..off + chunk]),
                    sent: false,
                    sent_at_tick: self.tick,
                    retries: 0,
                });
                s.buffered += chunk;
                off += chunk;
            }
            accepted
        };
        if accepted > 0 {
            self.pump_unsent(sock);
        }
        accepted
    }

    /// The consumer drained `n` bytes from its ring; widen the advertised
    /// window again.
    pub fn on_read_consumed(&mut self, sock: SockId, n: usize) {
        if let Some(s) = self.sockets.get_mut(&sock) {
            s.recv_window = (s.recv_window as usize + n).min(STREAM_BUFF_SIZE) as u32;
            s.ack_pending = true;
        }
    }

    /// Flush the deferred cumulative ack for one stream.
    pub fn issue_deferred_acks(&mut self, sock: SockId) {
        let owed = self
            .sockets
            .get(&sock)
            .map(|s| s.ack_pending)
            .unwrap_or(false);
        if owed {
            self.emit(sock, PacketKind::Ack);
        }
    }

    /// Close a stream. Graceful close flushes queued data then FINs; abort
    /// fires an RST and tears down immediately.
    pub fn close(&mut self, sock: SockId, abort: bool) {
        let action = {
            let Some(s) = self.sockets.get_mut(&sock) else {
                return;
            };
            if abort || s.state == SockState::SynSent {
                Some(true)
            } else if s.fin_queued {
                None
            } else {
                s.fin_queued = true;
                s.state = SockState::Closing;
                Some(false)
            }
        };
        match action {
            Some(true) => {
                self.emit(sock, PacketKind::Rst);
                self.destroy(sock);
            }
            Some(false) => self.maybe_send_fin(sock),
            None => {}
        }
    }

    /// 500 ms housekeeping: retransmissions, handshake and teardown
    /// timeouts, and any ack still owed.
    pub fn check_timeouts(&mut self) {
        self.tick += 1;
        let ids: Vec<SockId> = self.sockets.keys().copied().collect();
        for id in ids {
            self.tick_sock(id);
            self.issue_deferred_acks(id);
        }
    }

    fn tick_sock(&mut self, id: SockId) {
        enum Act {
            Fail(ErrorKind),
            Resend(PacketKind),
        }
        let tick = self.tick;
        let act = {
            let Some(s) = self.sockets.get_mut(&id) else {
                return;
            };
            let state = s.state;
            let Some(head) = s.unacked.front_mut() else {
                return;
            };
            if !head.sent {
                // Window-starved; try pushing instead of retransmitting.
                None
            } else {
                let rto = RTO_TICKS
                    .saturating_mul(1 << head.retries.min(3))
                    .min(RTO_MAX_TICKS);
                if tick.saturating_sub(head.sent_at_tick) < rto as u64 {
                    return;
                }
                if head.retries >= MAX_RETRIES {
                    Some(Act::Fail(if state == SockState::SynSent {
                        ErrorKind::TimedOut
                    } else {
                        ErrorKind::ConnectionReset
                    }))
                } else {
                    head.retries += 1;
                    head.sent_at_tick = tick;
                    let kind = if state == SockState::SynSent {
                        PacketKind::Syn
                    } else if head.payload.is_empty() {
                        PacketKind::Fin(head.seq)
                    } else {
                        PacketKind::Data(head.seq, head.payload.clone())
                    };
                    trace!("retransmit seq {} (try {}) on {id:?}", head.seq, head.retries);
                    Some(Act::Resend(kind))
                }
            }
        };
        match act {
            Some(Act::Fail(kind)) => {
                warn!("stream {id:?} retransmission budget exhausted");
                self.events.push_back((id, EngineEvent::Error(kind)));
                self.destroy(id);
            }
            Some(Act::Resend(kind)) => self.emit(id, kind),
            None => self.pump_unsent(id),
        }
    }

    fn handle_packet(&mut self, id: SockId, hdr: &Header, payload: &[u8]) {
        if let Some(s) = self.sockets.get_mut(&id) {
            s.peer_window = hdr.window;
        }
        match hdr.ptype {
            PacketType::Syn => {
                // Duplicate SYN: our SYNACK got lost and the peer has not
                // progressed past the handshake.
                let resend = self
                    .sockets
                    .get(&id)
                    .map(|s| s.state == SockState::Connected && s.recv_cursor == 0)
                    .unwrap_or(false);
                if resend {
                    self.emit(id, PacketKind::SynAck);
                }
            }
            PacketType::SynAck => {
                let fresh = {
                    let Some(s) = self.sockets.get_mut(&id) else {
                        return;
                    };
                    if s.state != SockState::SynSent {
                        false
                    } else {
                        s.state = SockState::Connected;
                        // Drop the pseudo-segment tracking the SYN.
                        s.unacked.pop_front();
                        true
                    }
                };
                if fresh {
                    self.events.push_back((id, EngineEvent::Connected));
                    self.events.push_back((id, EngineEvent::Writable));
                    // Ack the handshake so the peer stops resending SYNACK.
                    self.emit(id, PacketKind::Ack);
                }
            }
            PacketType::Ack => {
                self.apply_ack(id, hdr.ack);
            }
            PacketType::Data => {
                self.apply_ack(id, hdr.ack);
                self.accept_data(id, hdr.seq, payload);
            }
            PacketType::Fin => {
                self.apply_ack(id, hdr.ack);
                if let Some(s) = self.sockets.get_mut(&id) {
                    if s.peer_fin.is_none() {
                        s.peer_fin = Some(hdr.seq);
                        s.ack_pending = true;
                    }
                }
                self.deliver_eof_if_complete(id);
            }
            PacketType::Rst => {
                self.events
                    .push_back((id, EngineEvent::Error(ErrorKind::ConnectionReset)));
                self.destroy(id);
            }
        }
    }

    fn apply_ack(&mut self, id: SockId, ack: u32) {
        enum After {
            Progress(usize),
            FastRetransmit(PacketKind),
            Nothing,
        }
        let after = {
            let Some(s) = self.sockets.get_mut(&id) else {
                return;
            };
            let mut acked_bytes = 0usize;
            let mut popped = false;
            while let Some(head) = s.unacked.front() {
                if !head.sent || head.seq > ack {
                    break;
                }
                acked_bytes += head.payload.len();
                s.unacked.pop_front();
                popped = true;
            }
            if popped || ack > s.last_ack_seen {
                s.buffered = s.buffered.saturating_sub(acked_bytes);
                s.last_ack_seen = s.last_ack_seen.max(ack);
                s.dup_acks = 0;
                After::Progress(acked_bytes)
            } else if !s.unacked.is_empty() && ack == s.last_ack_seen {
                s.dup_acks += 1;
                if s.dup_acks >= DUP_ACK_FAST_RETRANSMIT {
                    s.dup_acks = 0;
                    match s.unacked.front() {
                        Some(h) if h.sent => {
                            let kind = if h.payload.is_empty() && h.seq == 0 {
                                PacketKind::Syn
                            } else if h.payload.is_empty() {
                                PacketKind::Fin(h.seq)
                            } else {
                                PacketKind::Data(h.seq, h.payload.clone())
                            };
                            After::FastRetransmit(kind)
                        }
                        _ => After::Nothing,
                    }
                } else {
                    After::Nothing
                }
            } else {
                After::Nothing
            }
        };
        match after {
            After::Progress(acked_bytes) => {
                if acked_bytes > 0 {
                    self.events.push_back((id, EngineEvent::Sent(acked_bytes)));
                    self.events.push_back((id, EngineEvent::Writable));
                }
                self.pump_unsent(id);
                self.maybe_send_fin(id);
                let done_closing = self
                    .sockets
                    .get(&id)
                    .map(|s| s.state == SockState::Closing && s.fin_sent && s.unacked.is_empty())
                    .unwrap_or(false);
                if done_closing {
                    self.destroy(id);
                }
            }
            After::FastRetransmit(kind) => {
                trace!("fast retransmit on {id:?}");
                self.emit(id, kind);
            }
            After::Nothing => {}
        }
    }

    /// Transmit queued-but-unsent segments while the peer's window allows.
    fn pump_unsent(&mut self, id: SockId) {
        let to_send = {
            let Some(s) = self.sockets.get_mut(&id) else {
                return;
            };
            let budget = s.window_budget();
            let mut in_flight = s.in_flight();
            let mut out = Vec::new();
            for seg in s.unacked.iter_mut().filter(|seg| !seg.sent) {
                if in_flight + seg.payload.len() > budget {
                    break;
                }
                seg.sent = true;
                seg.sent_at_tick = self.tick;
                in_flight += seg.payload.len();
                out.push((seg.seq, seg.payload.clone()));
            }
            out
        };
        for (seq, payload) in to_send {
            self.emit(id, PacketKind::Data(seq, payload));
        }
    }

    fn accept_data(&mut self, id: SockId, seq: u32, payload: &[u8]) {
        let Some(s) = self.sockets.get_mut(&id) else {
            return;
        };
        s.ack_pending = true;
        if seq <= s.recv_cursor {
            // Duplicate; the ack goes out at burst end.
            return;
        }
        if payload.len() as u32 > s.recv_window {
            // Receiver overrun; drop, the peer retransmits once we drained.
            warn!("recv window overrun on {id:?}, dropping seq {seq}");
            return;
        }
        if seq == s.recv_cursor + 1 {
            s.recv_cursor = seq;
            s.recv_window = s.recv_window.saturating_sub(payload.len() as u32);
            let mut out = BytesMut::from(payload);
            // Pull any contiguous run out of the reorder buffer.
            while let Some(next) = s.reorder.remove(&(s.recv_cursor + 1)) {
                s.recv_cursor += 1;
                s.recv_window = s.recv_window.saturating_sub(next.len() as u32);
                out.extend_from_slice(&next);
            }
            self.events
                .push_back((id, EngineEvent::Readable(out.freeze())));
            self.deliver_eof_if_complete(id);
        } else {
            s.reorder
                .entry(seq)
                .or_insert_with(|| Bytes::copy_from_slice(payload));
        }
    }

    fn deliver_eof_if_complete(&mut self, id: SockId) {
        let Some(s) = self.sockets.get_mut(&id) else {
            return;
        };
        let Some(fin_seq) = s.peer_fin else {
            return;
        };
        if s.recv_cursor + 1 == fin_seq && !s.eof_delivered {
            s.recv_cursor = fin_seq;
            s.eof_delivered = true;
            self.events.push_back((id, EngineEvent::Eof));
        }
    }

    fn maybe_send_fin(&mut self, id: SockId) {
        let seq = {
            let Some(s) = self.sockets.get_mut(&id) else {
                return;
            };
            if !s.fin_queued || s.fin_sent || !s.unacked.is_empty() {
                return;
            }
            let seq = s.next_seq;
            s.next_seq += 1;
            s.fin_sent = true;
            s.unacked.push_back(Segment {
                seq,
                payload: Bytes::new(),
                sent: true,
                sent_at_tick: self.tick,
                retries: 0,
            });
            seq
        };
        self.emit(id, PacketKind::Fin(seq));
    }

    fn destroy(&mut self, id: SockId) {
        if let Some(s) = self.sockets.remove(&id) {
            self.index.remove(&(s.local_port, s.peer_ip, s.tag));
            self.events.push_back((id, EngineEvent::Destroying));
        }
    }

    fn alloc_id(&mut self) -> SockId {
        let id = SockId(self.next_id);
        self.next_id += 1;
        id
    }

    fn emit(&mut self, id: SockId, kind: PacketKind) {
        let Some(s) = self.sockets.get_mut(&id) else {
            return;
        };
        let (ptype, seq, payload) = match &kind {
            PacketKind::Syn => (PacketType::Syn, 0, Bytes::new()),
            PacketKind::SynAck => (PacketType::SynAck, 0, Bytes::new()),
            PacketKind::Ack => (PacketType::Ack, 0, Bytes::new()),
            PacketKind::Data(seq, payload) => (PacketType::Data, *seq, payload.clone()),
            PacketKind::Fin(seq) => (PacketType::Fin, *seq, Bytes::new()),
            PacketKind::Rst => (PacketType::Rst, 0, Bytes::new()),
        };
        // Every outgoing packet carries the cumulative ack, so any transmit
        // settles the deferred-ack debt.
        s.ack_pending = false;
        let packet = encode_packet(&s.tag, ptype, seq, s.recv_cursor, s.recv_window, &payload);
        self.transmits.push_back(Transmit {
            local_port: s.local_port,
            peer_ip: s.peer_ip,
            tag: s.tag,
            payload: packet,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A_PORT: u16 = 4000;
    const B_PORT: u16 = 5000;
    const A_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    impl Engine {
        fn flush_acks(&mut self) {
            let ids: Vec<SockId> = self.sockets.keys().copied().collect();
            for id in ids {
                self.issue_deferred_acks(id);
            }
        }

        /// Drain events: collect readable bytes (consuming them), note EOF,
        /// and any accepted socket.
        fn drain(&mut self, want: SockId) -> (Vec<u8>, bool, Option<SockId>) {
            let mut data = Vec::new();
            let mut eof = false;
            let mut accepted = None;
            while let Some((id, ev)) = self.poll_event() {
                match ev {
                    EngineEvent::Readable(b) if id == want => {
                        self.on_read_consumed(id, b.len());
                        data.extend_from_slice(&b);
                    }
                    EngineEvent::Eof if id == want => eof = true,
                    EngineEvent::Accepted { sock, .. } => accepted = Some(sock),
                    _ => {}
                }
            }
            (data, eof, accepted)
        }
    }

    /// Shuttle queued transmits between two engines until both go quiet.
    /// `keep` may drop datagrams to simulate loss.
    fn shuttle<F: FnMut(&Transmit) -> bool>(a: &mut Engine, b: &mut Engine, mut keep: F) {
        for _ in 0..2000 {
            let mut progressed = false;
            while let Some(t) = a.poll_transmit() {
                progressed = true;
                if keep(&t) {
                    b.process_datagram(B_PORT, A_IP, &t.payload, true);
                }
            }
            while let Some(t) = b.poll_transmit() {
                progressed = true;
                if keep(&t) {
                    a.process_datagram(A_PORT, B_IP, &t.payload, true);
                }
            }
            a.flush_acks();
            b.flush_acks();
            if !progressed {
                return;
            }
        }
    }

    fn connect_pair() -> (Engine, Engine, SockId, SockId) {
        let mut a = Engine::new();
        let mut b = Engine::new();
        let tag = Tag::for_peer(B_PORT);
        let a_sock = a.connect(A_PORT, B_IP, tag);
        shuttle(&mut a, &mut b, |_| true);
        let (_, _, accepted) = b.drain(SockId(u32::MAX));
        let b_sock = accepted.expect("acceptor socket");
        while a.poll_event().is_some() {}
        (a, b, a_sock, b_sock)
    }

    #[test]
    fn handshake_creates_both_sockets() {
        let (a, b, a_sock, b_sock) = connect_pair();
        assert!(a.is_alive(a_sock));
        assert!(b.is_alive(b_sock));
        assert_eq!(a.peer_of(a_sock).map(|p| p.0), Some(B_IP));
    }

    #[test]
    fn syn_without_acceptor_is_unhandled() {
        let mut a = Engine::new();
        let mut b = Engine::new();
        a.connect(A_PORT, B_IP, Tag::for_peer(B_PORT));
        let t = a.poll_transmit().expect("syn");
        assert_eq!(
            b.process_datagram(B_PORT, A_IP, &t.payload, false),
            Disposition::Unhandled
        );
    }

    #[test]
    fn content_arrives_byte_identical() {
        let (mut a, mut b, a_sock, b_sock) = connect_pair();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut received = Vec::new();
        let mut off = 0;
        for _ in 0..200 {
            if off < data.len() {
                off += a.write(a_sock, &data[off..]);
            }
            shuttle(&mut a, &mut b, |_| true);
            let (chunk, _, _) = b.drain(b_sock);
            received.extend_from_slice(&chunk);
            if received.len() == data.len() && off == data.len() {
                break;
            }
        }
        assert_eq!(received, data);
    }

    #[test]
    fn loss_is_repaired_by_retransmission() {
        let (mut a, mut b, a_sock, b_sock) = connect_pair();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        let mut written = 0;
        while written < data.len() {
            written += a.write(a_sock, &data[written..]);
        }
        // Drop every third datagram on the first delivery round.
        let mut n = 0;
        shuttle(&mut a, &mut b, |_| {
            n += 1;
            n % 3 != 0
        });
        let (first, _, _) = b.drain(b_sock);
        let mut received = first;
        assert!(received.len() < data.len());
        for _ in 0..300 {
            a.check_timeouts();
            b.check_timeouts();
            shuttle(&mut a, &mut b, |_| true);
            let (chunk, _, _) = b.drain(b_sock);
            received.extend_from_slice(&chunk);
            if received.len() == data.len() {
                break;
            }
        }
        assert_eq!(received, data);
    }

    #[test]
    fn graceful_close_delivers_eof_then_destroys() {
        let (mut a, mut b, a_sock, b_sock) = connect_pair();
        assert_eq!(a.write(a_sock, b"farewell"), 8);
        a.close(a_sock, false);
        for _ in 0..20 {
            shuttle(&mut a, &mut b, |_| true);
            a.check_timeouts();
            b.check_timeouts();
        }
        let (data, eof, _) = b.drain(b_sock);
        assert_eq!(data, b"farewell");
        assert!(eof);
        // The closing side destroyed its socket once the FIN was acked.
        assert!(!a.is_alive(a_sock));
    }

    #[test]
    fn abort_close_resets_peer() {
        let (mut a, mut b, a_sock, b_sock) = connect_pair();
        a.close(a_sock, true);
        assert!(!a.is_alive(a_sock));
        shuttle(&mut a, &mut b, |_| true);
        let mut reset = false;
        while let Some((id, ev)) = b.poll_event() {
            if id == b_sock {
                if let EngineEvent::Error(kind) = ev {
                    assert_eq!(kind, ErrorKind::ConnectionReset);
                    reset = true;
                }
            }
        }
        assert!(reset);
    }

    #[test]
    fn connect_times_out_without_peer() {
        let mut a = Engine::new();
        let sock = a.connect(A_PORT, B_IP, Tag::for_peer(B_PORT));
        for _ in 0..300 {
            a.check_timeouts();
            while a.poll_transmit().is_some() {}
        }
        let mut timed_out = false;
        while let Some((id, ev)) = a.poll_event() {
            if id == sock {
                if let EngineEvent::Error(kind) = ev {
                    assert_eq!(kind, ErrorKind::TimedOut);
                    timed_out = true;
                }
            }
        }
        assert!(timed_out);
        assert!(!a.is_alive(sock));
    }

    #[test]
    fn datagrams_always_start_with_the_tag() {
        let mut a = Engine::new();
        let tag = Tag::for_peer(B_PORT);
        a.connect(A_PORT, B_IP, tag);
        let t = a.poll_transmit().expect("syn transmit");
        assert_eq!(&t.payload[..TAG_LEN], &tag.0);
        assert_eq!(tag.port_hint(), B_PORT);
    }

    #[test]
    fn reordered_segments_are_delivered_in_order() {
        let (mut a, mut b, a_sock, b_sock) = connect_pair();
        let data: Vec<u8> = (0..5 * MAX_SEGMENT).map(|i| (i % 256) as u8).collect();
        let mut written = 0;
        while written < data.len() {
            written += a.write(a_sock, &data[written..]);
        }
        // Deliver A's datagrams to B in reverse order.
        let mut batch = Vec::new();
        while let Some(t) = a.poll_transmit() {
            batch.push(t);
        }
        for t in batch.into_iter().rev() {
            b.process_datagram(B_PORT, A_IP, &t.payload, true);
        }
        b.flush_acks();
        shuttle(&mut a, &mut b, |_| true);
        let (received, _, _) = b.drain(b_sock);
        assert_eq!(received, data);
    }
}
