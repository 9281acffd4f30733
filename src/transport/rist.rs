// ABOUTME: Reliable UDP overlay with RIST-style virtual-port demultiplexing
// ABOUTME: Sequence numbers, NACK retransmission and reordering bounded by a recovery window

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::messages::{BaseMessage, EncodedFrame, BASE_MESSAGE_SIZE};
use crate::transport::{Endpoint, TransportReader, TransportWriter};

/// Virtual port for server -> client audio chunks
pub const VPORT_AUDIO: u16 = 1000;
/// Virtual port for server -> client control messages
pub const VPORT_CONTROL: u16 = 2000;
/// Virtual port for client -> server messages
pub const VPORT_BACKCHANNEL: u16 = 3000;

const KIND_DATA: u8 = 0;
const KIND_NACK: u8 = 1;
const KIND_PARAMS: u8 = 2;

/// Overlay datagram header: vport u16, kind u8, seq u32 (little-endian)
const OVERLAY_HEADER: usize = 7;

/// Peers silent for this long are dropped by the listener
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunable recovery parameters, negotiable from server to client.
///
/// When the server pushes new parameters mid-stream the client tears down
/// its receive state and rebuilds it; datagrams in flight across the rebuild
/// are lost as a short burst, which the jitter buffer recovers from with a
/// hard sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryParams {
    /// Lower bound of the retransmission window in ms
    pub recovery_length_min_ms: u32,
    /// Upper bound of the retransmission window in ms; sender history and
    /// receiver waiting are both bounded by this
    pub recovery_length_max_ms: u32,
    /// Shortest assumed round trip; paces NACK emission
    pub rtt_min_ms: u32,
    /// Longest assumed round trip
    pub rtt_max_ms: u32,
    /// How long the receiver holds out-of-order datagrams before skipping
    pub reorder_buffer_ms: u32,
    /// Retries before the first NACK escalation
    pub min_retries: u32,
    /// Retries after which a sequence is abandoned
    pub max_retries: u32,
}

impl Default for RecoveryParams {
    fn default() -> Self {
        RecoveryParams {
            recovery_length_min_ms: 20,
            recovery_length_max_ms: 50,
            rtt_min_ms: 5,
            rtt_max_ms: 50,
            reorder_buffer_ms: 15,
            min_retries: 3,
            max_retries: 10,
        }
    }
}

impl RecoveryParams {
    fn write(&self, buf: &mut BytesMut) {
        for v in [
            self.recovery_length_min_ms,
            self.recovery_length_max_ms,
            self.rtt_min_ms,
            self.rtt_max_ms,
            self.reorder_buffer_ms,
            self.min_retries,
            self.max_retries,
        ] {
            buf.put_u32_le(v);
        }
    }

    fn read(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 28 {
            return Err(Error::Protocol("truncated recovery params".into()));
        }
        Ok(RecoveryParams {
            recovery_length_min_ms: buf.get_u32_le(),
            recovery_length_max_ms: buf.get_u32_le(),
            rtt_min_ms: buf.get_u32_le(),
            rtt_max_ms: buf.get_u32_le(),
            reorder_buffer_ms: buf.get_u32_le(),
            min_retries: buf.get_u32_le(),
            max_retries: buf.get_u32_le(),
        })
    }
}

// =============================================================================
// Reliability engines (pure state machines, tested in isolation)
// =============================================================================

/// Sender history for one virtual port
#[derive(Debug, Default)]
struct SendState {
    next_seq: u32,
    window: VecDeque<(u32, Bytes, Instant)>,
}

impl SendState {
    /// Record `datagram` and hand out its sequence number
    fn push(&mut self, datagram: Bytes, now: Instant) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.window.push_back((seq, datagram, now));
        seq
    }

    /// Drop history older than the recovery window
    fn prune(&mut self, now: Instant, params: &RecoveryParams) {
        let max_age = Duration::from_millis(params.recovery_length_max_ms as u64);
        while let Some((_, _, sent)) = self.window.front() {
            if now.duration_since(*sent) > max_age {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Look up a datagram for retransmission
    fn get(&self, seq: u32) -> Option<Bytes> {
        self.window
            .iter()
            .find(|(s, _, _)| *s == seq)
            .map(|(_, d, _)| d.clone())
    }
}

#[derive(Debug)]
struct Missing {
    since: Instant,
    last_nack: Option<Instant>,
    retries: u32,
}

/// Receiver reordering and gap tracking for one virtual port
#[derive(Debug, Default)]
struct ReceiveState {
    expected: Option<u32>,
    buffered: BTreeMap<u32, Bytes>,
    missing: BTreeMap<u32, Missing>,
}

impl ReceiveState {
    /// Accept a datagram; returns every payload now deliverable in order
    fn on_data(&mut self, seq: u32, payload: Bytes, now: Instant) -> Vec<Bytes> {
        let expected = match self.expected {
            None => {
                // First datagram fixes the base sequence.
                self.expected = Some(seq.wrapping_add(1));
                return vec![payload];
            }
            Some(e) => e,
        };

        let ahead = seq.wrapping_sub(expected);
        if ahead > u32::MAX / 2 {
            // Older than expected: a retransmission that already got skipped,
            // or a duplicate. Drop it.
            return Vec::new();
        }
        if ahead == 0 {
            let mut out = vec![payload];
            let mut next = expected.wrapping_add(1);
            while let Some(buffered) = self.buffered.remove(&next) {
                out.push(buffered);
                next = next.wrapping_add(1);
            }
            self.expected = Some(next);
            out
        } else {
            // Gap: buffer this one, track everything between as missing.
            self.missing.remove(&seq);
            self.buffered.insert(seq, payload);
            let mut s = expected;
            while s != seq {
                self.missing.entry(s).or_insert(Missing {
                    since: now,
                    last_nack: None,
                    retries: 0,
                });
                s = s.wrapping_add(1);
            }
            Vec::new()
        }
    }

    /// Periodic maintenance: emit NACKs for gaps and skip sequences that
    /// outlived the recovery window. Returns (seqs to NACK, deliverable
    /// payloads unblocked by skipping).
    fn tick(&mut self, now: Instant, params: &RecoveryParams) -> (Vec<u32>, Vec<Bytes>) {
        let nack_pace = Duration::from_millis(params.rtt_min_ms.max(1) as u64);
        let reorder = Duration::from_millis(params.reorder_buffer_ms as u64);
        let give_up = Duration::from_millis(params.recovery_length_max_ms as u64);

        let mut nacks = Vec::new();
        let mut abandoned = Vec::new();
        for (&seq, m) in self.missing.iter_mut() {
            let age = now.duration_since(m.since);
            if age > give_up || m.retries >= params.max_retries {
                abandoned.push(seq);
                continue;
            }
            // Wait one reorder interval before the first NACK; plain
            // reordering usually resolves itself.
            let due = match m.last_nack {
                None => age >= reorder.min(nack_pace),
                Some(last) => now.duration_since(last) >= nack_pace,
            };
            if due {
                m.last_nack = Some(now);
                m.retries += 1;
                nacks.push(seq);
            }
        }

        let mut delivered = Vec::new();
        if !abandoned.is_empty() {
            for seq in &abandoned {
                self.missing.remove(seq);
            }
            // Advance expected past the lowest abandoned run and flush.
            if let Some(expected) = self.expected {
                let mut next = expected;
                loop {
                    if let Some(payload) = self.buffered.remove(&next) {
                        delivered.push(payload);
                        next = next.wrapping_add(1);
                    } else if !self.missing.contains_key(&next)
                        && (!self.buffered.is_empty()
                            && self
                                .buffered
                                .keys()
                                .any(|&k| k.wrapping_sub(next) < u32::MAX / 2))
                    {
                        // A skipped sequence: step over it.
                        next = next.wrapping_add(1);
                    } else {
                        break;
                    }
                }
                self.expected = Some(next);
            }
        }
        (nacks, delivered)
    }
}

// =============================================================================
// Datagram encoding
// =============================================================================

fn encode_datagram(vport: u16, kind: u8, seq: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(OVERLAY_HEADER + payload.len());
    buf.put_u16_le(vport);
    buf.put_u8(kind);
    buf.put_u32_le(seq);
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_datagram(mut data: Bytes) -> Result<(u16, u8, u32, Bytes)> {
    if data.remaining() < OVERLAY_HEADER {
        return Err(Error::Protocol("short rist datagram".into()));
    }
    let vport = data.get_u16_le();
    let kind = data.get_u8();
    let seq = data.get_u32_le();
    Ok((vport, kind, seq, data))
}

fn parse_message(payload: Bytes) -> Result<(BaseMessage, Bytes)> {
    let header = BaseMessage::read(&payload)?;
    let body = payload.slice(BASE_MESSAGE_SIZE..);
    if body.len() != header.size as usize {
        return Err(Error::Protocol("rist payload size mismatch".into()));
    }
    Ok((header, body))
}

// =============================================================================
// Shared endpoint plumbing
// =============================================================================

type SendStates = Arc<Mutex<HashMap<u16, SendState>>>;

async fn send_data(
    socket: &UdpSocket,
    peer: Option<SocketAddr>,
    states: &SendStates,
    params: &RecoveryParams,
    vport: u16,
    payload: &[u8],
) -> Result<()> {
    let datagram = {
        let mut states = states.lock().unwrap();
        let state = states.entry(vport).or_default();
        let now = Instant::now();
        state.prune(now, params);
        let seq = state.next_seq;
        let datagram = encode_datagram(vport, KIND_DATA, seq, payload);
        state.push(datagram.clone(), now);
        datagram
    };
    match peer {
        Some(addr) => socket.send_to(&datagram, addr).await?,
        None => socket.send(&datagram).await?,
    };
    Ok(())
}

async fn handle_nack(
    socket: &UdpSocket,
    peer: Option<SocketAddr>,
    states: &SendStates,
    vport: u16,
    mut payload: Bytes,
) {
    while payload.remaining() >= 4 {
        let seq = payload.get_u32_le();
        let datagram = states
            .lock()
            .unwrap()
            .get(&vport)
            .and_then(|s| s.get(seq));
        if let Some(datagram) = datagram {
            log::trace!("retransmitting vport {vport} seq {seq}");
            let result = match peer {
                Some(addr) => socket.send_to(&datagram, addr).await,
                None => socket.send(&datagram).await,
            };
            if let Err(e) = result {
                log::debug!("retransmit failed: {e}");
            }
        }
    }
}

async fn send_nacks(
    socket: &UdpSocket,
    peer: Option<SocketAddr>,
    vport: u16,
    seqs: &[u32],
) {
    if seqs.is_empty() {
        return;
    }
    let mut payload = BytesMut::with_capacity(seqs.len() * 4);
    for seq in seqs {
        payload.put_u32_le(*seq);
    }
    let datagram = encode_datagram(vport, KIND_NACK, 0, &payload);
    let result = match peer {
        Some(addr) => socket.send_to(&datagram, addr).await,
        None => socket.send(&datagram).await,
    };
    if let Err(e) = result {
        log::debug!("nack send failed: {e}");
    }
}

fn deliver(tx: &mpsc::UnboundedSender<(BaseMessage, Bytes)>, payload: Bytes) {
    match parse_message(payload) {
        Ok(msg) => {
            let _ = tx.send(msg);
        }
        Err(e) => log::warn!("dropping undecodable rist payload: {e}"),
    }
}

// =============================================================================
// Reader / writer halves
// =============================================================================

/// Read half of a RIST overlay session: an ordered message queue
pub struct RistReader {
    rx: mpsc::UnboundedReceiver<(BaseMessage, Bytes)>,
}

impl RistReader {
    /// Receive the next in-order message
    pub async fn read_message(&mut self) -> Result<(BaseMessage, Bytes)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Transport("rist session closed".into()))
    }
}

/// Which end of the overlay a writer serves; decides the outgoing vport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RistRole {
    /// Client: everything goes to the backchannel
    Client,
    /// Server: audio on 1000, control on 2000
    Server,
}

/// Write half of a RIST overlay session
pub struct RistWriter {
    socket: Arc<UdpSocket>,
    /// None when the socket is connected (client side)
    peer: Option<SocketAddr>,
    role: RistRole,
    params: RecoveryParams,
    send_states: SendStates,
}

impl RistWriter {
    /// Write one encoded message on the role-appropriate virtual port
    pub async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
        let vport = match self.role {
            RistRole::Client => VPORT_BACKCHANNEL,
            RistRole::Server if frame.is_chunk => VPORT_AUDIO,
            RistRole::Server => VPORT_CONTROL,
        };
        send_data(
            &self.socket,
            self.peer,
            &self.send_states,
            &self.params,
            vport,
            &frame.bytes,
        )
        .await
    }

    /// Push new recovery parameters to the peer (server side).
    /// The client rebuilds its receive state on arrival.
    pub async fn send_params(&mut self, params: &RecoveryParams) -> Result<()> {
        self.params = *params;
        let mut payload = BytesMut::with_capacity(28);
        params.write(&mut payload);
        let datagram = encode_datagram(VPORT_CONTROL, KIND_PARAMS, 0, &payload);
        match self.peer {
            Some(addr) => self.socket.send_to(&datagram, addr).await?,
            None => self.socket.send(&datagram).await?,
        };
        Ok(())
    }

    /// No transport-level close handshake; dropping the halves is enough
    pub async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Client
// =============================================================================

/// Connect the overlay to a server endpoint
pub async fn connect(endpoint: &Endpoint) -> Result<(TransportReader, TransportWriter)> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect((endpoint.host.as_str(), endpoint.port))
        .await?;
    let socket = Arc::new(socket);
    let params = RecoveryParams::default();
    let send_states: SendStates = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(client_task(
        Arc::clone(&socket),
        Arc::clone(&send_states),
        params,
        tx,
    ));

    Ok((
        TransportReader::Rist(RistReader { rx }),
        TransportWriter::Rist(RistWriter {
            socket,
            peer: None,
            role: RistRole::Client,
            params,
            send_states,
        }),
    ))
}

async fn client_task(
    socket: Arc<UdpSocket>,
    send_states: SendStates,
    mut params: RecoveryParams,
    tx: mpsc::UnboundedSender<(BaseMessage, Bytes)>,
) {
    let mut recv_states: HashMap<u16, ReceiveState> = HashMap::new();
    let mut buf = vec![0u8; 65_536];
    let mut tick = tokio::time::interval(Duration::from_millis(params.rtt_min_ms.max(1) as u64));

    loop {
        tokio::select! {
            received = socket.recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(e) => {
                        log::warn!("rist socket error: {e}");
                        return;
                    }
                };
                let data = Bytes::copy_from_slice(&buf[..len]);
                let (vport, kind, seq, payload) = match decode_datagram(data) {
                    Ok(d) => d,
                    Err(e) => {
                        log::debug!("bad rist datagram: {e}");
                        continue;
                    }
                };
                match kind {
                    KIND_DATA => {
                        let state = recv_states.entry(vport).or_default();
                        for ready in state.on_data(seq, payload, Instant::now()) {
                            deliver(&tx, ready);
                        }
                    }
                    KIND_NACK => {
                        handle_nack(&socket, None, &send_states, vport, payload).await;
                    }
                    KIND_PARAMS => {
                        match RecoveryParams::read(payload) {
                            Ok(new_params) if new_params != params => {
                                log::info!("recovery params changed, rebuilding receive state");
                                // Rebuild loses whatever was buffered; the
                                // jitter buffer hard-syncs over the gap.
                                params = new_params;
                                recv_states.clear();
                                tick = tokio::time::interval(Duration::from_millis(
                                    params.rtt_min_ms.max(1) as u64,
                                ));
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("bad recovery params: {e}"),
                        }
                    }
                    other => log::debug!("unknown rist datagram kind {other}"),
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for (&vport, state) in recv_states.iter_mut() {
                    let (nacks, unblocked) = state.tick(now, &params);
                    send_nacks(&socket, None, vport, &nacks).await;
                    for payload in unblocked {
                        deliver(&tx, payload);
                    }
                }
            }
        }
    }
}

// =============================================================================
// Server
// =============================================================================

struct Peer {
    tx: mpsc::UnboundedSender<(BaseMessage, Bytes)>,
    recv: ReceiveState,
    send_states: SendStates,
    last_seen: Instant,
}

/// Accepts overlay sessions, one per remote address
pub struct RistListener {
    accept_rx: mpsc::UnboundedReceiver<(TransportReader, TransportWriter, SocketAddr)>,
}

impl RistListener {
    /// Bind the overlay on `addr`
    pub async fn bind(addr: SocketAddr, params: RecoveryParams) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        tokio::spawn(listener_task(socket, params, accept_tx));
        Ok(RistListener { accept_rx })
    }

    /// Wait for the next new peer
    pub async fn accept(&mut self) -> Result<(TransportReader, TransportWriter, SocketAddr)> {
        self.accept_rx
            .recv()
            .await
            .ok_or_else(|| Error::Transport("rist listener closed".into()))
    }
}

async fn listener_task(
    socket: Arc<UdpSocket>,
    params: RecoveryParams,
    accept_tx: mpsc::UnboundedSender<(TransportReader, TransportWriter, SocketAddr)>,
) {
    let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();
    let mut buf = vec![0u8; 65_536];
    let mut tick = tokio::time::interval(Duration::from_millis(params.rtt_min_ms.max(1) as u64));

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, addr) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("rist socket error: {e}");
                        return;
                    }
                };
                let data = Bytes::copy_from_slice(&buf[..len]);
                let (vport, kind, seq, payload) = match decode_datagram(data) {
                    Ok(d) => d,
                    Err(e) => {
                        log::debug!("bad rist datagram from {addr}: {e}");
                        continue;
                    }
                };

                if !peers.contains_key(&addr) {
                    log::info!("new rist peer {addr}");
                    let (tx, rx) = mpsc::unbounded_channel();
                    let send_states: SendStates = Arc::new(Mutex::new(HashMap::new()));
                    let reader = TransportReader::Rist(RistReader { rx });
                    let writer = TransportWriter::Rist(RistWriter {
                        socket: Arc::clone(&socket),
                        peer: Some(addr),
                        role: RistRole::Server,
                        params,
                        send_states: Arc::clone(&send_states),
                    });
                    if accept_tx.send((reader, writer, addr)).is_err() {
                        return;
                    }
                    peers.insert(addr, Peer {
                        tx,
                        recv: ReceiveState::default(),
                        send_states,
                        last_seen: Instant::now(),
                    });
                }
                let peer = peers.get_mut(&addr).unwrap();
                peer.last_seen = Instant::now();

                match kind {
                    KIND_DATA if vport == VPORT_BACKCHANNEL => {
                        for ready in peer.recv.on_data(seq, payload, Instant::now()) {
                            deliver(&peer.tx, ready);
                        }
                    }
                    KIND_NACK => {
                        handle_nack(&socket, Some(addr), &peer.send_states, vport, payload).await;
                    }
                    other => log::debug!("unexpected rist datagram kind {other} vport {vport} from {addr}"),
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for (addr, peer) in peers.iter_mut() {
                    let (nacks, unblocked) = peer.recv.tick(now, &params);
                    send_nacks(&socket, Some(*addr), VPORT_BACKCHANNEL, &nacks).await;
                    for payload in unblocked {
                        deliver(&peer.tx, payload);
                    }
                }
                peers.retain(|addr, peer| {
                    let alive = now.duration_since(peer.last_seen) < PEER_TIMEOUT
                        && !peer.tx.is_closed();
                    if !alive {
                        log::info!("dropping idle rist peer {addr}");
                    }
                    alive
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    #[test]
    fn in_order_delivery_passes_through() {
        let mut rs = ReceiveState::default();
        let now = Instant::now();
        assert_eq!(rs.on_data(0, payload(0), now).len(), 1);
        assert_eq!(rs.on_data(1, payload(1), now).len(), 1);
        assert_eq!(rs.on_data(2, payload(2), now).len(), 1);
        assert!(rs.missing.is_empty());
    }

    #[test]
    fn gap_buffers_until_filled() {
        let mut rs = ReceiveState::default();
        let now = Instant::now();
        assert_eq!(rs.on_data(0, payload(0), now).len(), 1);
        // 1 missing: 2 and 3 wait.
        assert!(rs.on_data(2, payload(2), now).is_empty());
        assert!(rs.on_data(3, payload(3), now).is_empty());
        assert!(rs.missing.contains_key(&1));
        // The retransmission releases everything in order.
        let out = rs.on_data(1, payload(1), now);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0][0], 1);
        assert_eq!(out[2][0], 3);
    }

    #[test]
    fn duplicates_and_stale_are_dropped() {
        let mut rs = ReceiveState::default();
        let now = Instant::now();
        rs.on_data(0, payload(0), now);
        rs.on_data(1, payload(1), now);
        assert!(rs.on_data(0, payload(0), now).is_empty());
        assert!(rs.on_data(1, payload(1), now).is_empty());
    }

    #[test]
    fn tick_nacks_then_abandons() {
        let mut rs = ReceiveState::default();
        let params = RecoveryParams::default();
        let t0 = Instant::now();
        rs.on_data(0, payload(0), t0);
        rs.on_data(2, payload(2), t0);

        // After the reorder interval the gap gets NACKed.
        let t1 = t0 + Duration::from_millis(params.reorder_buffer_ms as u64 + 1);
        let (nacks, delivered) = rs.tick(t1, &params);
        assert_eq!(nacks, vec![1]);
        assert!(delivered.is_empty());

        // Past the recovery window the sequence is skipped and the
        // buffered successor is released.
        let t2 = t0 + Duration::from_millis(params.recovery_length_max_ms as u64 + 1);
        let (_, delivered) = rs.tick(t2, &params);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0][0], 2);
        assert!(rs.missing.is_empty());
    }

    #[test]
    fn send_window_serves_retransmissions_then_expires() {
        let mut ss = SendState::default();
        let params = RecoveryParams::default();
        let t0 = Instant::now();
        let seq = ss.push(payload(7), t0);
        assert_eq!(ss.get(seq).unwrap()[0], 7);

        ss.prune(
            t0 + Duration::from_millis(params.recovery_length_max_ms as u64 + 1),
            &params,
        );
        assert!(ss.get(seq).is_none());
    }

    #[test]
    fn params_round_trip() {
        let params = RecoveryParams {
            recovery_length_min_ms: 1,
            recovery_length_max_ms: 2,
            rtt_min_ms: 3,
            rtt_max_ms: 4,
            reorder_buffer_ms: 5,
            min_retries: 6,
            max_retries: 7,
        };
        let mut buf = BytesMut::new();
        params.write(&mut buf);
        assert_eq!(RecoveryParams::read(buf.freeze()).unwrap(), params);
    }
}
