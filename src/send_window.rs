use std::cmp::min;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::NudpConfig;
use crate::connection_key::ConnectionEpoch;
use crate::error::{NudpError, NudpResult};
use crate::packet_header::{PacketFlags, PacketHeader, PacketType};
use crate::packet_id::PacketId;

/// single-shot signal for the caller of a send operation
pub type SendCompletion = oneshot::Sender<NudpResult<()>>;

struct OutboundMessage {
    payload: Bytes,
    /// number of bytes that were already copied into packets
    write_cursor: usize,
    num_packets: u64,
    acked_packets: u64,
    completion: Option<SendCompletion>,
}
impl OutboundMessage {
    fn remaining(&self) -> usize {
        self.payload.len() - self.write_cursor
    }

    fn is_fully_segmented(&self) -> bool {
        self.write_cursor >= self.payload.len()
    }

    fn is_fully_acked(&self) -> bool {
        self.is_fully_segmented() && self.acked_packets == self.num_packets
    }
}

struct InFlightPacket {
    /// the complete datagram, header included
    buf: Bytes,
    message_id: u64,
    transmits: u32,
    last_sent: Option<Instant>,
    acked: bool,
}

/// Limits and timings of the send pipeline, taken from [NudpConfig]
#[derive(Clone, Debug)]
pub struct SendWindowLimits {
    pub max_payload_len: usize,
    pub window_length_max: usize,
    pub window_bytes_max: usize,
    pub send_delay_threshold: Duration,
    pub send_delay_max: Duration,
    pub batch_bytes: usize,
}
impl From<&NudpConfig> for SendWindowLimits {
    fn from(config: &NudpConfig) -> Self {
        SendWindowLimits {
            max_payload_len: config.max_payload_len(),
            window_length_max: config.window_length_max,
            window_bytes_max: config.window_bytes_max,
            send_delay_threshold: config.send_delay_threshold,
            send_delay_max: config.send_delay_max,
            batch_bytes: config.batch_bytes,
        }
    }
}

/// Result of a single pacing pass: the datagrams to put on the wire now, and the delay after
///  which the next pass is due
pub struct PacingPass {
    pub packets: Vec<Bytes>,
    pub next_delay: Duration,
}

/// The send side of a connection: outbound messages are queued, segmented into DATA packets
///  when there is room in the window, and (re)transmitted by periodic pacing passes until they
///  are acknowledged.
///
/// The window is ordered by sequence number and trimmed from the front only. Acknowledgements
///  arrive in any order; an acked packet stops being transmitted immediately, but stays in the
///  window (and counts toward its length limit) until all packets before it are acked as well.
///
/// The pending-transmission ring holds the ids of un-acked packets in round-robin order. Acked
///  ids are removed from it lazily, i.e. they are skipped and dropped when the ring walk reaches
///  them.
pub struct SendWindow {
    epoch: ConnectionEpoch,
    limits: SendWindowLimits,

    messages: FxHashMap<u64, OutboundMessage>,
    message_queue: VecDeque<u64>,
    next_message_id: u64,

    window: BTreeMap<PacketId, InFlightPacket>,
    /// bytes of un-acked packets in the window
    window_bytes: usize,
    pending: VecDeque<PacketId>,
    /// sequence number for the next packet produced by segmentation
    next_seq: PacketId,
}

impl SendWindow {
    pub fn new(epoch: ConnectionEpoch, limits: SendWindowLimits) -> SendWindow {
        SendWindow {
            epoch,
            limits,
            messages: Default::default(),
            message_queue: Default::default(),
            next_message_id: 0,
            window: Default::default(),
            window_bytes: 0,
            pending: Default::default(),
            next_seq: PacketId::FIRST,
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    pub fn queue_len(&self) -> usize {
        self.message_queue.len()
    }

    pub fn next_seq(&self) -> PacketId {
        self.next_seq
    }

    pub fn has_unsegmented_messages(&self) -> bool {
        !self.message_queue.is_empty()
    }

    /// Appends a message to the outbound queue. The returned receiver fires once every packet of
    ///  the message is acknowledged, or with an error if the connection is closed first.
    pub fn enqueue(&mut self, payload: Bytes) -> NudpResult<oneshot::Receiver<NudpResult<()>>> {
        if payload.is_empty() {
            return Err(NudpError::EmptyMessage);
        }

        let (completion, receiver) = oneshot::channel();

        let message_id = self.next_message_id;
        self.next_message_id += 1;

        trace!("enqueueing message #{} with {} bytes", message_id, payload.len());
        self.messages.insert(message_id, OutboundMessage {
            payload,
            write_cursor: 0,
            num_packets: 0,
            acked_packets: 0,
            completion: Some(completion),
        });
        self.message_queue.push_back(message_id);
        Ok(receiver)
    }

    /// remove acknowledged packets from the front of the window
    pub fn trim(&mut self) {
        while let Some(entry) = self.window.first_entry() {
            if !entry.get().acked {
                break;
            }
            trace!("trimming packet #{} from the send window", entry.key());
            entry.remove();
        }
    }

    /// segment queued messages into packets while the window has room
    pub fn fill(&mut self) {
        while self.window.len() < self.limits.window_length_max && self.window_bytes < self.limits.window_bytes_max {
            let Some(&message_id) = self.message_queue.front() else {
                break;
            };
            let Some(message) = self.messages.get_mut(&message_id) else {
                self.message_queue.pop_front();
                continue;
            };

            let message_remaining = message.remaining();
            let payload_len = min(self.limits.max_payload_len, message_remaining);
            let flags = if payload_len == message_remaining {
                PacketFlags::BOUNDARY_END
            }
            else {
                PacketFlags::empty()
            };

            let seq = self.next_seq;
            let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload_len);
            PacketHeader::new(PacketType::Data, self.epoch, seq.to_raw(), flags)
                .ser(&mut buf);
            buf.put_slice(&message.payload[message.write_cursor..message.write_cursor + payload_len]);

            message.write_cursor += payload_len;
            message.num_packets += 1;
            if message.is_fully_segmented() {
                self.message_queue.pop_front();
            }

            trace!("segmented packet #{} with {} payload bytes from message #{}", seq, payload_len, message_id);

            self.window_bytes += buf.len();
            self.window.insert(seq, InFlightPacket {
                buf: buf.freeze(),
                message_id,
                transmits: 0,
                last_sent: None,
                acked: false,
            });
            self.pending.push_back(seq);
            self.next_seq += 1;
        }
    }

    /// Trims and refills the window, then walks the pending ring once, returning every packet
    ///  that was not transmitted within the threshold (up to the batch cap).
    ///
    /// The delay until the next pass is the time until the soonest skipped or just-sent packet
    ///  becomes eligible again, capped by `send_delay_max`. It is zero only if the batch cap cut
    ///  the walk short.
    pub fn pacing_pass(&mut self, now: Instant) -> PacingPass {
        self.trim();
        self.fill();

        let mut packets = Vec::new();
        let mut batch = 0;
        let mut next_delay = self.limits.send_delay_max;

        let ring_len = self.pending.len();
        for _ in 0..ring_len {
            if batch >= self.limits.batch_bytes {
                trace!("batch limit of {} bytes reached", self.limits.batch_bytes);
                next_delay = Duration::ZERO;
                break;
            }

            let Some(packet_id) = self.pending.pop_front() else {
                break;
            };
            let Some(packet) = self.window.get_mut(&packet_id) else {
                continue;
            };
            if packet.acked {
                continue;
            }
            self.pending.push_back(packet_id);

            let elapsed = packet.last_sent.map(|t| now.saturating_duration_since(t));
            match elapsed {
                Some(elapsed) if elapsed < self.limits.send_delay_threshold => {
                    next_delay = min(next_delay, self.limits.send_delay_threshold - elapsed);
                }
                _ => {
                    if packet.transmits > 0 {
                        debug!("retransmitting packet #{} (transmission #{})", packet_id, packet.transmits + 1);
                    }
                    packet.transmits += 1;
                    packet.last_sent = Some(now);
                    batch += packet.buf.len();
                    packets.push(packet.buf.clone());
                    next_delay = min(next_delay, self.limits.send_delay_threshold);
                }
            }
        }

        PacingPass { packets, next_delay }
    }

    /// Marks acknowledged packets and resolves the completions of messages that are now fully
    ///  acknowledged. Unknown or repeated ids are ignored.
    pub fn on_ack(&mut self, acked: &[PacketId]) {
        for packet_id in acked {
            let Some(packet) = self.window.get_mut(packet_id) else {
                trace!("ignoring ack for unknown packet #{}", packet_id);
                continue;
            };
            if packet.acked {
                trace!("ignoring repeated ack for packet #{}", packet_id);
                continue;
            }

            packet.acked = true;
            self.window_bytes -= packet.buf.len();

            let message_id = packet.message_id;
            let Some(message) = self.messages.get_mut(&message_id) else {
                continue;
            };
            message.acked_packets += 1;

            if message.is_fully_acked() {
                trace!("message #{} is fully acknowledged", message_id);
                if let Some(mut message) = self.messages.remove(&message_id) {
                    if let Some(completion) = message.completion.take() {
                        let _ = completion.send(Ok(()));
                    }
                }
            }
        }
    }

    /// Discards all window and queue state, returning the completions of all messages that were
    ///  not fully acknowledged
    pub fn drain(&mut self) -> Vec<SendCompletion> {
        let completions = self.messages
            .drain()
            .filter_map(|(_, mut message)| message.completion.take())
            .collect();

        self.message_queue.clear();
        self.window.clear();
        self.pending.clear();
        self.window_bytes = 0;
        completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::sync::oneshot::error::TryRecvError;

    const EPOCH: ConnectionEpoch = ConnectionEpoch { conn_time: 3, conn_rand: 4 };

    fn limits() -> SendWindowLimits {
        SendWindowLimits::from(&NudpConfig::default())
    }

    fn parse(buf: &[u8]) -> (PacketHeader, Vec<u8>) {
        let mut b = buf;
        let header = PacketHeader::deser(&mut b).unwrap();
        (header, b.to_vec())
    }

    fn ids(raw: &[u64]) -> Vec<PacketId> {
        raw.iter().map(|&id| PacketId::from_raw(id)).collect()
    }

    #[test]
    fn test_enqueue_empty_message() {
        let mut window = SendWindow::new(EPOCH, limits());
        assert_eq!(window.enqueue(Bytes::new()).err(), Some(NudpError::EmptyMessage));
        assert_eq!(window.queue_len(), 0);
    }

    #[test]
    fn test_segmentation_5000_bytes_mtu_1200() {
        let mut window = SendWindow::new(EPOCH, limits());
        let message = (0..5000).map(|i| i as u8).collect::<Vec<_>>();
        let mut receiver = window.enqueue(Bytes::from(message.clone())).unwrap();

        let pass = window.pacing_pass(Instant::now());
        assert_eq!(pass.packets.len(), 5);
        assert_eq!(window.window_len(), 5);
        assert_eq!(window.queue_len(), 0);

        let mut reassembled = Vec::new();
        for (i, packet) in pass.packets.iter().enumerate() {
            let (header, payload) = parse(packet);
            assert_eq!(header.packet_type, PacketType::Data);
            assert_eq!(header.epoch, EPOCH);
            assert_eq!(header.seq, i as u64 + 1);
            assert_eq!(header.is_boundary_end(), i == 4);
            assert_eq!(payload.len(), if i < 4 { 1168 } else { 5000 - 4 * 1168 });
            reassembled.extend(payload);
        }
        assert_eq!(reassembled, message);

        window.on_ack(&ids(&[1, 2, 3, 4]));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));

        window.on_ack(&ids(&[5]));
        assert_eq!(receiver.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn test_sequence_numbers_gap_free_across_messages() {
        let mut window = SendWindow::new(EPOCH, limits());
        window.enqueue(Bytes::from(vec![1; 2000])).unwrap();
        window.enqueue(Bytes::from(vec![2; 10])).unwrap();
        window.enqueue(Bytes::from(vec![3; 1168])).unwrap();

        let pass = window.pacing_pass(Instant::now());
        let headers = pass.packets.iter().map(|p| parse(p).0).collect::<Vec<_>>();

        assert_eq!(headers.iter().map(|h| h.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(headers.iter().map(|h| h.is_boundary_end()).collect::<Vec<_>>(), vec![false, true, true, true]);
        assert_eq!(window.next_seq(), PacketId::from_raw(5));
    }

    #[rstest]
    #[case::packet_count(SendWindowLimits { window_length_max: 3, ..limits() }, 3)]
    #[case::byte_budget(SendWindowLimits { window_bytes_max: 2 * 1200 + 1, ..limits() }, 3)]
    #[case::byte_budget_exact(SendWindowLimits { window_bytes_max: 2 * 1200, ..limits() }, 2)]
    fn test_fill_respects_window_limits(#[case] limits: SendWindowLimits, #[case] expected_window_len: usize) {
        let mut window = SendWindow::new(EPOCH, limits);
        window.enqueue(Bytes::from(vec![0; 10_000])).unwrap();

        window.fill();
        assert_eq!(window.window_len(), expected_window_len);
        assert_eq!(window.queue_len(), 1);
    }

    #[test]
    fn test_trim_is_front_only() {
        let mut window = SendWindow::new(EPOCH, SendWindowLimits { window_length_max: 3, ..limits() });
        window.enqueue(Bytes::from(vec![0; 10_000])).unwrap();
        window.fill();

        window.on_ack(&ids(&[2, 3]));
        window.trim();
        assert_eq!(window.window_len(), 3);
        assert_eq!(window.window_bytes(), 1200);

        window.on_ack(&ids(&[1]));
        window.trim();
        assert_eq!(window.window_len(), 0);
        assert_eq!(window.window_bytes(), 0);

        window.fill();
        assert_eq!(window.window_len(), 3);
        assert_eq!(window.next_seq(), PacketId::from_raw(7));
    }

    #[test]
    fn test_ack_unknown_and_repeated() {
        let mut window = SendWindow::new(EPOCH, limits());
        let mut first = window.enqueue(Bytes::from(vec![1; 1500])).unwrap();
        let mut second = window.enqueue(Bytes::from(vec![2; 10])).unwrap();
        window.fill();

        window.on_ack(&ids(&[0, 1, 1, 1, 99]));
        assert_eq!(first.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(second.try_recv(), Err(TryRecvError::Empty));

        window.on_ack(&ids(&[3]));
        assert_eq!(second.try_recv(), Ok(Ok(())));
        assert_eq!(first.try_recv(), Err(TryRecvError::Empty));

        window.on_ack(&ids(&[2, 2]));
        assert_eq!(first.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn test_message_not_resolved_before_fully_segmented() {
        let mut window = SendWindow::new(EPOCH, SendWindowLimits { window_length_max: 2, ..limits() });
        let mut receiver = window.enqueue(Bytes::from(vec![0; 5000])).unwrap();

        window.fill();
        window.on_ack(&ids(&[1, 2]));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));

        window.trim();
        window.fill();
        window.on_ack(&ids(&[3, 4]));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));

        window.trim();
        window.fill();
        window.on_ack(&ids(&[5]));
        assert_eq!(receiver.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn test_pacing_retransmits_after_threshold() {
        let mut window = SendWindow::new(EPOCH, limits());
        window.enqueue(Bytes::from(vec![0; 3000])).unwrap();

        let start = Instant::now();
        let pass = window.pacing_pass(start);
        assert_eq!(pass.packets.len(), 3);
        assert_eq!(pass.next_delay, Duration::from_millis(10));

        // nothing is eligible before the threshold passes
        let pass = window.pacing_pass(start + Duration::from_millis(4));
        assert!(pass.packets.is_empty());
        assert_eq!(pass.next_delay, Duration::from_millis(6));

        window.on_ack(&ids(&[2]));
        let pass = window.pacing_pass(start + Duration::from_millis(10));
        let resent = pass.packets.iter().map(|p| parse(p).0.seq).collect::<Vec<_>>();
        assert_eq!(resent, vec![1, 3]);
    }

    #[test]
    fn test_pacing_idle_uses_max_delay() {
        let mut window = SendWindow::new(EPOCH, limits());
        let pass = window.pacing_pass(Instant::now());
        assert!(pass.packets.is_empty());
        assert_eq!(pass.next_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_pacing_delay_tracks_soonest_skipped_packet() {
        let mut window = SendWindow::new(EPOCH, limits());
        window.enqueue(Bytes::from(vec![0; 100])).unwrap();

        let start = Instant::now();
        window.pacing_pass(start);

        window.enqueue(Bytes::from(vec![0; 100])).unwrap();
        let pass = window.pacing_pass(start + Duration::from_millis(7));
        assert_eq!(pass.packets.len(), 1);
        assert_eq!(parse(&pass.packets[0]).0.seq, 2);
        assert_eq!(pass.next_delay, Duration::from_millis(3));
    }

    #[test]
    fn test_pacing_batch_cap() {
        let mut window = SendWindow::new(EPOCH, SendWindowLimits { batch_bytes: 2 * 1200, ..limits() });
        window.enqueue(Bytes::from(vec![0; 5 * 1168])).unwrap();

        let start = Instant::now();
        let pass = window.pacing_pass(start);
        assert_eq!(pass.packets.len(), 2);
        assert_eq!(pass.next_delay, Duration::ZERO);

        let pass = window.pacing_pass(start);
        let sent = pass.packets.iter().map(|p| parse(p).0.seq).collect::<Vec<_>>();
        assert_eq!(sent, vec![3, 4]);

        let pass = window.pacing_pass(start);
        let sent = pass.packets.iter().map(|p| parse(p).0.seq).collect::<Vec<_>>();
        assert_eq!(sent, vec![5]);
        assert_eq!(pass.next_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_acked_packets_are_not_retransmitted() {
        let mut window = SendWindow::new(EPOCH, limits());
        window.enqueue(Bytes::from(vec![0; 100])).unwrap();

        let start = Instant::now();
        window.pacing_pass(start);
        window.on_ack(&ids(&[1]));

        let pass = window.pacing_pass(start + Duration::from_secs(1));
        assert!(pass.packets.is_empty());
        assert_eq!(window.window_len(), 0);
    }

    #[test]
    fn test_drain() {
        let mut window = SendWindow::new(EPOCH, SendWindowLimits { window_length_max: 1, ..limits() });
        let first = window.enqueue(Bytes::from(vec![1; 10])).unwrap();
        let second = window.enqueue(Bytes::from(vec![2; 10])).unwrap();
        window.fill();

        let completions = window.drain();
        assert_eq!(completions.len(), 2);
        assert_eq!(window.window_len(), 0);
        assert_eq!(window.queue_len(), 0);
        assert_eq!(window.window_bytes(), 0);

        for completion in completions {
            completion.send(Err(NudpError::ConnectionClosed)).unwrap();
        }
        for mut receiver in [first, second] {
            assert_eq!(receiver.try_recv(), Ok(Err(NudpError::ConnectionClosed)));
        }
    }
}
