use std::collections::BTreeMap;
use std::mem;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::error::{NudpError, NudpResult};
use crate::packet_id::PacketId;
use crate::safe_converter::SafeCast;

struct BufferedPacket {
    boundary_end: bool,
    payload: Bytes,
}

/// The receive side of a connection: restores message boundaries from a stream of DATA packets
///  that may arrive out of order, duplicated, or with gaps.
pub struct ReceiveBuffer {
    /// how far ahead of `next_expected` a packet may be
    window_length_max: u64,

    /// all packets before this id were appended to a message (and delivered, if the message
    ///  was complete)
    next_expected: PacketId,

    /// packets that arrived ahead of `next_expected`
    out_of_order: BTreeMap<PacketId, BufferedPacket>,

    /// payload of the message that is currently being reassembled
    message_in_progress: Vec<u8>,

    /// sequence numbers waiting to be acknowledged in the next DATA_ACK flush
    delayed_acks: Vec<PacketId>,
}

impl ReceiveBuffer {
    pub fn new(window_length_max: usize) -> ReceiveBuffer {
        ReceiveBuffer {
            window_length_max: window_length_max.safe_cast(),
            next_expected: PacketId::FIRST,
            out_of_order: Default::default(),
            message_in_progress: Vec::new(),
            delayed_acks: Vec::new(),
        }
    }

    pub fn next_expected(&self) -> PacketId {
        self.next_expected
    }

    pub fn num_buffered(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn has_delayed_acks(&self) -> bool {
        !self.delayed_acks.is_empty()
    }

    pub fn take_delayed_acks(&mut self) -> Vec<PacketId> {
        mem::take(&mut self.delayed_acks)
    }

    /// Handles a received DATA packet, returning the messages it completes (in sequence order).
    ///
    /// Packets below `next_expected` were delivered before: they do not touch reassembly state,
    ///  but their ids are acknowledged again since the sender evidently missed the first ack.
    ///  The same goes for a repeated packet that is already buffered out of order. Packets
    ///  beyond the receive window are rejected without acknowledgement.
    pub fn on_data(&mut self, packet_id: PacketId, boundary_end: bool, payload: Bytes) -> NudpResult<Vec<Vec<u8>>> {
        if packet_id < self.next_expected {
            trace!("packet #{} is below next expected #{} - duplicate", packet_id, self.next_expected);
            self.delayed_acks.push(packet_id);
            return Ok(Vec::new());
        }

        let ahead = packet_id.distance_from(self.next_expected).unwrap_or(0);
        if ahead > self.window_length_max {
            debug!("packet #{} is beyond the receive window starting at #{} - dropping", packet_id, self.next_expected);
            return Err(NudpError::ProtocolViolation(format!(
                "packet #{} is {} packets ahead of next expected #{}", packet_id, ahead, self.next_expected
            )));
        }

        self.delayed_acks.push(packet_id);

        if packet_id != self.next_expected {
            if self.out_of_order.contains_key(&packet_id) {
                trace!("packet #{} is already buffered - duplicate", packet_id);
            }
            else {
                trace!("buffering packet #{} while waiting for #{}", packet_id, self.next_expected);
                self.out_of_order.insert(packet_id, BufferedPacket { boundary_end, payload });
            }
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        let mut next = Some(BufferedPacket { boundary_end, payload });

        while let Some(packet) = next {
            trace!("appending packet #{} to the message in progress", self.next_expected);
            self.message_in_progress.extend_from_slice(&packet.payload);
            self.next_expected += 1;

            if packet.boundary_end {
                let message = mem::take(&mut self.message_in_progress);
                trace!("message of {} bytes is complete", message.len());
                messages.push(message);
            }

            next = self.out_of_order.remove(&self.next_expected);
        }

        Ok(messages)
    }

    pub fn clear(&mut self) {
        self.out_of_order.clear();
        self.message_in_progress.clear();
        self.delayed_acks.clear();
    }
}
