use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;
use crate::connection_key::ConnectionEpoch;
use crate::packet_header::{PacketHeader, PacketType};
use crate::packet_id::PacketId;

/// Payload of a DATA_ACK packet: acknowledged sequence numbers (u64 BE), packed after the
///  header without a count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAck {
    pub acked: Vec<PacketId>,
}

impl DataAck {
    const ENTRY_LEN: usize = size_of::<u64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        for packet_id in &self.acked {
            buf.put_u64(packet_id.to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> DataAck {
        let mut acked = Vec::with_capacity(buf.remaining() / Self::ENTRY_LEN);
        while buf.remaining() >= Self::ENTRY_LEN {
            acked.push(PacketId::from_raw(buf.get_u64()));
        }
        if buf.has_remaining() {
            warn!("DATA_ACK payload has {} trailing bytes - ignoring them", buf.remaining());
            buf.advance(buf.remaining());
        }
        DataAck { acked }
    }

    pub fn max_entries_per_packet(mtu: usize) -> usize {
        (mtu - PacketHeader::SERIALIZED_LEN) / Self::ENTRY_LEN
    }

    /// Builds complete DATA_ACK datagrams (header included) for a list of pending acks, each
    ///  holding as many entries as fit into `mtu`.
    pub fn build_packets(epoch: ConnectionEpoch, mtu: usize, pending: &[PacketId]) -> Vec<BytesMut> {
        pending
            .chunks(Self::max_entries_per_packet(mtu).max(1))
            .map(|chunk| {
                let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + chunk.len() * Self::ENTRY_LEN);
                PacketHeader::control(PacketType::DataAck, epoch, 0).ser(&mut buf);
                DataAck { acked: chunk.to_vec() }.ser(&mut buf);
                buf
            })
            .collect()
    }
}
