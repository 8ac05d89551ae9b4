use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::connection_key::ConnectionEpoch;
use crate::error::{NudpError, NudpResult};
use crate::packet_id::PacketId;

#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    Syn = 1,
    SynAck = 2,
    Fin = 3,
    Data = 4,
    DataAck = 5,
}

bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PacketFlags: u32 {
        /// this packet completes a message
        const BOUNDARY_END = 1 << 0;
    }
}

/// Fixed-size header at the start of every datagram, all numbers in network byte order (BE):
///
/// ```ascii
///  0: magic (u32)
///  4: protocol version (u16)
///  6: packet type (u16)
///  8: conn_time (u64) - chosen by the initiator
/// 16: conn_rand (u32) - chosen by the initiator
/// 20: seq (u64) - packet sequence number for DATA, attempt counter for SYN / SYN_ACK
/// 28: flags (u32)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub epoch: ConnectionEpoch,
    pub seq: u64,
    pub flags: PacketFlags,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 32;
    pub const PACKET_MAGIC: u32 = 0xFEED_F33D;
    pub const PROTOCOL_VERSION: u16 = 1;

    pub fn new(packet_type: PacketType, epoch: ConnectionEpoch, seq: u64, flags: PacketFlags) -> PacketHeader {
        PacketHeader {
            packet_type,
            epoch,
            seq,
            flags,
        }
    }

    /// header for a payload-less control packet
    pub fn control(packet_type: PacketType, epoch: ConnectionEpoch, seq: u64) -> PacketHeader {
        Self::new(packet_type, epoch, seq, PacketFlags::empty())
    }

    pub fn packet_id(&self) -> PacketId {
        PacketId::from_raw(self.seq)
    }

    pub fn is_boundary_end(&self) -> bool {
        self.flags.contains(PacketFlags::BOUNDARY_END)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(Self::PACKET_MAGIC);
        buf.put_u16(Self::PROTOCOL_VERSION);
        buf.put_u16(self.packet_type.into());
        buf.put_u64(self.epoch.conn_time);
        buf.put_u32(self.epoch.conn_rand);
        buf.put_u64(self.seq);
        buf.put_u32(self.flags.bits());
    }

    /// parses the header, leaving `buf` positioned at the start of the payload
    pub fn deser(buf: &mut impl Buf) -> NudpResult<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(NudpError::MalformedPacket(format!("datagram of {} bytes is shorter than the header", buf.remaining())));
        }

        let magic = buf.get_u32();
        if magic != Self::PACKET_MAGIC {
            return Err(NudpError::MalformedPacket(format!("bad magic {:#x}", magic)));
        }
        let version = buf.get_u16();
        if version != Self::PROTOCOL_VERSION {
            return Err(NudpError::MalformedPacket(format!("bad version {}", version)));
        }
        let raw_type = buf.get_u16();
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| NudpError::MalformedPacket(format!("bad packet type {}", raw_type)))?;

        let conn_time = buf.get_u64();
        let conn_rand = buf.get_u32();
        let seq = buf.get_u64();
        let flags = PacketFlags::from_bits_retain(buf.get_u32());

        Ok(PacketHeader {
            packet_type,
            epoch: ConnectionEpoch { conn_time, conn_rand },
            seq,
            flags,
        })
    }
}
