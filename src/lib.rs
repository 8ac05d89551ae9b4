//! NUDP is a reliable, message-oriented transport on top of UDP, designed as the transport
//!  layer below an RPC framing.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (i.e. defined-length chunks of data as
//!   opposed to streams of bytes)
//!   * Big messages are sent without IP-level fragmentation - this protocol takes care of chunking
//!     into packets of a configured MTU, retransmitting and re-assembling
//!   * a send operation completes when every packet of the message is acknowledged
//! * Each node has a single listening UDP socket that handles all connections
//!   * connections are established by a lightweight SYN / SYN_ACK handshake and torn down by FIN
//!   * a connection is identified by the peer's address plus a (timestamp, random) pair chosen by
//!     the initiator, so a peer restarting with the same address starts a distinct connection
//! * Packets can arrive out of order, duplicated, or not at all
//!   * *packets* have sequence numbers and are acknowledged (batched after a short delay) and
//!     retransmitted until acknowledged
//!   * the receiver buffers packets ahead of a gap and delivers messages in sequence order,
//!     exactly once
//! * No congestion control beyond a fixed-size send window, bounded by packet count and bytes
//! * No encryption or integrity protection beyond what UDP provides
//!
//! See [packet_header::PacketHeader] for the wire format.

pub mod ack_message;
pub mod config;
pub mod connection;
pub mod connection_key;
pub mod end_point;
pub mod error;
pub mod message_handler;
pub mod packet_header;
pub mod packet_id;
pub mod receive_buffer;
pub mod safe_converter;
pub mod send_socket;
pub mod send_window;
