use std::time::Duration;
use anyhow::bail;
use crate::packet_header::PacketHeader;

#[derive(Clone, Debug)]
pub struct NudpConfig {
    /// Size of DATA and DATA_ACK datagrams, including the 32 byte header. NUDP never relies on
    ///  IP fragmentation, so this must be supported by every route between the peers.
    pub mtu: usize,

    /// This is the maximum number of *packets* in the send window, i.e. produced but not yet
    ///  acknowledged. It also bounds how far ahead of the next expected sequence number a
    ///  receiver accepts packets.
    pub window_length_max: usize,
    /// maximum number of bytes (headers included) in the send window
    pub window_bytes_max: usize,

    pub syn_attempts: u64,
    pub syn_attempt_delay: Duration,

    /// upper bound for the delay until the next pacing pass
    pub send_delay_max: Duration,
    /// a packet is (re)transmitted only if its last transmission is longer ago than this
    pub send_delay_threshold: Duration,
    /// a pacing pass stops transmitting once this many bytes were sent
    pub batch_bytes: usize,

    pub ack_delay: Duration,
}

impl Default for NudpConfig {
    fn default() -> Self {
        NudpConfig {
            mtu: 1200,
            window_length_max: 1000,
            window_bytes_max: 4 * 1024 * 1024,
            syn_attempts: 10,
            syn_attempt_delay: Duration::from_millis(100),
            send_delay_max: Duration::from_millis(1000),
            send_delay_threshold: Duration::from_millis(10),
            batch_bytes: 512 * 1024,
            ack_delay: Duration::from_millis(10),
        }
    }
}

impl NudpConfig {
    pub const MTU_MIN: usize = 576;
    pub const MTU_MAX: usize = 64 * 1024;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < Self::MTU_MIN || self.mtu > Self::MTU_MAX {
            bail!("MTU {} is outside the supported range {}..={}", self.mtu, Self::MTU_MIN, Self::MTU_MAX);
        }
        if self.window_length_max == 0 || self.window_bytes_max == 0 {
            bail!("window limits must be positive");
        }
        if self.syn_attempts == 0 {
            bail!("at least one SYN attempt is required");
        }
        if self.batch_bytes < self.mtu {
            bail!("batch size {} must hold at least one packet of {} bytes", self.batch_bytes, self.mtu);
        }
        Ok(())
    }

    /// the number of message bytes that fit into a single DATA packet
    pub fn max_payload_len(&self) -> usize {
        self.mtu - PacketHeader::SERIALIZED_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = NudpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_payload_len(), 1168);
    }

    #[rstest]
    #[case::mtu_min(576, true)]
    #[case::mtu_max(65536, true)]
    #[case::mtu_too_small(575, false)]
    #[case::mtu_too_big(65537, false)]
    fn test_validate_mtu(#[case] mtu: usize, #[case] valid: bool) {
        let config = NudpConfig { mtu, ..Default::default() };
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_validate_limits() {
        assert!(NudpConfig { window_length_max: 0, ..Default::default() }.validate().is_err());
        assert!(NudpConfig { window_bytes_max: 0, ..Default::default() }.validate().is_err());
        assert!(NudpConfig { syn_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(NudpConfig { batch_bytes: 1000, ..Default::default() }.validate().is_err());
    }
}
