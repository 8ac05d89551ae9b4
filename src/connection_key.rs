use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::SystemTime;
use anyhow::bail;

/// The (timestamp, random) pair an initiator picks when it connects. It travels in every packet
///  header of the connection, so that a restarted peer reusing the same address and port is
///  distinguishable from its predecessor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionEpoch {
    pub conn_time: u64,
    pub conn_rand: u32,
}

impl ConnectionEpoch {
    /// millis since epoch plus a random nonce that is never zero
    pub fn generate() -> anyhow::Result<ConnectionEpoch> {
        Ok(ConnectionEpoch {
            conn_time: Self::millis_since_epoch()?,
            conn_rand: rand::random::<u32>().max(1),
        })
    }

    fn millis_since_epoch() -> anyhow::Result<u64> {
        let raw = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();

        if raw > u64::MAX as u128 {
            bail!("system clock is in the future");
        }
        Ok(raw as u64)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionKey {
    pub peer_addr: SocketAddr,
    pub epoch: ConnectionEpoch,
}

impl ConnectionKey {
    pub fn new(peer_addr: SocketAddr, epoch: ConnectionEpoch) -> ConnectionKey {
        ConnectionKey { peer_addr, epoch }
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:x}.{:x}", self.peer_addr, self.epoch.conn_time, self.epoch.conn_rand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::v4(SocketAddr::from(([1,2,3,4], 5)), 0x1234, 0xab, "1.2.3.4:5/1234.ab")]
    #[case::v6(SocketAddr::from(([0,0,0,0,0,0,0,1], 9)), 255, 1, "[::1]:9/ff.1")]
    fn test_display(#[case] addr: SocketAddr, #[case] conn_time: u64, #[case] conn_rand: u32, #[case] expected: &str) {
        let key = ConnectionKey::new(addr, ConnectionEpoch { conn_time, conn_rand });
        assert_eq!(key.to_string(), expected);
    }

    #[test]
    fn test_restarted_peer_has_different_key() {
        let addr = SocketAddr::from(([1,2,3,4], 5));
        let old = ConnectionKey::new(addr, ConnectionEpoch { conn_time: 100, conn_rand: 7 });
        let new = ConnectionKey::new(addr, ConnectionEpoch { conn_time: 100, conn_rand: 8 });
        assert_ne!(old, new);
    }

    #[test]
    fn test_generate() {
        let epoch = ConnectionEpoch::generate().unwrap();
        assert_ne!(epoch.conn_rand, 0);
        assert!(epoch.conn_time > 0);
    }
}
