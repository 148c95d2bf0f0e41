//! RTP リレー。Call-ID ごとに発側と着側のメディアエンドポイントを対で持ち、
//! 受信元がどちらか一方に一致したら、そのまま反対側へ転送する。
//! RTP ヘッダは見ない（コーデックにも SSRC にも関知しない）。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::net::UdpSocket;

/// 1 通話ぶんの双方向ストリーム。
#[derive(Debug, Clone, Serialize)]
pub struct RtpStream {
    pub call_id: String,
    pub caller: SocketAddr,
    pub callee: SocketAddr,
    pub installed_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RtpRelay {
    streams: Mutex<HashMap<String, RtpStream>>,
}

impl RtpRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, call_id: &str, caller: SocketAddr, callee: SocketAddr) {
        let mut map = self.streams.lock().unwrap();
        map.insert(
            call_id.to_string(),
            RtpStream {
                call_id: call_id.to_string(),
                caller,
                callee,
                installed_at: Utc::now(),
            },
        );
    }

    pub fn remove(&self, call_id: &str) -> bool {
        self.streams.lock().unwrap().remove(call_id).is_some()
    }

    /// 受信元アドレスからの転送先を引く。どのストリームにも属さなければ None。
    pub fn forward_target(&self, src: SocketAddr) -> Option<(String, SocketAddr)> {
        let map = self.streams.lock().unwrap();
        map.values().find_map(|stream| {
            if stream.caller == src {
                Some((stream.call_id.clone(), stream.callee))
            } else if stream.callee == src {
                Some((stream.call_id.clone(), stream.caller))
            } else {
                None
            }
        })
    }

    pub fn list(&self) -> Vec<RtpStream> {
        let map = self.streams.lock().unwrap();
        let mut streams: Vec<RtpStream> = map.values().cloned().collect();
        streams.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        streams
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut map = self.streams.lock().unwrap();
        let n = map.len();
        map.clear();
        n
    }
}

/// RTP 用 UDP ループ。ロックは転送先の解決までで手放し、送信はロック外で行う。
pub async fn run_rtp_relay_loop(sock: UdpSocket, relay: Arc<RtpRelay>) -> std::io::Result<()> {
    let local = sock.local_addr()?;
    log::info!("[rtp] relay socket bound on {}", local);

    let mut buf = vec![0u8; 2048];

    loop {
        let (len, src) = sock.recv_from(&mut buf).await?;

        match relay.forward_target(src) {
            Some((call_id, dst)) => {
                if let Err(err) = sock.send_to(&buf[..len], dst).await {
                    debug!(
                        "[rtp] forward failed call_id={} dst={} err={}",
                        call_id, dst, err
                    );
                } else {
                    debug!(
                        "[rtp] forwarded len={} call_id={} {} -> {}",
                        len, call_id, src, dst
                    );
                }
            }
            None => {
                warn!("[rtp] datagram from {} with no matching stream, dropped", src);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn forward_target_is_symmetric() {
        let relay = RtpRelay::new();
        relay.install("call-1", addr("10.0.0.5:40000"), addr("10.0.0.6:41000"));

        let (id, dst) = relay.forward_target(addr("10.0.0.5:40000")).expect("hit");
        assert_eq!(id, "call-1");
        assert_eq!(dst, addr("10.0.0.6:41000"));

        let (_, back) = relay.forward_target(addr("10.0.0.6:41000")).expect("hit");
        assert_eq!(back, addr("10.0.0.5:40000"));
    }

    #[test]
    fn unmatched_source_yields_none() {
        let relay = RtpRelay::new();
        relay.install("call-1", addr("10.0.0.5:40000"), addr("10.0.0.6:41000"));
        assert!(relay.forward_target(addr("10.0.0.9:40000")).is_none());
        // 同じホストでもポート違いは不一致
        assert!(relay.forward_target(addr("10.0.0.5:40001")).is_none());
    }

    #[test]
    fn remove_clears_both_directions() {
        let relay = RtpRelay::new();
        relay.install("call-1", addr("10.0.0.5:40000"), addr("10.0.0.6:41000"));
        assert!(relay.remove("call-1"));
        assert!(!relay.remove("call-1"));
        assert!(relay.forward_target(addr("10.0.0.5:40000")).is_none());
        assert!(relay.forward_target(addr("10.0.0.6:41000")).is_none());
    }

    #[test]
    fn reinstall_replaces_endpoints() {
        let relay = RtpRelay::new();
        relay.install("call-1", addr("10.0.0.5:40000"), addr("10.0.0.6:41000"));
        relay.install("call-1", addr("10.0.0.5:40002"), addr("10.0.0.6:41002"));
        assert_eq!(relay.len(), 1);
        assert!(relay.forward_target(addr("10.0.0.5:40000")).is_none());
        assert!(relay.forward_target(addr("10.0.0.5:40002")).is_some());
    }
}
