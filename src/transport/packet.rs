use std::net::SocketAddr;

use log::{debug, info};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;

use crate::transport::send::TransportSendRx;

/// packet層 → SIP 層に渡す入力
#[derive(Debug, Clone)]
pub struct SipInput {
    pub src: SocketAddr,
    pub data: Vec<u8>,
}

/// SIP 用 UDP ループ。受信はエンジンへ、送信依頼はそのままソケットへ流す。
pub async fn run_sip_udp_loop(
    sock: UdpSocket,
    sip_tx: UnboundedSender<SipInput>,
    mut send_rx: TransportSendRx,
) -> std::io::Result<()> {
    let local = sock.local_addr()?;
    info!("[sip] listening on {}", local);

    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            recv_res = sock.recv_from(&mut buf) => {
                let (len, src) = recv_res?;
                let data = buf[..len].to_vec();

                debug!("[sip recv] from {} len={}", src, data.len());

                // SIPポートで受けたUDPは全てSIPとして扱う
                let input = SipInput { src, data };
                if sip_tx.send(input).is_err() {
                    // エンジン側が落ちたらループを畳む
                    return Ok(());
                }
            }
            req = send_rx.recv() => {
                let Some(req) = req else { return Ok(()) };
                let _ = sock.send_to(&req.payload, req.dst).await.ok();
            }
        }
    }
}
