use std::net::SocketAddr;

/// transport へ「このバイト列をこの宛先に送ってほしい」と依頼するための共通型。
/// 上位層（SIP エンジン）が生成し、transport が UDP 送信する。
#[derive(Debug, Clone)]
pub struct TransportSendRequest {
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

pub type TransportSendTx = tokio::sync::mpsc::UnboundedSender<TransportSendRequest>;
pub type TransportSendRx = tokio::sync::mpsc::UnboundedReceiver<TransportSendRequest>;
