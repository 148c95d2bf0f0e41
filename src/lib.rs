//! mini-pbx: 閉じた内線ダイヤルプラン向けの小さな SIP B2BUA と RTP リレー。
//! REGISTER で内線を束ね、INVITE/ACK/BYE を両レッグに中継し、SDP を
//! 書き換えてメディアをサーバ経由で折り返す。

pub mod calls;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod rtp;
pub mod sdp;
pub mod sip;
pub mod transport;
pub mod users;
