pub mod packet;
pub mod send;

pub use packet::{run_sip_udp_loop, SipInput};
pub use send::{TransportSendRequest, TransportSendRx, TransportSendTx};
