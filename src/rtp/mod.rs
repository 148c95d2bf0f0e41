pub mod relay;

pub use relay::{run_rtp_relay_loop, RtpRelay, RtpStream};
