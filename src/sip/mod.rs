pub mod builder;
pub mod core;
pub mod message;
pub mod parse;
pub mod validate;

pub use builder::{response_simple_from_request, SipRequestBuilder, SipResponseBuilder};
pub use core::{EngineConfig, SipCore};
pub use message::{CoreHeaders, SipHeader, SipMessage, SipMethod, SipRequest, SipResponse};
pub use parse::parse_sip_message;
