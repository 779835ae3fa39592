//! STOMP framing and session protocol.
//!
//! - [`frame`]: the wire codec (`encode` / `decode`)
//! - [`heartbeat`]: heartbeat negotiation and grace periods
//! - [`client`]: the session state machine over a reactor link

pub mod client;
pub mod frame;
pub mod heartbeat;

pub use client::{ChannelListener, StompClient};
pub use frame::{decode, encode, Command, MalformedFrame, Message};
