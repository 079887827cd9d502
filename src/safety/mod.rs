pub mod gates;

pub use gates::{evaluate, GateDecision, GateReason, RuntimeFlags, LIVE_ACK_LITERAL};
