pub mod registry;
pub mod rtc;
pub mod signaling;
