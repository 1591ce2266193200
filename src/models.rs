pub mod message;
pub mod peer;
