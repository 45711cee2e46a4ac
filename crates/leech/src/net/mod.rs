// networking helpers
pub mod transport;
