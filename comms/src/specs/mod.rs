pub mod group;
pub mod handshake;
pub mod operation;
