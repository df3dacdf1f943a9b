pub mod connection;
pub mod extensions;
pub mod handshake;
pub mod peer_message;
pub mod session;
