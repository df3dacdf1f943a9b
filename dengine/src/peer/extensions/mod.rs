pub mod handshake;
pub mod ut_metadata;
pub mod ut_pex;
