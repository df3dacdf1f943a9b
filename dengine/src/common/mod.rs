pub mod bitfield;
pub mod chunked_buffer;
pub mod info_hash;
pub mod magnet;
