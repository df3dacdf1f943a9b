pub mod controller;
pub mod info;
pub mod metainfo;
pub mod source;
