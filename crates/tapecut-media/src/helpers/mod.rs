// crates/tapecut-media/src/helpers/mod.rs
//
// Internal helper modules for tapecut-media. These are decode/encode
// implementation details shared by session.rs and trim.rs.

pub mod fifo;
pub mod frame;
pub mod seek;
