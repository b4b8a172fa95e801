pub mod geometry;
pub mod time;
