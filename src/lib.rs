pub mod audio;
pub mod config;
pub mod nes;
pub mod video;
