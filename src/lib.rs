//! Pre-rendered DMX lighting shows played out over Art-Net in sync with an
//! external audio player.

pub mod artnet;
pub mod canvas;
pub mod config;
pub mod console;
pub mod dmx_types;
pub mod effects;
pub mod playback;
pub mod render;
pub mod show;
pub mod sync;
