// Network module for Art-Net and sACN protocol handling

pub mod artnet;
pub(crate) mod ingest;
pub mod multicast;
pub mod sacn;

pub use artnet::*;
pub use multicast::*;
pub use sacn::*;
