//! Broadcast receive path: datagram framing, E1.31 parsing and the UDP decoder.

pub mod decoder;
pub mod framing;
pub mod sacn;
