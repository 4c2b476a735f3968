//! Host side of the child connection: wire codecs, handshake decoding and
//! the one-shot socket transport.

pub mod codec;
pub mod protocol;
pub mod transport;
