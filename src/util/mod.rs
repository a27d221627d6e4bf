//! Small runtime helpers shared by the decoder and the poller.

pub mod backoff;
pub mod shutdown;
