//! Query path: the HTTP evaluation client, the fixed query battery and the
//! periodic poller that feeds the fusion coordinator.

pub mod battery;
pub mod client;
pub mod clock;
pub mod poller;

pub use client::{ExecClient, QueryError, QueryTransport};
pub use poller::{PollerSettings, QueryPoller};
