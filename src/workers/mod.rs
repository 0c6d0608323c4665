//! Concrete capture and playback workers

pub mod recv;
pub mod tx_file;
pub mod tx_replay;

pub use recv::{RecvOptions, RecvWorker};
pub use tx_file::TxFileWorker;
pub use tx_replay::TxReplayWorker;
