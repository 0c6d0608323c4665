//! Runtime support for synchronized streaming runs

pub mod errors;
pub mod output;
pub mod replay;
pub mod scheduler;
pub mod stop;
pub mod streamers;
pub mod timing;
pub mod topology;
pub mod watchdog;
pub mod worker;

pub use errors::{NamingError, ReplayError, StreamerError, SyncError, TopologyError, WorkError, WorkResult};
pub use output::{ChannelWriters, LocationTable, OutputNaming};
pub use replay::{LoadOptions, ReplayDescriptor, load_replay_buffer};
pub use scheduler::{PoolReport, WorkerPool};
pub use stop::{StopFlag, install_interrupt_handler};
pub use streamers::{ChannelGrouping, StreamerFactory, Streamers};
pub use timing::Schedule;
pub use topology::{ChannelPath, Topology};
pub use watchdog::Watchdog;
pub use worker::{Side, Worker, WorkerContext, WorkerReport, WorkerState};
