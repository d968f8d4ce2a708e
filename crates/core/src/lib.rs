pub mod catalog;
pub mod classify;
pub mod error;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod strategy;

#[cfg(test)]
pub(crate) mod test_support;

pub use catalog::{DeviceCatalog, DeviceInfoProvider, SysBlockProvider};
pub use classify::{classify, validate};
pub use error::CloneError;
pub use executor::{CloneExecutor, CommandRunner, ProcessRunner};
pub use model::{
    CloneOutcome, CloneReport, CloneStrategy, DeviceInfo, DevicePair, Indicator, OperatorState,
    PartitionDescriptor, REPORT_VERSION,
};
pub use orchestrator::{
    Clock, IndicatorPanel, LoopOptions, Orchestrator, SignalSource, SystemClock,
};
pub use strategy::{mkfs_argv, select_strategy};
