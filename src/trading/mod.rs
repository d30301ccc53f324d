pub mod executor;
pub mod monitor;
pub mod registry;

pub use executor::{ExecutionOutcome, ExecutorSettings, MonitorHandle, TradeExecutor};
pub use monitor::{LiveMonitor, MonitorExit, MonitorExitReason, MonitorSetup};
pub use registry::{MonitorId, MonitorProgress, MonitorRegistry, MonitorSnapshot};
