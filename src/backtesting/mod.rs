pub mod data_fetcher;
pub mod ledger;
pub mod replayer;
pub mod report;
pub mod runner;
pub mod sweep;

pub use data_fetcher::{HistoricalPriceSource, PriceCache};
pub use ledger::{Admission, CapitalLedger};
pub use replayer::{BacktestReplayer, ReplayOptions, ReplayStatus};
pub use report::BacktestReport;
pub use runner::{BacktestRunner, RunSettings, SignalRecord, SignalStatus};
pub use sweep::{ComboResult, SweepGrid, SweepRange, SweepReport};
