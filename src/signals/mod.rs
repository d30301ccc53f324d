pub mod csv_source;
pub mod signal;

pub use csv_source::{load_signals, read_signals};
pub use signal::{normalize_symbol, Signal, SignalInput};
