pub mod executor;
pub mod gate;
pub mod monitor;
pub mod scanner;

pub use executor::{TradeExecutor, TradeReceipt};
pub use gate::TradeGate;
pub use monitor::{EventMonitor, MonitorState, MonitorStatus, TradeHooks};
pub use scanner::CandidateScanner;
