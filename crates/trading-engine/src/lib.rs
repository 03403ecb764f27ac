//! Trading Engine
//!
//! Opening-range scanning, signal evaluation, the exit state machine, order
//! execution and the session loop that ties them together.

pub mod executor;
pub mod exit_manager;
pub mod paper;
pub mod scanner;
pub mod session;
pub mod signals;

pub use executor::{ExecutionMetrics, ExecutorConfig, OrderExecutor};
pub use exit_manager::{ExitAction, ExitManager, TickInput};
pub use paper::PaperBroker;
pub use scanner::{ScanSkip, SessionSetups, SymbolScanner};
pub use session::{
    BotHandle, PositionSnapshot, SessionContext, SessionDeps, SessionPhase, SessionStatus,
    TradingSession,
};
pub use signals::{PendingRetest, SignalEvaluator};
