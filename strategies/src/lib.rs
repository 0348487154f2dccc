pub mod arbitrage;

pub use arbitrage::errors::EngineError;
pub use arbitrage::manager::EngineManager;
pub use arbitrage::params::{ParamError, ParamsPatch};
pub use arbitrage::types::{PairRuntime, PairSnapshot, PairStatus, PendingConfig, UpdateOutcome};
