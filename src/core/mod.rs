pub mod fuzzy;
pub mod logger;
pub mod query_processor;
pub mod session;
pub mod stats;
pub mod telemetry;

pub use query_processor::*;
pub use stats::*;
