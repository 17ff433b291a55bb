pub mod bars;
pub mod rows;
pub mod schema;

pub use bars::OptionStore;
pub use rows::{ExpiryMetricsRow, FutureBarRow, LiquiditySummary, SeriesPoint, StrikeBarRow};
