pub mod engine;
pub mod history;

pub use engine::{BackfillEngine, BackfillRequest};
pub use history::HistoryClient;
