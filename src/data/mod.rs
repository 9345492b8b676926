pub mod feed;
pub mod history;
pub mod import;
pub mod index;
pub mod reconcile;
pub mod row;
pub mod run_state;
pub mod script;
pub mod sweep;
pub mod validate;

// reexport the important functions / structs as part of this module
pub use feed::{FeedFormat, RawRow};
pub use history::ImportHistory;
pub use import::{ImportError, ImportSettings, Orchestrator, RunStore};
pub use script::RowScript;
pub use validate::{HttpImageProbe, ImportPolicy, RowValidator};
