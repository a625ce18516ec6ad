//! Natural-language browser automation: a sense-think-act loop that drives
//! Chrome toward a goal, one decision at a time.

pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod events;
pub mod face;
pub mod hands;
pub mod orchestrator;
pub mod report;
pub mod types;

pub use brain::{Brain, DecisionRequest, DecisionService};
pub use error::{DecisionError, DriverError, InteractionError, ReportError};
pub use events::EventCollector;
pub use hands::{BrowserDriver, InteractionLayer};
pub use orchestrator::{LoopSettings, Notifier, Orchestrator};
pub use report::{FileReport, ReportSink};
