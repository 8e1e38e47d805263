pub mod config;
pub mod items;
pub mod progress;
pub mod state;

pub use config::ExportFormat;
pub use config::ExportSettings;
pub use config::InputConfig;
pub use items::BatchResult;
pub use items::EvaluationInput;
pub use items::EvaluatorOutcome;
pub use items::RowResult;
pub use progress::ProgressEvent;
pub use progress::ProgressEventKind;
pub use state::BatchState;
