//! Stateful core: preview transactions, the approval state machine and the
//! query service that fronts them.

pub mod approval;
pub mod clock;
pub mod executor;
pub mod postgres;
pub mod preview;
pub mod service;

pub use approval::ApprovalService;
pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{DataSourceExecutor, ExecError, OpenTransaction, QueryResult};
pub use preview::{PreviewError, PreviewManager, PreviewSettings};
pub use service::{ApprovalDetail, DryRunReport, QueryService, ServiceLimits, Submission};
