pub mod approval;
pub mod datasource;
pub mod preview;

pub use approval::{
    ApprovalPolicy, ApprovalRequest, ApprovalReview, ApprovalStatus, ReviewDecision, Statement,
};
pub use datasource::{DataSource, NewDataSource};
pub use preview::{PreviewSnapshot, PreviewStatus, PreviewTransaction};
