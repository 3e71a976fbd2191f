use render_common::store::StoreError;
use thiserror::Error;

use crate::remote::RemoteError;

/// Enumeration of errors surfaced by the scheduling loops. Webhook
/// delivery and best-effort remote cancels are recovered locally and
/// never appear here.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("remote executor call failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("job {0} is already terminal")]
    AlreadyTerminal(String),
    #[error("job {0} does not exist")]
    JobNotFound(String),
}
