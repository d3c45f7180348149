use slipway_common::release::InvalidReleaseFile;

use crate::dal::DalError;
use crate::haproxy::HaproxyError;
use crate::mirror::GitError;
use crate::queue::QueueError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Dal(#[from] DalError),
    #[error("job queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("git mirror error: {0}")]
    Git(#[from] GitError),
    #[error("HAProxy error: {0}")]
    Haproxy(#[from] HaproxyError),
    #[error("release manifest error: {0}")]
    Release(#[from] InvalidReleaseFile),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("step '{0}' failed")]
    StepFailed(String),
    #[error("deployment failed: {0}")]
    Deployment(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
