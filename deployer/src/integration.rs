//! Operator integration hook.
//!
//! An integration can override artifact detection and contribute extra
//! notification sinks. Providers are compiled in and selected by name through
//! the `integration.provider` setting; there is no runtime code loading.

use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactContext, NoArtifactDetected};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::notification::Notifier;

pub trait Integration: Send + Sync {
    /// Inspect the checked-out repository and decide where the deployable
    /// artifact comes from. Returning [`NoArtifactDetected`] falls back to
    /// the plain git artifact.
    fn detect_artifact(
        &self,
        _context: &ArtifactContext<'_>,
    ) -> std::result::Result<Box<dyn Artifact>, NoArtifactDetected> {
        Err(NoArtifactDetected)
    }

    /// Extra sinks appended to the built-in notifier collection.
    fn notifiers(&self) -> Vec<Box<dyn Notifier>> {
        Vec::new()
    }
}

/// The stock behavior: plain git artifacts, no extra notifiers.
pub struct DefaultIntegration;

impl Integration for DefaultIntegration {}

pub fn build_integration(settings: &Settings) -> Result<Arc<dyn Integration>> {
    match settings.integration.provider.as_str() {
        "default" => Ok(Arc::new(DefaultIntegration)),
        other => Err(Error::Config(format!(
            "unknown integration provider '{other}'"
        ))),
    }
}
