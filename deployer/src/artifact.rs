//! What actually gets copied to the servers.
//!
//! By default that is the mirror's working tree, checked out at the commit to
//! deploy. Integrations may detect other artifact sources (a build output, a
//! fetched tarball) from the repository contents.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
#[error("artifact error: {0}")]
pub struct ArtifactError(pub String);

#[derive(thiserror::Error, Debug)]
#[error("no artifact detected")]
pub struct NoArtifactDetected;

/// Everything an integration gets to look at when detecting the artifact.
pub struct ArtifactContext<'a> {
    pub local_repo_path: &'a Path,
    pub git_server: &'a str,
    pub repository_name: &'a str,
    pub commit: &'a str,
    pub environment_name: &'a str,
}

#[async_trait]
pub trait Artifact: Send + Sync {
    /// One line describing the artifact source, for the deployment log.
    fn description(&self) -> String;

    /// Perform any necessary download or build, after which [`local_path`]
    /// points at the directory to copy to the target servers.
    ///
    /// [`local_path`]: Artifact::local_path
    async fn obtain(&mut self) -> Result<(), ArtifactError>;

    fn local_path(&self) -> &Path;

    /// Whether predeploy.sh and the local test script apply to this artifact.
    fn should_run_predeploy_scripts(&self) -> bool {
        true
    }

    /// Drop temporary files once the deployment is over.
    async fn cleanup(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

/// The default artifact: deploy the repository contents as checked out.
pub struct GitArtifact {
    local_path: PathBuf,
}

impl GitArtifact {
    pub fn new(local_repo_path: &Path) -> Self {
        Self {
            local_path: local_repo_path.to_owned(),
        }
    }
}

#[async_trait]
impl Artifact for GitArtifact {
    fn description(&self) -> String {
        "Git (run the predeploy scripts, then deploy the repository contents)".to_owned()
    }

    async fn obtain(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }
}
