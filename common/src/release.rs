use chrono::NaiveDateTime;
use thiserror::Error;

/// The optional trailing marker line of a manifest mid-deployment.
pub const IN_PROGRESS_MARKER: &str = "deployment in progress";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid .git_release file: {0}")]
pub struct InvalidReleaseFile(pub String);

/// Parsed contents of a `<target_path>/.git_release` manifest.
///
/// Four required lines (branch, commit, deployment date, destination path)
/// plus an optional in-progress marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    pub branch: String,
    pub commit: String,
    pub deployment_date: NaiveDateTime,
    pub destination_path: String,
    pub in_progress: bool,
}

impl Release {
    pub fn format_commit(&self) -> String {
        format!("commit {}", self.commit)
    }
}

pub fn format_release_file(
    branch: &str,
    commit: &str,
    date: NaiveDateTime,
    destination_path: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        branch,
        commit,
        date.format(DATE_FORMAT),
        destination_path
    )
}

pub fn parse_release_file(contents: &str) -> Result<Release, InvalidReleaseFile> {
    let lines: Vec<&str> = contents.trim_end_matches('\n').split('\n').collect();
    if lines.len() < 4 {
        return Err(InvalidReleaseFile(format!(
            "expected at least 4 lines, got {}",
            lines.len()
        )));
    }

    let deployment_date = NaiveDateTime::parse_from_str(lines[2], DATE_FORMAT)
        .map_err(|e| InvalidReleaseFile(format!("bad deployment date '{}': {}", lines[2], e)))?;

    Ok(Release {
        branch: lines[0].to_owned(),
        commit: lines[1].to_owned(),
        deployment_date,
        destination_path: lines[3].to_owned(),
        in_progress: lines.get(4).map(|l| l.trim()) == Some(IN_PROGRESS_MARKER),
    })
}
