use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Code-review patch metadata attached to a try job.
#[derive(
    PartialEq, Debug, Clone, Deserialize, Serialize, Eq, PartialOrd, Ord, Hash, ToSchema, Default,
)]
#[serde(default)]
pub struct Patch {
    /// The code-review issue (change) number.
    pub issue: String,
    /// The patchset number within the issue.
    pub patchset: String,
    /// The code-review server URL.
    pub server: String,
    /// The ref to fetch the patch from.
    pub patch_ref: String,
    /// The repo the patch applies to, if different from the checkout repo.
    pub patch_repo: String,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.issue.is_empty() && self.patchset.is_empty()
    }
}

/// The state of a repository under test: a repo URL plus a resolved revision,
/// optionally with a code-review patch applied on top.
#[derive(
    PartialEq, Debug, Clone, Deserialize, Serialize, Eq, PartialOrd, Ord, Hash, ToSchema, Default,
)]
pub struct RepoState {
    pub repo: String,
    pub revision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
}

impl RepoState {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            patch: None,
        }
    }

    pub fn with_patch(repo: impl Into<String>, revision: impl Into<String>, patch: Patch) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            patch: Some(patch),
        }
    }

    /// A repo state describes a try job when a non-empty patch is attached.
    pub fn is_try_job(&self) -> bool {
        self.patch.as_ref().is_some_and(|p| !p.is_empty())
    }

    pub fn valid(&self) -> bool {
        !self.repo.is_empty() && !self.revision.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_job_requires_patch() {
        let plain = RepoState::new("https://example.org/repo.git", "abc123");
        assert!(!plain.is_try_job());

        let tried = RepoState::with_patch(
            "https://example.org/repo.git",
            "abc123",
            Patch {
                issue: "12345".to_string(),
                patchset: "2".to_string(),
                server: "https://review.example.org".to_string(),
                ..Default::default()
            },
        );
        assert!(tried.is_try_job());

        let empty_patch = RepoState::with_patch(
            "https://example.org/repo.git",
            "abc123",
            Patch::default(),
        );
        assert!(!empty_patch.is_try_job());
    }
}
