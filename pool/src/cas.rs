use conveyor_lib::repo::RepoState;

use crate::PoolResult;

/// Uploads task inputs to content-addressed storage. The scheduler groups
/// candidates by repo state and uploads once per group; `extra_digests` are
/// the dependency outputs merged into the uploaded tree.
#[async_trait::async_trait]
pub trait InputUploader: Send + Sync {
    async fn upload(&self, rs: &RepoState, extra_digests: &[String]) -> PoolResult<String>;
}

/// An uploader that hands back a synthetic digest without uploading.
/// Useful for tests and for pools whose bots sync inputs themselves.
#[derive(Debug, Default)]
pub struct NoopUploader;

#[async_trait::async_trait]
impl InputUploader for NoopUploader {
    async fn upload(&self, rs: &RepoState, extra_digests: &[String]) -> PoolResult<String> {
        Ok(format!(
            "noop/{}@{}+{}",
            rs.repo.rsplit('/').next().unwrap_or(&rs.repo),
            rs.revision,
            extra_digests.len()
        ))
    }
}
