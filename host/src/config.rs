use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use conveyor_lib::{
    graph::{CommitSource, RepoSnapshot},
    repo::RepoState,
    specs::{ConfigSource, TasksCfg},
    LibError, LibResult,
};

/// Short name a repo URL is filed under in the workdir:
/// `https://example.org/infra.git` -> `infra`.
pub fn repo_file_name(repo: &str) -> String {
    let tail = repo.trim_end_matches('/').rsplit('/').next().unwrap_or(repo);
    tail.trim_end_matches(".git").to_string()
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> LibResult<T> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| LibError::Io(format!("{}: {e}", path.display())))?;
    serde_json::from_slice(&bytes).map_err(|e| LibError::Io(format!("{}: {e}", path.display())))
}

/// Commit source reading repo snapshots from `<workdir>/repos/<name>.json`.
/// An external sync process keeps the files current; the scheduler re-reads
/// them every iteration.
#[derive(Debug)]
pub struct WorkdirCommitSource {
    workdir: PathBuf,
}

impl WorkdirCommitSource {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }

    fn path_for(&self, repo: &str) -> PathBuf {
        self.workdir
            .join("repos")
            .join(format!("{}.json", repo_file_name(repo)))
    }
}

#[async_trait::async_trait]
impl CommitSource for WorkdirCommitSource {
    async fn fetch(&self, repo: &str) -> LibResult<RepoSnapshot> {
        read_json(&self.path_for(repo)).await
    }
}

/// Config source reading `<workdir>/configs/<name>.json`, cached by file
/// modification time and validated on every reload.
pub struct WorkdirConfigSource {
    workdir: PathBuf,
    cache: RwLock<HashMap<String, (SystemTime, Arc<TasksCfg>)>>,
}

impl WorkdirConfigSource {
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, repo: &str) -> PathBuf {
        self.workdir
            .join("configs")
            .join(format!("{}.json", repo_file_name(repo)))
    }
}

#[async_trait::async_trait]
impl ConfigSource for WorkdirConfigSource {
    async fn tasks_cfg(&self, rs: &RepoState) -> LibResult<Arc<TasksCfg>> {
        let path = self.path_for(&rs.repo);
        let mtime = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| LibError::Io(format!("{}: {e}", path.display())))?;

        if let Some((cached_mtime, cfg)) = self
            .cache
            .read()
            .expect("config cache lock poisoned")
            .get(&rs.repo)
        {
            if *cached_mtime == mtime {
                return Ok(cfg.clone());
            }
        }

        let cfg: TasksCfg = read_json(&path).await?;
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        self.cache
            .write()
            .expect("config cache lock poisoned")
            .insert(rs.repo.clone(), (mtime, cfg.clone()));
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_lib::specs::{JobSpec, TaskSpec};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_repo_file_name() {
        assert_eq!(repo_file_name("https://example.org/infra.git"), "infra");
        assert_eq!(repo_file_name("https://example.org/tools/"), "tools");
        assert_eq!(repo_file_name("bare"), "bare");
    }

    #[tokio::test]
    async fn test_workdir_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("configs")).unwrap();

        let mut cfg = TasksCfg::default();
        cfg.tasks.insert(
            "Build".to_string(),
            TaskSpec {
                dimensions: vec!["os:linux".to_string()],
                ..Default::default()
            },
        );
        cfg.jobs.insert(
            "ci".to_string(),
            JobSpec {
                task_specs: vec!["Build".to_string()],
                ..Default::default()
            },
        );
        std::fs::write(
            dir.path().join("configs/repo.json"),
            serde_json::to_vec(&cfg).unwrap(),
        )
        .unwrap();

        let source = WorkdirConfigSource::new(dir.path().to_path_buf());
        let rs = RepoState::new("https://example.org/repo.git", "abc");
        let loaded = source.tasks_cfg(&rs).await.unwrap();
        assert!(loaded.tasks.contains_key("Build"));
        // Second read serves the cache.
        let again = source.tasks_cfg(&rs).await.unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));
    }

    #[tokio::test]
    async fn test_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = WorkdirConfigSource::new(dir.path().to_path_buf());
        let rs = RepoState::new("https://example.org/repo.git", "abc");
        assert!(source.tasks_cfg(&rs).await.is_err());
    }
}
