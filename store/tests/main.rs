#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    use conveyor_lib::{
        job::{Job, JobStatus},
        repo::RepoState,
        task::{Task, TaskKey, TaskStatus},
    };
    use conveyor_store::{InMemoryStore, JobCache, Store, TaskCache};

    const REPO: &str = "https://example.org/repo.git";

    async fn create_task(store: &InMemoryStore, revision: &str, name: &str) -> Task {
        let id = store.assign_id().await.unwrap();
        let mut task = Task::new(id, TaskKey::new(RepoState::new(REPO, revision), name), Utc::now());
        task.commits = vec![revision.to_string()];
        store.put_tasks(std::slice::from_ref(&task)).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_get_tasks_by_key_sorted() {
        let store = InMemoryStore::new();
        let first = create_task(&store, "abc", "Build").await;
        let mut second = first.clone();
        second.id = store.assign_id().await.unwrap();
        second.attempt = 1;
        second.retry_of = Some(first.id.clone());
        second.created = first.created + Duration::seconds(10);
        store.put_tasks(&[second.clone()]).await.unwrap();

        let found = store.get_tasks_by_key(&first.key).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, first.id);
        assert_eq!(found[1].id, second.id);
    }

    #[tokio::test]
    async fn test_get_task_for_commit_prefers_newest() {
        let store = InMemoryStore::new();
        let old = create_task(&store, "abc", "Build").await;

        let mut retry = old.clone();
        retry.id = store.assign_id().await.unwrap();
        retry.created = old.created + Duration::seconds(30);
        store.put_tasks(&[retry.clone()]).await.unwrap();

        let found = store
            .get_task_for_commit(REPO, "abc", "Build")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, retry.id);

        assert!(store
            .get_task_for_commit(REPO, "missing", "Build")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unfinished_tasks() {
        let store = InMemoryStore::new();
        let pending = create_task(&store, "abc", "Build").await;
        let mut done = create_task(&store, "def", "Build").await;
        done.status = TaskStatus::Success;
        store.put_tasks(&[done.clone()]).await.unwrap();

        let unfinished = store.unfinished_tasks().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_get_task_by_worker_id() {
        let store = InMemoryStore::new();
        let mut task = create_task(&store, "abc", "Build").await;
        task.worker_task_id = "pool-task-7".to_string();
        store.put_tasks(&[task.clone()]).await.unwrap();

        let found = store
            .get_task_by_worker_id("pool-task-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, task.id);
        assert!(store.get_task_by_worker_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_cache_window_and_unfinished() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();

        // Old but unfinished: must stay visible through the cache.
        let mut old_unfinished = Task::new(
            store.assign_id().await.unwrap(),
            TaskKey::new(RepoState::new(REPO, "old1"), "Build"),
            now - Duration::days(30),
        );
        old_unfinished.commits = vec!["old1".to_string()];

        // Old and finished: outside the window, dropped by the cache.
        let mut old_done = Task::new(
            store.assign_id().await.unwrap(),
            TaskKey::new(RepoState::new(REPO, "old2"), "Build"),
            now - Duration::days(30),
        );
        old_done.commits = vec!["old2".to_string()];
        old_done.status = TaskStatus::Success;

        let mut recent = Task::new(
            store.assign_id().await.unwrap(),
            TaskKey::new(RepoState::new(REPO, "new1"), "Build"),
            now,
        );
        recent.commits = vec!["new1".to_string()];

        store
            .put_tasks(&[old_unfinished.clone(), old_done, recent.clone()])
            .await
            .unwrap();

        let cache = TaskCache::new(store);
        cache.update(now - Duration::days(1)).await.unwrap();
        let snapshot = cache.snapshot();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get(&recent.id).is_some());
        assert!(snapshot.get(&old_unfinished.id).is_some());
        assert!(snapshot.known_task_name(REPO, "Build"));
        assert!(!snapshot.known_task_name(REPO, "Test"));
        assert_eq!(
            snapshot.task_for_commit(REPO, "Build", "new1").unwrap().id,
            recent.id
        );
        assert!(snapshot.task_for_commit(REPO, "Build", "old2").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_isolated_from_later_writes() {
        let store = Arc::new(InMemoryStore::new());
        let cache = TaskCache::new(store.clone());
        let now = Utc::now();

        let task = Task::new(
            store.assign_id().await.unwrap(),
            TaskKey::new(RepoState::new(REPO, "abc"), "Build"),
            now,
        );
        store.put_tasks(&[task.clone()]).await.unwrap();
        cache.update(now - Duration::days(1)).await.unwrap();

        let before = cache.snapshot();
        assert_eq!(before.len(), 1);

        let other = Task::new(
            store.assign_id().await.unwrap(),
            TaskKey::new(RepoState::new(REPO, "def"), "Build"),
            now,
        );
        store.put_tasks(&[other]).await.unwrap();
        cache.update(now - Duration::days(1)).await.unwrap();

        // The old snapshot is unchanged; a fresh one sees the write.
        assert_eq!(before.len(), 1);
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_job_cache_unfinished() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();

        let open = Job::new(
            store.assign_id().await.unwrap(),
            "ci",
            RepoState::new(REPO, "abc"),
            vec!["Build".to_string()],
            now,
        );
        let mut closed = Job::new(
            store.assign_id().await.unwrap(),
            "ci",
            RepoState::new(REPO, "def"),
            vec!["Build".to_string()],
            now,
        );
        closed.status = JobStatus::Success;
        store.put_jobs(&[open.clone(), closed]).await.unwrap();

        let cache = JobCache::new(store);
        cache.update(now - Duration::days(1)).await.unwrap();
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        let unfinished = snapshot.unfinished();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, open.id);
    }

    #[tokio::test]
    async fn test_scripted_put_failure_is_one_shot() {
        let store = InMemoryStore::new();
        store.fail_next_put_tasks();
        let task = Task::new(
            store.assign_id().await.unwrap(),
            TaskKey::new(RepoState::new(REPO, "abc"), "Build"),
            Utc::now(),
        );
        assert!(store.put_tasks(std::slice::from_ref(&task)).await.is_err());
        assert!(store.put_tasks(std::slice::from_ref(&task)).await.is_ok());
    }
}
