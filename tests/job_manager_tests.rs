//! Operator surface of the job manager.

mod test_utils;

use std::collections::HashMap;
use std::sync::Arc;

use ccr_syncer::job::Job;
use ccr_syncer::job_manager::JobManager;
use test_utils::{
    TEST_HOST_INFO, job_context, setup_store, table_sync_factory, table_sync_info,
};

async fn manager_with_job(name: &str) -> JobManager {
    let store = setup_store().await.unwrap();
    let ctx = job_context(store, Arc::new(table_sync_factory()));
    let manager = JobManager::new(ctx.clone(), TEST_HOST_INFO);
    let job = Job::create(table_sync_info(name), ctx).await.unwrap();
    manager.add_job(job).await.unwrap();
    manager
}

#[tokio::test]
async fn added_job_is_stored_and_listed() {
    let manager = manager_with_job("listed").await;
    let store = manager.context().store.clone();

    assert!(store.is_job_exist("listed").await.unwrap());
    assert_eq!(
        store.get_job_belong("listed").await.unwrap().as_deref(),
        Some(TEST_HOST_INFO)
    );
    assert_eq!(
        store.list_jobs_by_host(TEST_HOST_INFO).await.unwrap(),
        vec!["listed".to_string()]
    );

    let statuses = manager.list_jobs().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "listed");
    assert_eq!(statuses[0].state, "running");

    manager.stop().await;
}

#[tokio::test]
async fn duplicate_job_is_rejected() {
    let manager = manager_with_job("dup").await;

    // Validation against the store already refuses the name.
    let ctx = manager.context().clone();
    let err = Job::create(table_sync_info("dup"), ctx)
        .await
        .err()
        .expect("duplicate name");
    assert!(err.to_string().contains("job dup already exist"));

    manager.stop().await;
}

#[tokio::test]
async fn unknown_job_operations_fail() {
    let manager = manager_with_job("known").await;

    for err in [
        manager.pause("missing").await.unwrap_err(),
        manager.resume("missing").await.unwrap_err(),
        manager.desync("missing").await.unwrap_err(),
        manager.remove_job("missing").await.unwrap_err(),
        manager.job_status("missing").await.unwrap_err(),
    ] {
        assert!(err.to_string().contains("job not exist: missing"), "{err}");
    }

    let err = manager.recover(&["ghost".to_string()]).await.unwrap_err();
    assert!(err.to_string().contains("job info not found: ghost"));

    manager.stop().await;
}

#[tokio::test]
async fn pause_and_resume_are_persisted() {
    let manager = manager_with_job("toggle").await;
    let store = manager.context().store.clone();

    manager.pause("toggle").await.unwrap();
    assert_eq!(manager.job_status("toggle").await.unwrap().state, "paused");
    let stored: serde_json::Value =
        serde_json::from_str(&store.get_job_info("toggle").await.unwrap().unwrap()).unwrap();
    assert_eq!(stored["state"], 1);

    manager.resume("toggle").await.unwrap();
    assert_eq!(manager.job_status("toggle").await.unwrap().state, "running");

    manager.stop().await;
}

#[tokio::test]
async fn skip_request_is_validated_and_persisted() {
    let manager = manager_with_job("skip").await;
    let store = manager.context().store.clone();

    let err = manager.skip_binlog("skip", 10, "later").await.unwrap_err();
    assert!(err.to_string().contains("unknown skip by: later"));

    manager.skip_binlog("skip", 10, "fullsync").await.unwrap();
    let stored = store.get_job_info("skip").await.unwrap().unwrap();
    assert!(stored.contains(r#""skip_binlog":true"#));
    assert!(stored.contains(r#""skip_commit_seq":10"#));
    assert!(stored.contains(r#""skip_by":"fullsync""#));

    manager.stop().await;
}

#[tokio::test]
async fn host_mapping_updates_merge_and_remove() {
    let manager = manager_with_job("mapping").await;
    let store = manager.context().store.clone();

    manager
        .update_host_mapping(
            "mapping",
            HashMap::from([("10.0.0.11".to_string(), "1.2.3.4".to_string())]),
            HashMap::new(),
        )
        .await
        .unwrap();
    manager
        .update_host_mapping(
            "mapping",
            HashMap::from([
                ("10.0.0.11".to_string(), String::new()),
                ("10.0.0.12".to_string(), "5.6.7.8".to_string()),
            ]),
            HashMap::new(),
        )
        .await
        .unwrap();

    let stored: serde_json::Value =
        serde_json::from_str(&store.get_job_info("mapping").await.unwrap().unwrap()).unwrap();
    let mapping = stored["src"]["host_mapping"].as_object().unwrap();
    assert_eq!(mapping.len(), 1);
    assert_eq!(mapping["10.0.0.12"], "5.6.7.8");

    manager.stop().await;
}

#[tokio::test]
async fn desync_detaches_destination_table() {
    let store = setup_store().await.unwrap();
    let factory = Arc::new(table_sync_factory());
    let ctx = job_context(store, factory.clone());
    let manager = JobManager::new(ctx.clone(), TEST_HOST_INFO);
    manager
        .add_job(Job::create(table_sync_info("desync"), ctx).await.unwrap())
        .await
        .unwrap();

    // Before the first full sync the destination table is not resolved yet.
    manager.desync("desync").await.unwrap();
    assert_eq!(factory.dest.count("desync_tables"), 1);

    manager.stop().await;
}

#[tokio::test]
async fn removed_job_leaves_store_and_registry() {
    let manager = manager_with_job("removed").await;
    let store = manager.context().store.clone();

    manager.remove_job("removed").await.unwrap();
    assert!(!store.is_job_exist("removed").await.unwrap());
    assert!(manager.list_jobs().await.is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn recover_loads_stored_jobs_once() {
    let store = setup_store().await.unwrap();
    let ctx = job_context(store.clone(), Arc::new(table_sync_factory()));

    let first = JobManager::new(ctx.clone(), TEST_HOST_INFO);
    first
        .add_job(Job::create(table_sync_info("recovered"), ctx.clone()).await.unwrap())
        .await
        .unwrap();
    first.stop().await;

    let second = JobManager::new(ctx, TEST_HOST_INFO);
    second.recover_owned().await.unwrap();
    second.recover_owned().await.unwrap();
    let statuses = second.list_jobs().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].name, "recovered");

    second.stop().await;
}

#[tokio::test]
async fn start_returns_after_stop() {
    let manager = Arc::new(manager_with_job("lifecycle").await);

    let running = manager.clone();
    let handle = tokio::spawn(async move { running.start().await });
    tokio::task::yield_now().await;

    manager.stop().await;
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("start returns once stopped")
        .unwrap();
}
