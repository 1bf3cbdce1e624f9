//! End-to-end lifecycle through the controller runtime

use instanceflow_cloud::{FakeCloud, InstanceState};
use instanceflow_controlplane::testing::{sample_record, sample_spec};
use instanceflow_controlplane::{
    Controller, ControllerConfig, FINALIZER, FileStore, InstanceProvisioner, InstanceRecord,
    InstanceTerminator, LifecycleState, MemoryStore, RecordKey, RecordStore, Reconciler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_secs(5);

async fn wait_until<F>(store: &dyn RecordStore, key: &RecordKey, done: F) -> Option<InstanceRecord>
where
    F: Fn(Option<&InstanceRecord>) -> bool,
{
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(120) {
        let record = store.get(key).await.unwrap();
        if done(record.as_ref()) {
            return record;
        }
        sleep(Duration::from_millis(250)).await;
    }
    panic!("condition not reached for {}", key);
}

#[tokio::test(start_paused = true)]
async fn test_create_then_delete_through_controller() {
    let store = Arc::new(MemoryStore::new());
    let cloud = Arc::new(FakeCloud::new());
    let reconciler = Arc::new(Reconciler::new(store.clone(), cloud.clone(), POLL));
    let cancel = CancellationToken::new();
    let controller = tokio::spawn(
        Controller::new(reconciler, ControllerConfig::default()).run(cancel.clone()),
    );

    let key = store.create(sample_record("web")).await.unwrap().key();

    let running = wait_until(store.as_ref(), &key, |r| {
        r.is_some_and(|r| r.status.state == LifecycleState::Running)
    })
    .await
    .unwrap();
    assert_eq!(running.status.instance_id.as_deref(), Some("i-mock123456"));
    assert_eq!(running.status.public_ip.as_deref(), Some("1.2.3.4"));
    assert_eq!(running.status.private_ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(
        running.status.public_dns.as_deref(),
        Some("ec2-1-2-3-4.compute.amazonaws.com")
    );
    assert!(running.metadata.has_finalizer(FINALIZER));

    store.delete(&key).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_some());

    wait_until(store.as_ref(), &key, |r| r.is_none()).await;
    assert_eq!(cloud.calls().create, 1);
    assert_eq!(cloud.calls().terminate, 1);
    assert_eq!(cloud.instance_state("i-mock123456"), Some(InstanceState::Terminated));

    cancel.cancel();
    controller.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_many_records_each_get_one_instance() {
    let store = Arc::new(MemoryStore::new());
    let cloud = Arc::new(
        FakeCloud::new().with_boot_sequence([
            InstanceState::Pending,
            InstanceState::Pending,
            InstanceState::Running,
        ]),
    );
    let reconciler = Arc::new(Reconciler::new(store.clone(), cloud.clone(), POLL));
    let cancel = CancellationToken::new();
    let config = ControllerConfig {
        workers: 2,
        ..Default::default()
    };
    let controller = tokio::spawn(Controller::new(reconciler, config).run(cancel.clone()));

    let mut keys = Vec::new();
    for name in ["a", "b", "c", "d", "e"] {
        keys.push(store.create(sample_record(name)).await.unwrap().key());
    }
    for key in &keys {
        wait_until(store.as_ref(), key, |r| {
            r.is_some_and(|r| r.status.state == LifecycleState::Running)
        })
        .await;
    }

    assert_eq!(cloud.launched(), keys.len());

    cancel.cancel();
    controller.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_file_store_shared_between_instances() {
    let temp_dir = tempfile::tempdir().unwrap();
    let cli_store = FileStore::new(temp_dir.path());
    let daemon_store: Arc<FileStore> = Arc::new(FileStore::new(temp_dir.path()));
    let cloud = Arc::new(FakeCloud::new());
    let reconciler = Reconciler::new(daemon_store.clone(), cloud.clone(), POLL);

    let key = cli_store.create(sample_record("web")).await.unwrap().key();
    reconciler.reconcile(&key).await.unwrap();

    let seen_by_cli = cli_store.get(&key).await.unwrap().unwrap();
    assert_eq!(seen_by_cli.status.state, LifecycleState::Running);
    assert_eq!(seen_by_cli.status.instance_id.as_deref(), Some("i-mock123456"));

    cli_store.delete(&key).await.unwrap();
    // terminate, then confirm on the next pass
    reconciler.reconcile(&key).await.unwrap();
    let mut record = daemon_store.get(&key).await.unwrap().unwrap();
    record.status.next_check_after = None;
    daemon_store.update_status(&record).await.unwrap();
    reconciler.reconcile(&key).await.unwrap();

    assert!(cli_store.get(&key).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_blocking_provision_and_terminate() {
    let cloud = Arc::new(FakeCloud::new().with_boot_sequence([
        InstanceState::Pending,
        InstanceState::Running,
    ]));
    let cancel = CancellationToken::new();

    let info = InstanceProvisioner::new(cloud.clone(), POLL)
        .provision(&sample_spec(), &cancel)
        .await
        .unwrap();
    assert_eq!(info.state, InstanceState::Running);
    assert_eq!(info.private_dns.as_deref(), Some("ip-10-0-0-1.ec2.internal"));

    let terminated = InstanceTerminator::new(cloud.clone(), POLL)
        .terminate("us-east-1", &info.instance_id, &cancel)
        .await
        .unwrap();
    assert!(terminated);
    assert_eq!(cloud.calls().terminate, 1);
}
