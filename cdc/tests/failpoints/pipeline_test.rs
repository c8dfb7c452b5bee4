use std::time::Duration;

use cdc::error::ErrorKind;
use cdc::failpoints::{
    APPEND_CHANGES__BEFORE_WRITE, COMMIT_MERGE__AFTER_APPLY, MERGE_PASS__AFTER_TRIGGER,
};
use cdc::test_utils::failpoints::FailpointScenario;
use cdc::test_utils::pipeline::create_pipeline;
use cdc::test_utils::record::change_payload;
use cdc::test_utils::test_warehouse_wrapper::TestWarehouseWrapper;
use cdc::transport::memory::MemoryChangeSource;
use cdc::types::{ChangeKind, MergeCursor, TableId};
use cdc::warehouse::memory::MemoryWarehouse;
use cdc_telemetry::tracing::init_test_tracing;

const SHARED_TOPIC: &str = "all_tables";

#[tokio::test(start_paused = true)]
async fn merge_failing_after_apply_leaves_cursor_and_replica_untouched() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(COMMIT_MERGE__AFTER_APPLY, "1*return(timed_retry)")]);

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let appended = warehouse.wait_for_appended("orders", 2).await;
    let merged = warehouse.wait_for_merges("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    publisher.publish_json(&change_payload(Some("orders"), ChangeKind::Insert, 1, 1, Some("created")));
    publisher.publish_json(&change_payload(Some("orders"), ChangeKind::Insert, 2, 2, Some("created")));
    appended.notified().await;

    // The first trigger fires at 95 seconds and its commit is rolled back.
    tokio::time::sleep(Duration::from_secs(100)).await;

    let orders = TableId::from("orders");
    assert_eq!(warehouse.commit_attempts().await, 1);
    assert_eq!(warehouse.inner().cursor(&orders).await, MergeCursor::new(0));
    assert!(warehouse.inner().replica(&orders).await.is_empty());

    // The next trigger folds the same entries.
    merged.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(warehouse.commit_attempts().await, 2);
    assert_eq!(warehouse.inner().cursor(&orders).await, MergeCursor::new(2));
    assert_eq!(warehouse.inner().replica(&orders).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn append_failing_transiently_is_retried_without_skipping() {
    init_test_tracing();
    let _scenario =
        FailpointScenario::setup(&[(APPEND_CHANGES__BEFORE_WRITE, "2*return(timed_retry)")]);

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let appended = warehouse.wait_for_appended("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    let message_id = publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        1,
        1,
        Some("created"),
    ));

    appended.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    // The fail point fires before the warehouse is reached.
    assert_eq!(warehouse.append_attempts().await, 1);
    assert_eq!(
        warehouse
            .inner()
            .changelog(&TableId::from("orders"))
            .await
            .len(),
        1
    );
    assert_eq!(publisher.acked(), vec![message_id]);
}

#[tokio::test(start_paused = true)]
async fn permanent_append_failure_halts_branch_without_acknowledging() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(APPEND_CHANGES__BEFORE_WRITE, "return(no_retry)")]);

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    pipeline.start(vec![source]).await.unwrap();

    let message_id = publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        1,
        1,
        Some("created"),
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = pipeline.shutdown_and_wait().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::WithNoRetry));

    assert!(
        warehouse
            .inner()
            .changelog(&TableId::from("orders"))
            .await
            .is_empty()
    );
    assert!(publisher.acked().is_empty());
    assert_eq!(publisher.unacked(), vec![message_id]);
}

#[tokio::test(start_paused = true)]
async fn permanent_merge_failure_keeps_changelog_and_acknowledgements() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(MERGE_PASS__AFTER_TRIGGER, "return(no_retry)")]);

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let appended = warehouse.wait_for_appended("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    let message_id = publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        1,
        1,
        Some("created"),
    ));
    appended.notified().await;

    // Past the first trigger.
    tokio::time::sleep(Duration::from_secs(100)).await;

    let err = pipeline.shutdown_and_wait().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::WithNoRetry));

    let orders = TableId::from("orders");
    assert_eq!(warehouse.inner().changelog(&orders).await.len(), 1);
    assert!(warehouse.inner().replica(&orders).await.is_empty());
    assert_eq!(warehouse.commit_attempts().await, 0);
    assert_eq!(publisher.acked(), vec![message_id]);
}
