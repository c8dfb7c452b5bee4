use cdc::error::ErrorKind;
use cdc::test_utils::pipeline::create_pipeline;
use cdc::test_utils::record::change_payload;
use cdc::test_utils::test_warehouse_wrapper::TestWarehouseWrapper;
use cdc::transport::memory::MemoryChangeSource;
use cdc::types::{Cell, ChangeKind, MergeCursor, OrderingToken, PrimaryKey, TableId};
use cdc::warehouse::memory::MemoryWarehouse;
use cdc_telemetry::tracing::init_test_tracing;

const SHARED_TOPIC: &str = "all_tables";

fn status_of(row: &cdc::types::ReplicaRow) -> Option<&Cell> {
    row.columns.get("status")
}

#[tokio::test(start_paused = true)]
async fn late_update_with_lower_token_loses_to_insert() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let appended = warehouse.wait_for_appended("orders", 2).await;
    let merged = warehouse.wait_for_merges("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    let insert = publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        1,
        10,
        Some("created"),
    ));
    let late_update = publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Update,
        1,
        9,
        Some("stale"),
    ));

    appended.notified().await;
    merged.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    let orders = TableId::from("orders");
    let replica = warehouse.inner().replica(&orders).await;
    assert_eq!(replica.len(), 1);

    let row = replica.values().next().unwrap();
    assert_eq!(row.ordering_token, OrderingToken::new(10));
    assert_eq!(status_of(row), Some(&Cell::from("created")));
    assert_eq!(warehouse.inner().cursor(&orders).await, MergeCursor::new(2));

    let acked = publisher.acked();
    assert!(acked.contains(&insert));
    assert!(acked.contains(&late_update));
    assert!(warehouse.shutdown_called().await);
}

#[tokio::test(start_paused = true)]
async fn delete_after_insert_in_same_batch_leaves_no_row() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let merged = warehouse.wait_for_merges("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        5,
        15,
        Some("created"),
    ));
    publisher.publish_json(&change_payload(Some("orders"), ChangeKind::Delete, 5, 20, None));
    publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        6,
        16,
        Some("created"),
    ));

    merged.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    let replica = warehouse.inner().replica(&TableId::from("orders")).await;
    let deleted = PrimaryKey::from_iter([("id", 5i64)]).canonical();
    let kept = PrimaryKey::from_iter([("id", 6i64)]).canonical();

    assert!(!replica.contains_key(&deleted));
    assert!(replica.contains_key(&kept));
    assert_eq!(
        warehouse.inner().changelog(&TableId::from("orders")).await.len(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn redelivered_change_is_appended_once() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let orders = TableId::from("orders");
    let appended = warehouse.wait_for_appended("orders", 1).await;
    let duplicate_dropped = {
        let orders = orders.clone();
        warehouse
            .notify_on_activity(move |activity| activity.duplicates(&orders) >= 1)
            .await
    };

    pipeline.start(vec![source]).await.unwrap();

    let payload = change_payload(Some("orders"), ChangeKind::Insert, 1, 10, Some("created"));
    let first = publisher.publish_json(&payload);
    appended.notified().await;

    // The same change published again carries a new message id but the same identity.
    let second = publisher.publish_json(&payload);
    duplicate_dropped.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    let changelog = warehouse.inner().changelog(&orders).await;
    assert_eq!(changelog.len(), 1);
    assert_eq!(changelog[0].sequence_number, 1);

    let activity = warehouse.activity().await;
    assert_eq!(activity.appended(&orders), 1);
    assert_eq!(activity.duplicates(&orders), 1);

    // Duplicates are acknowledged like any durable record.
    let acked = publisher.acked();
    assert!(acked.contains(&first));
    assert!(acked.contains(&second));
}

#[tokio::test(start_paused = true)]
async fn transient_append_failures_are_retried() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    warehouse
        .fail_next_appends(2, ErrorKind::WarehouseConnectionFailed)
        .await;

    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let appended = warehouse.wait_for_appended("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    let message_id = publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        1,
        10,
        Some("created"),
    ));

    appended.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(warehouse.append_attempts().await, 3);
    assert_eq!(publisher.acked(), vec![message_id]);
}

#[tokio::test(start_paused = true)]
async fn failed_merge_commit_is_retried_on_next_trigger() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    warehouse
        .fail_next_commits(1, ErrorKind::WarehouseTransactionConflict)
        .await;

    let (source, publisher) = MemoryChangeSource::new(SHARED_TOPIC);
    let mut pipeline = create_pipeline(&[SHARED_TOPIC], true, warehouse.clone()).unwrap();

    let merged = warehouse.wait_for_merges("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        1,
        10,
        Some("created"),
    ));

    merged.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    let orders = TableId::from("orders");
    assert_eq!(warehouse.commit_attempts().await, 2);
    assert_eq!(warehouse.inner().cursor(&orders).await, MergeCursor::new(1));
    assert_eq!(warehouse.inner().replica(&orders).await.len(), 1);
}
