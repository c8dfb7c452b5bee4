use std::time::Duration;

use cdc::descriptor::{ENGINE_LABEL, ENGINE_NAME, INPUT_MODE_LABEL};
use cdc::error::ErrorKind;
use cdc::test_utils::pipeline::{create_pipeline, test_config};
use cdc::test_utils::record::change_payload;
use cdc::test_utils::test_warehouse_wrapper::TestWarehouseWrapper;
use cdc::pipeline::Pipeline;
use cdc::transport::memory::MemoryChangeSource;
use cdc::types::{ChangeKind, TableId};
use cdc::warehouse::memory::MemoryWarehouse;
use cdc_telemetry::tracing::init_test_tracing;
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn per_table_streams_feed_their_own_branches() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (orders_source, orders) = MemoryChangeSource::new("orders");
    let (customers_source, customers) = MemoryChangeSource::new("customers");
    let mut pipeline =
        create_pipeline(&["orders", "customers"], false, warehouse.clone()).unwrap();

    let orders_merged = warehouse.wait_for_merges("orders", 1).await;
    let customers_merged = warehouse.wait_for_merges("customers", 1).await;

    pipeline
        .start(vec![orders_source, customers_source])
        .await
        .unwrap();

    // Dedicated streams do not need to name the table.
    orders.publish_json(&change_payload(None, ChangeKind::Insert, 1, 1, Some("created")));
    orders.publish_json(&change_payload(None, ChangeKind::Update, 1, 2, Some("paid")));
    customers.publish_json(&change_payload(None, ChangeKind::Insert, 7, 1, Some("active")));

    orders_merged.notified().await;
    customers_merged.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(
        warehouse.inner().table_ids().await,
        vec![TableId::from("customers"), TableId::from("orders")]
    );
    assert_eq!(
        warehouse
            .inner()
            .replica(&TableId::from("orders"))
            .await
            .len(),
        1
    );
    assert_eq!(
        warehouse
            .inner()
            .replica(&TableId::from("customers"))
            .await
            .len(),
        1
    );
    assert!(orders.unacked().is_empty());
    assert!(customers.unacked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unroutable_messages_stay_unacknowledged() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (source, publisher) = MemoryChangeSource::new("all_tables");
    let mut pipeline = create_pipeline(&["all_tables"], true, warehouse.clone()).unwrap();

    let appended = warehouse.wait_for_appended("orders", 1).await;

    pipeline.start(vec![source]).await.unwrap();

    let without_table =
        publisher.publish_json(&change_payload(None, ChangeKind::Insert, 1, 1, Some("created")));
    let not_json = publisher.publish("not a change record");
    let routed = publisher.publish_json(&change_payload(
        Some("orders"),
        ChangeKind::Insert,
        2,
        2,
        Some("created"),
    ));

    appended.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(publisher.acked(), vec![routed]);

    let unacked = publisher.unacked();
    assert!(unacked.contains(&without_table));
    assert!(unacked.contains(&not_json));
    assert_eq!(warehouse.inner().table_ids().await, vec![TableId::from("orders")]);
}

#[tokio::test(start_paused = true)]
async fn invalid_record_halts_only_its_table() {
    init_test_tracing();

    let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
    let (orders_source, orders) = MemoryChangeSource::new("orders");
    let (customers_source, customers) = MemoryChangeSource::new("customers");
    let mut pipeline =
        create_pipeline(&["orders", "customers"], false, warehouse.clone()).unwrap();

    let orders_merged = warehouse.wait_for_merges("orders", 1).await;

    pipeline
        .start(vec![orders_source, customers_source])
        .await
        .unwrap();

    // An update must carry the row columns.
    let invalid = customers.publish_json(&json!({
        "kind": "UPDATE",
        "primary_key": {"id": 7},
        "ordering_token": 3,
    }));
    orders.publish_json(&change_payload(None, ChangeKind::Insert, 1, 1, Some("created")));

    orders_merged.notified().await;

    // Customers that arrive after the halt are never delivered to a branch.
    let late = customers.publish_json(&change_payload(None, ChangeKind::Insert, 8, 4, Some("new")));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = pipeline.shutdown_and_wait().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::InvalidData));

    assert_eq!(
        warehouse
            .inner()
            .replica(&TableId::from("orders"))
            .await
            .len(),
        1
    );
    assert!(
        warehouse
            .inner()
            .changelog(&TableId::from("customers"))
            .await
            .is_empty()
    );

    let unacked = customers.unacked();
    assert!(unacked.contains(&invalid));
    assert!(unacked.contains(&late));
    assert!(orders.unacked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn descriptor_carries_engine_and_user_labels() {
    let pipeline = create_pipeline(&["orders"], false, MemoryWarehouse::new()).unwrap();
    let descriptor = pipeline.descriptor();

    assert_eq!(descriptor.labels["env"], "test");
    assert_eq!(descriptor.labels[ENGINE_LABEL], ENGINE_NAME);
    assert_eq!(descriptor.labels[INPUT_MODE_LABEL], "per-table-streams");
    assert_eq!(descriptor.update_frequency, Duration::from_secs(95));
    assert_eq!(descriptor.warehouse, "memory");
}

#[tokio::test]
async fn configuration_violations_are_rejected_before_start() {
    let mut config = test_config(&["orders"], false);
    config.update_frequency_secs = 94;
    let err = Pipeline::new(config, MemoryWarehouse::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
    assert!(err.to_string().contains("1000"));

    let mut config = test_config(&["orders"], false);
    config.input_subscriptions = Some(vec!["orders/applier".to_string()]);
    let err = Pipeline::new(config, MemoryWarehouse::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    let mut config = test_config(&["orders"], false);
    config.input_topics = None;
    let err = Pipeline::new(config, MemoryWarehouse::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    let mut config = test_config(&["orders"], false);
    config.update_frequency_secs = 95;
    assert!(Pipeline::new(config, MemoryWarehouse::new()).is_ok());
}
