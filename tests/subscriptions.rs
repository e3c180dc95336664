mod common;

use futures::StreamExt;
use serde_json::json;
use std::time::Duration;

use common::{eventually, flag_set, start, InitOutcome};
use experiment_client::backend::Topic;

fn flag_topic(name: &str) -> Topic {
    Topic::Flag(name.to_string())
}

#[tokio::test]
async fn backend_listener_follows_subscriber_count() {
    let harness = start(InitOutcome::Ready, flag_set(json!({ "flagA": 1 })));
    harness.client.ready().await;
    let connection = harness.backend.connection.clone();

    let first = harness.client.get_experiment_changes::<i64>("flagA");
    let second = harness.client.get_experiment_changes::<i64>("flagA");
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 1);
    assert_eq!(harness.client.subscriber_count("flagA"), 2);

    drop(first);
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 1);

    second.unsubscribe();
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 0);
    assert_eq!(harness.client.subscriber_count("flagA"), 0);
}

#[tokio::test]
async fn listeners_are_tracked_per_flag() {
    let harness = start(InitOutcome::Ready, flag_set(json!({})));
    harness.client.ready().await;
    let connection = harness.backend.connection.clone();

    let a = harness.client.get_experiment_changes::<bool>("flagA");
    let b = harness.client.get_experiment_changes::<bool>("flagB");
    let a2 = harness.client.get_experiment_changes::<bool>("flagA");

    drop(b);
    assert_eq!(connection.listener_count(&flag_topic("flagB")), 0);
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 1);

    drop(a);
    drop(a2);
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 0);
}

#[tokio::test]
async fn subscribers_see_changes_in_backend_order() {
    let harness = start(InitOutcome::Ready, flag_set(json!({ "flagA": 0 })));
    harness.client.ready().await;

    let mut first = harness.client.get_experiment_changes::<i64>("flagA");
    let mut second = harness.client.get_experiment_changes::<i64>("flagA");

    for value in 1..=3 {
        harness
            .backend
            .connection
            .push_flags(flag_set(json!({ "flagA": value })));
    }

    let first: Vec<i64> = first.by_ref().take(3).collect().await;
    let second: Vec<i64> = second.by_ref().take(3).collect().await;
    assert_eq!(first, vec![1, 2, 3]);
    assert_eq!(second, vec![1, 2, 3]);
}

#[tokio::test]
async fn only_the_subscribed_flag_is_delivered() {
    let harness = start(InitOutcome::Ready, flag_set(json!({ "flagA": 0, "flagB": 0 })));
    harness.client.ready().await;

    let mut changes = harness.client.get_experiment_changes::<i64>("flagA");
    harness
        .backend
        .connection
        .push_flags(flag_set(json!({ "flagA": 0, "flagB": 5 })));
    harness
        .backend
        .connection
        .push_flags(flag_set(json!({ "flagA": 9, "flagB": 5 })));

    assert_eq!(changes.next().await, Some(9));
}

#[tokio::test]
async fn values_of_another_type_are_skipped() {
    let harness = start(InitOutcome::Ready, flag_set(json!({ "flagA": true })));
    harness.client.ready().await;

    let mut changes = harness.client.get_experiment_changes::<bool>("flagA");
    harness
        .backend
        .connection
        .push_flags(flag_set(json!({ "flagA": "oops" })));
    harness
        .backend
        .connection
        .push_flags(flag_set(json!({ "flagA": false })));

    assert_eq!(changes.next().await, Some(false));
}

#[tokio::test]
async fn removed_flag_is_delivered_as_null() {
    let harness = start(InitOutcome::Ready, flag_set(json!({ "flagA": 1 })));
    harness.client.ready().await;

    let mut raw = harness.client.get_experiment_changes::<serde_json::Value>("flagA");
    let mut optional = harness.client.get_experiment_changes::<Option<i64>>("flagA");
    let mut typed = harness.client.get_experiment_changes::<i64>("flagA");

    harness.backend.connection.push_flags(flag_set(json!({})));
    harness.backend.connection.push_flags(flag_set(json!({ "flagA": 3 })));

    let next = tokio::time::timeout(Duration::from_secs(1), raw.next()).await;
    assert_eq!(next.unwrap(), Some(json!(null)));
    assert_eq!(optional.next().await, Some(None));
    assert_eq!(optional.next().await, Some(Some(3)));
    // a plain typed stream skips the removal
    assert_eq!(typed.next().await, Some(3));
}

#[tokio::test]
async fn dropping_a_subscription_between_events() {
    let harness = start(InitOutcome::Ready, flag_set(json!({ "flagA": 0 })));
    harness.client.ready().await;
    let connection = harness.backend.connection.clone();

    let mut once = harness.client.get_experiment_changes::<i64>("flagA");
    let mut stays = harness.client.get_experiment_changes::<i64>("flagA");

    connection.push_flags(flag_set(json!({ "flagA": 1 })));
    assert_eq!(once.next().await, Some(1));
    drop(once);

    connection.push_flags(flag_set(json!({ "flagA": 2 })));
    assert_eq!(stays.next().await, Some(1));
    assert_eq!(stays.next().await, Some(2));
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 1);
}

#[tokio::test]
async fn resubscribing_after_the_last_unsubscribe() {
    let harness = start(InitOutcome::Ready, flag_set(json!({ "flagA": 0 })));
    harness.client.ready().await;
    let connection = harness.backend.connection.clone();

    drop(harness.client.get_experiment_changes::<i64>("flagA"));
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 0);

    let mut again = harness.client.get_experiment_changes::<i64>("flagA");
    assert_eq!(connection.listener_count(&flag_topic("flagA")), 1);

    connection.push_flags(flag_set(json!({ "flagA": 4 })));
    let next = tokio::time::timeout(Duration::from_secs(1), again.next()).await;
    assert_eq!(next.unwrap(), Some(4));
}

#[tokio::test]
async fn backend_changes_are_propagated() {
    let harness = start(InitOutcome::Ready, flag_set(json!({})));
    harness.client.ready().await;

    harness.backend.connection.push_flags(flag_set(json!({
        "featureService.FEATURE_X": { "enabled": true },
        "featureService.FEATURE_Y": {},
        "i18n_connector.title": "Custom Title",
        "i18n_empty.one": "",
    })));

    let recorder = harness.recorder.clone();
    eventually(|| recorder.last_features().is_some_and(|f| !f.is_empty())).await;

    let features = recorder.last_features().unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features.get("FEATURE_X"), Some(&true));

    let messages = recorder.last_messages().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages["connector.title"], "Custom Title");

    let (_, tag) = recorder.last_tag().unwrap();
    assert!(tag.contains("featureService.FEATURE_X"));
    assert_eq!(
        harness.client.get_experiment::<serde_json::Value>("featureService.FEATURE_Y", json!(null)),
        json!({})
    );
}
