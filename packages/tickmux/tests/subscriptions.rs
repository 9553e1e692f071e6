//! Subscription Management Integration Tests
//!
//! Exercises dedup by fingerprint, creation arbitration, independent
//! handles, per-handle and per-kind cancellation, the buy-then-track
//! entity index, and cache updates from streaming events.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use serde_json::{Value, json};
use tickmux::{ApiError, InboundMessage, SubscriptionHandle};

use common::{FakeRemote, connect_client};

async fn expect_event(handle: &mut SubscriptionHandle) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(5), handle.next())
        .await
        .expect("timed out waiting for a subscription event")
        .expect("stream ended unexpectedly")
        .expect("stream failed unexpectedly")
}

/// Drive a subscribe call while answering the remote side's one request.
async fn subscribe_confirmed(
    client: &tickmux::ApiClient,
    remote: &mut FakeRemote,
    request: Value,
    msg_type: &str,
    subscription_id: &str,
) -> SubscriptionHandle {
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(request).await }
    });
    let wire_request = remote.next_request().await;
    assert_eq!(wire_request["subscribe"], 1);
    remote.respond_subscription(&wire_request, msg_type, json!({}), subscription_id);
    let mut handle = task.await.unwrap().unwrap();
    // Consume the confirmation so the handle sits at live events.
    let _confirmation = expect_event(&mut handle).await;
    handle
}

#[tokio::test]
async fn equivalent_requests_share_one_upstream_subscription() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let mut first = subscribe_confirmed(
        &client,
        &mut remote,
        json!({"ticks": "R_100"}),
        "ticks",
        "sub-1",
    )
    .await;

    // Identical request, different field order: no wire traffic.
    let second_task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(json!({"subscribe": 1, "ticks": "R_100"})).await }
    });
    let mut second = second_task.await.unwrap().unwrap();
    remote.expect_silence(Duration::from_millis(50)).await;

    let connection = client.connection(client.default_connection()).unwrap();
    assert_eq!(connection.active_subscriptions(), 1);

    // Every event reaches both handles.
    remote.push_event("tick", json!({"quote": 1.25}), "sub-1");
    assert_eq!(expect_event(&mut first).await.body().unwrap()["quote"], 1.25);
    assert_eq!(expect_event(&mut second).await.body().unwrap()["quote"], 1.25);

    // Cancelling one handle leaves the other alone, no wire traffic.
    assert!(client.forget(first).await.unwrap().is_none());
    remote.expect_silence(Duration::from_millis(50)).await;

    remote.push_event("tick", json!({"quote": 1.5}), "sub-1");
    assert_eq!(expect_event(&mut second).await.body().unwrap()["quote"], 1.5);

    // Cancelling the last handle sends exactly one cancel message.
    let forget_task = tokio::spawn({
        let client = client.clone();
        async move { client.forget(second).await }
    });
    let cancel = remote.next_request().await;
    assert_eq!(cancel["forget"], "sub-1");
    remote.respond(&cancel, "forget", json!(1));
    assert!(forget_task.await.unwrap().unwrap().is_some());
    assert_eq!(connection.active_subscriptions(), 0);
}

#[tokio::test]
async fn concurrent_subscribes_share_the_in_flight_creation() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let first_task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(json!({"ticks": "R_100"})).await }
    });
    let second_task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(json!({"ticks": "R_100"})).await }
    });

    // Exactly one subscribe goes to the wire.
    let wire_request = remote.next_request().await;
    remote.expect_silence(Duration::from_millis(50)).await;
    remote.respond_subscription(&wire_request, "ticks", json!({"quote": 1.0}), "sub-1");

    let mut first = first_task.await.unwrap().unwrap();
    let mut second = second_task.await.unwrap().unwrap();

    // Both observe the confirmation and every subsequent tick identically.
    assert!(expect_event(&mut first).await.subscription.is_some());
    assert!(expect_event(&mut second).await.subscription.is_some());

    remote.push_event("tick", json!({"quote": 2.0}), "sub-1");
    remote.push_event("tick", json!({"quote": 3.0}), "sub-1");
    for handle in [&mut first, &mut second] {
        assert_eq!(expect_event(handle).await.body().unwrap()["quote"], 2.0);
        assert_eq!(expect_event(handle).await.body().unwrap()["quote"], 3.0);
    }
}

#[tokio::test]
async fn failed_creation_propagates_to_every_waiter() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let first_task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(json!({"ticks": "BADSYM"})).await }
    });
    let second_task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(json!({"ticks": "BADSYM"})).await }
    });

    let wire_request = remote.next_request().await;
    remote.respond_error(&wire_request, "InvalidSymbol", "Symbol BADSYM invalid.");

    let expected = ApiError::remote("InvalidSymbol", "Symbol BADSYM invalid.");
    assert_eq!(first_task.await.unwrap().unwrap_err(), expected);
    assert_eq!(second_task.await.unwrap().unwrap_err(), expected);

    let connection = client.connection(client.default_connection()).unwrap();
    assert_eq!(connection.active_subscriptions(), 0);
}

#[tokio::test]
async fn forget_all_cancels_only_matching_kinds() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let mut ticks_a = subscribe_confirmed(
        &client,
        &mut remote,
        json!({"ticks": "R_100"}),
        "ticks",
        "sub-a",
    )
    .await;
    let mut ticks_b = subscribe_confirmed(
        &client,
        &mut remote,
        json!({"ticks": "R_50"}),
        "ticks",
        "sub-b",
    )
    .await;
    let mut balance = subscribe_confirmed(
        &client,
        &mut remote,
        json!({"balance": 1}),
        "balance",
        "sub-c",
    )
    .await;

    let forget_task = tokio::spawn({
        let client = client.clone();
        async move { client.forget_all(&["ticks"]).await }
    });
    let wire_request = remote.next_request().await;
    assert_eq!(wire_request["forget_all"], json!(["ticks"]));
    remote.respond(&wire_request, "forget_all", json!(["sub-a", "sub-b"]));
    forget_task.await.unwrap().unwrap();

    // Tick streams ended gracefully; balance is untouched.
    assert!(ticks_a.next().await.is_none());
    assert!(ticks_b.next().await.is_none());

    remote.push_event("balance", json!({"amount": 100}), "sub-c");
    assert_eq!(
        expect_event(&mut balance).await.body().unwrap()["amount"],
        100
    );

    let connection = client.connection(client.default_connection()).unwrap();
    assert_eq!(connection.active_subscriptions(), 1);
}

#[tokio::test]
async fn buy_confirmation_entity_id_reuses_the_source() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let buy_task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(json!({"buy": "proposal-uuid", "price": 100})).await }
    });
    let wire_request = remote.next_request().await;
    remote.respond_subscription(
        &wire_request,
        "buy",
        json!({"contract_id": 4455, "buy_price": 100}),
        "sub-buy",
    );
    let mut buyer = buy_task.await.unwrap().unwrap();
    let confirmation = expect_event(&mut buyer).await;
    assert_eq!(confirmation.body().unwrap()["contract_id"], 4455);

    // Tracking the bought contract attaches to the buy source without a
    // second upstream subscription.
    let mut tracker = client
        .subscribe(json!({"proposal_open_contract": 1, "contract_id": 4455}))
        .await
        .unwrap();
    remote.expect_silence(Duration::from_millis(50)).await;

    let connection = client.connection(client.default_connection()).unwrap();
    assert_eq!(connection.active_subscriptions(), 1);

    remote.push_event(
        "proposal_open_contract",
        json!({"contract_id": 4455, "profit": 1.1}),
        "sub-buy",
    );
    assert_eq!(
        expect_event(&mut buyer).await.body().unwrap()["profit"],
        1.1
    );
    assert_eq!(
        expect_event(&mut tracker).await.body().unwrap()["profit"],
        1.1
    );
}

#[tokio::test]
async fn confirmation_without_subscription_id_completes_the_stream() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe(json!({"ticks": "R_100"})).await }
    });
    let wire_request = remote.next_request().await;
    remote.respond(&wire_request, "ticks", json!({"quote": 1.0}));

    let mut handle = task.await.unwrap().unwrap();
    assert!(expect_event(&mut handle).await.body().is_some());
    assert!(handle.next().await.is_none());

    let connection = client.connection(client.default_connection()).unwrap();
    assert_eq!(connection.active_subscriptions(), 0);
}

#[tokio::test]
async fn non_stream_requests_cannot_subscribe() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let error = client.subscribe(json!({"ping": 1})).await.unwrap_err();
    assert!(matches!(error, ApiError::Construction(_)));
    remote.expect_silence(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn streaming_events_update_the_cache() {
    let (client, mut remote, _factory, _remotes) = connect_client().await;

    let mut handle = subscribe_confirmed(
        &client,
        &mut remote,
        json!({"ticks": "R_100"}),
        "ticks",
        "sub-1",
    )
    .await;

    remote.push_event("tick", json!({"quote": 7.5}), "sub-1");
    let _tick = expect_event(&mut handle).await;

    let cached = client
        .cached(&json!({"ticks": "R_100"}))
        .unwrap()
        .expect("latest tick should be cached");
    assert_eq!(cached.response.body().unwrap()["quote"], 7.5);
}
