//! Concurrent duplicate submissions against the payment processor.

use std::sync::Arc;

use common::{Money, OrderId};
use futures_util::future::join_all;
use messaging::{EventPublisher, InMemoryMessageBus, PublisherConfig};
use payment::{PaymentConfig, PaymentProcessor};
use store::InMemoryStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_create_one_payment() {
    let store = InMemoryStore::new();
    let bus = InMemoryMessageBus::new();
    let publisher = EventPublisher::new(Arc::new(bus), PublisherConfig::default());
    let processor = Arc::new(PaymentProcessor::new(
        Arc::new(store.clone()),
        publisher,
        PaymentConfig::default(),
    ));
    let order_id = OrderId::new(77);

    let handles = (0..10).map(|_| {
        let processor = processor.clone();
        tokio::spawn(async move {
            processor
                .create_payment(order_id, Money::from_dollars(40))
                .await
        })
    });

    let results = join_all(handles).await;
    let ids: Vec<_> = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().id)
        .collect();

    assert_eq!(store.payment_count().await, 1);
    assert!(ids.iter().all(|id| *id == ids[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn distinct_orders_get_distinct_payments() {
    let store = InMemoryStore::new();
    let publisher = EventPublisher::new(
        Arc::new(InMemoryMessageBus::new()),
        PublisherConfig::default(),
    );
    let processor = Arc::new(PaymentProcessor::new(
        Arc::new(store.clone()),
        publisher,
        PaymentConfig::default(),
    ));

    let handles = (1..=5).map(|n| {
        let processor = processor.clone();
        tokio::spawn(async move {
            processor
                .create_payment(OrderId::new(n), Money::from_dollars(40))
                .await
        })
    });

    for joined in join_all(handles).await {
        joined.unwrap().unwrap();
    }
    assert_eq!(store.payment_count().await, 5);
}
