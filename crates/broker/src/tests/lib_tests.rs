use super::*;

#[test]
fn filter_matching_follows_mqtt_wildcards() {
    assert!(topic_matches("portrait/skip/+", "portrait/skip/3"));
    assert!(!topic_matches("portrait/skip/+", "portrait/skip/3/extra"));
    assert!(!topic_matches("portrait/skip/+", "portrait/group/3"));
    assert!(topic_matches("portrait/#", "portrait/group/3"));
    assert!(topic_matches("portrait/device/D1", "portrait/device/D1"));
    assert!(!topic_matches("portrait/device/D1", "portrait/device/D2"));
    assert!(!topic_matches("portrait/device/D1", "portrait/device"));
}

#[tokio::test]
async fn memory_broker_routes_to_matching_subscribers_only() {
    let broker = MemoryBroker::new();
    let (coordinator, mut coordinator_events) = broker.connect("coordinator");
    let (frame, mut frame_events) = broker.connect("frame");
    assert_eq!(coordinator_events.recv().await, Some(BrokerEvent::Connected));
    assert_eq!(frame_events.recv().await, Some(BrokerEvent::Connected));

    coordinator.subscribe("portrait/skip/+").await.expect("subscribe");
    frame
        .publish("portrait/skip/4", b"SKIP".to_vec(), Qos::AtMostOnce)
        .await
        .expect("publish");
    frame
        .publish("portrait/device/D1", b"LOGIN".to_vec(), Qos::AtMostOnce)
        .await
        .expect("publish");

    assert_eq!(
        coordinator_events.recv().await,
        Some(BrokerEvent::Message {
            topic: "portrait/skip/4".into(),
            payload: b"SKIP".to_vec(),
        })
    );
    assert!(coordinator_events.try_recv().is_err());
    assert!(frame_events.try_recv().is_err());
    assert_eq!(broker.published().len(), 2);
    assert_eq!(broker.published_to("portrait/skip/4"), vec![b"SKIP".to_vec()]);
}

#[tokio::test]
async fn reconnect_drops_subscriptions_and_signals_edges() {
    let broker = MemoryBroker::new();
    let (frame, mut events) = broker.connect("frame");
    assert_eq!(events.recv().await, Some(BrokerEvent::Connected));
    frame.subscribe("portrait/group/1").await.expect("subscribe");
    assert_eq!(broker.subscriptions("frame"), vec!["portrait/group/1".to_string()]);

    broker.reconnect_all();

    assert_eq!(events.recv().await, Some(BrokerEvent::Disconnected));
    assert_eq!(events.recv().await, Some(BrokerEvent::Connected));
    assert!(broker.subscriptions("frame").is_empty());
}

#[tokio::test]
async fn failing_publishes_are_not_recorded() {
    let broker = MemoryBroker::new();
    let (frame, _events) = broker.connect("frame");
    broker.set_fail_publishes(true);
    let result = frame
        .publish("portrait/group/1", b"RENEW".to_vec(), Qos::AtLeastOnce)
        .await;
    assert!(matches!(result, Err(BrokerError::Rejected { .. })));
    assert!(broker.published().is_empty());
}
