use super::*;
use crate::{
    reconciler::Timeline,
    test_support::{wait_for_timeline, wire, ScriptedTransport, BASE_TOKEN},
};
use shared::domain::MessageId;

fn sink_for(channel: &str, timeline: &SharedTimeline) -> (DeliverySink, broadcast::Receiver<ClientEvent>) {
    let (events, rx) = broadcast::channel(16);
    (
        DeliverySink::new(ChannelId::new(channel), Arc::clone(timeline), events),
        rx,
    )
}

#[tokio::test]
async fn bind_parks_deliveries_until_started() {
    let transport = Arc::new(ScriptedTransport::new());
    let mut coordinator = SubscriptionCoordinator::new(transport.clone());
    let timeline = Timeline::shared();

    coordinator
        .bind(&ChannelId::new("room-1"))
        .await
        .expect("bind");
    assert_eq!(coordinator.active_channel(), Some(&ChannelId::new("room-1")));
    assert!(!coordinator.is_delivering());

    transport
        .deliver("room-1", wire("m1", "queued"), BASE_TOKEN)
        .await;
    assert!(timeline.lock().await.is_empty());

    let (sink, _events) = sink_for("room-1", &timeline);
    assert!(coordinator.start_delivery(sink.clone()));
    assert!(coordinator.is_delivering());
    assert!(!coordinator.start_delivery(sink));
    assert!(wait_for_timeline(&timeline, |t| t.contains(&MessageId::new("m1"))).await);
}

#[tokio::test]
async fn rebinding_tears_down_the_previous_binding_first() {
    let transport = Arc::new(ScriptedTransport::new());
    let mut coordinator = SubscriptionCoordinator::new(transport.clone());

    coordinator.bind(&ChannelId::new("room-1")).await.expect("bind");
    coordinator.bind(&ChannelId::new("room-2")).await.expect("rebind");

    assert_eq!(
        transport.calls().await,
        vec![
            "add_listener",
            "subscribe:room-1",
            "remove_listener",
            "unsubscribe_all",
            "add_listener",
            "subscribe:room-2",
        ]
    );
    assert_eq!(transport.peak_listeners(), 1);

    coordinator.teardown().await;
    assert_eq!(coordinator.active_channel(), None);
    assert_eq!(transport.live_listeners().await, 0);
}

#[tokio::test]
async fn sink_emits_only_for_new_messages() {
    let timeline = Timeline::shared();
    let (sink, mut events) = sink_for("room-1", &timeline);
    let delivery = Delivery {
        channel: ChannelId::new("room-1"),
        payload: wire("m1", "hi"),
        delivery_token: BASE_TOKEN,
        publisher: "remote".to_string(),
    };

    sink.deliver(delivery.clone()).await;
    sink.deliver(delivery).await;
    sink.deliver(Delivery {
        channel: ChannelId::new("room-1"),
        payload: serde_json::json!({ "text": "no id" }),
        delivery_token: BASE_TOKEN + 1,
        publisher: "remote".to_string(),
    })
    .await;

    assert_eq!(timeline.lock().await.len(), 1);
    assert!(matches!(events.try_recv(), Ok(ClientEvent::MessageReceived(_))));
    assert!(events.try_recv().is_err());
}
