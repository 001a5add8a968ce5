// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbit_bus::{
    consumer_fn,
    listener::DeliveryHandling,
    message::HEADER_BREADCRUMBS,
    producer::SenderHandling,
    route::{Route, StaticRouteResolver},
    storage::{HeaderStorage, InMemoryHeaderStorage},
    transport::memory::InMemoryBroker,
    Bus, BusConfiguration, BusError, BusSettings, HeaderValue, Headers, Message, MessageLabel,
    ReceiverConfiguration, ReceiverOptions, RetryPolicy, SenderConfiguration, SenderOptions,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

fn settings(connection_string: &str) -> BusSettings {
    BusSettings::new("orders")
        .with_connection_string(connection_string)
        .with_timer_resolution(Duration::from_millis(50))
        .with_retry(RetryPolicy::new(Duration::from_millis(10), 10))
}

fn to_queue(queue: &str) -> SenderHandling {
    SenderHandling {
        resolver: Arc::new(StaticRouteResolver(Route::to_queue(queue))),
        ..SenderHandling::default()
    }
}

fn doubling_receiver(queue: &str) -> ReceiverConfiguration {
    ReceiverConfiguration::new(queue).consume(
        MessageLabel::new("calc"),
        consumer_fn(|delivery| async move {
            let num = delivery.payload()?["num"].as_i64().unwrap_or_default();
            delivery
                .reply_with(Message::new(MessageLabel::new("calc.result"), json!({"num": num * 2})))
                .await
        }),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_gets_its_response_through_the_bus() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("calc");
    let config = BusConfiguration::new(Arc::new(broker.clone()))
        .sender(
            SenderConfiguration::new(MessageLabel::new("calc"))
                .with_options(SenderOptions::default().with_callback(ReceiverOptions::callback()))
                .with_handling(to_queue("calc")),
        )
        .receiver(doubling_receiver("calc"));
    let bus = Bus::new(settings("mem://"), config).unwrap();
    bus.start().await.unwrap();

    let requests = (0..8).map(|num| {
        bus.request(
            MessageLabel::new("calc"),
            json!({ "num": num }),
            MessageLabel::new("calc.result"),
            Headers::default(),
        )
    });
    let responses = futures_util::future::join_all(requests).await;

    for (num, response) in responses.into_iter().enumerate() {
        let response = response.unwrap();
        assert_eq!(response.label, MessageLabel::new("calc.result"));
        assert_eq!(response.payload, json!({ "num": num as i64 * 2 }));
    }

    bus.stop().await;
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("calc");
    let config = BusConfiguration::new(Arc::new(broker.clone())).sender(
        SenderConfiguration::new(MessageLabel::new("calc"))
            .with_options(
                SenderOptions::default()
                    .with_callback(ReceiverOptions::callback())
                    .with_timeout(Duration::from_millis(150)),
            )
            .with_handling(to_queue("calc")),
    );
    let bus = Bus::new(settings("mem://"), config).unwrap();
    bus.start().await.unwrap();

    let result = bus
        .request(
            MessageLabel::new("calc"),
            json!({ "num": 1 }),
            MessageLabel::new("calc.result"),
            Headers::default(),
        )
        .await;

    match result {
        Err(BusError::AttemptsExhausted { attempts, errors }) => {
            assert_eq!(attempts, 1);
            assert!(matches!(errors.as_slice(), [BusError::Timeout(_)]));
        }
        other => panic!("unexpected result {:?}", other),
    }
    bus.stop().await;
}

#[tokio::test]
async fn sends_are_spread_over_every_broker_url() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("q");
    let config = BusConfiguration::new(Arc::new(broker.clone())).sender(
        SenderConfiguration::new(MessageLabel::new("boo"))
            .with_options(SenderOptions::default().with_confirmation())
            .with_handling(to_queue("q")),
    );
    let bus = Bus::new(settings("mem://a,mem://b"), config).unwrap();
    bus.start().await.unwrap();

    for num in 0..4 {
        bus.emit(MessageLabel::new("boo"), json!({ "num": num }), Headers::default())
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_depth("q"), 4);
    assert_eq!(broker.connection_count(), 2);

    broker.nack_publishes(true);
    match bus
        .emit(MessageLabel::new("boo"), json!({}), Headers::default())
        .await
    {
        Err(BusError::AttemptsExhausted { attempts, errors }) => {
            assert_eq!(attempts, 2);
            assert!(errors.iter().all(|err| matches!(err, BusError::Rejected(_))));
        }
        other => panic!("unexpected result {:?}", other),
    }

    bus.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incoming_headers_flow_into_outgoing_messages() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("in");
    broker.declare_queue("out");
    let storage: Arc<dyn HeaderStorage> = Arc::new(InMemoryHeaderStorage::new());

    let config = BusConfiguration::new(Arc::new(broker.clone()))
        .with_delivery_handling(DeliveryHandling {
            header_storage: storage.clone(),
            ..DeliveryHandling::default()
        })
        .sender(SenderConfiguration::new(MessageLabel::new("first")).with_handling(to_queue("in")))
        .sender(SenderConfiguration::new(MessageLabel::new("second")).with_handling(SenderHandling {
            header_storage: storage.clone(),
            ..to_queue("out")
        }))
        .receiver(ReceiverConfiguration::new("in").consume(
            MessageLabel::new("first"),
            consumer_fn(|_delivery| async move { Ok(()) }),
        ));
    let bus = Bus::new(settings("mem://"), config).unwrap();
    bus.start().await.unwrap();

    let mut headers = Headers::default();
    headers.insert(HEADER_BREADCRUMBS.to_owned(), HeaderValue::from("svc-a"));
    bus.emit(MessageLabel::new("first"), json!({}), headers).await.unwrap();

    for _ in 0..100 {
        if storage.load().contains_key(HEADER_BREADCRUMBS) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(storage.load().get(HEADER_BREADCRUMBS), Some(&HeaderValue::from("svc-a")));

    bus.emit(MessageLabel::new("second"), json!({}), Headers::default())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("out"), 1);

    bus.stop().await;
}
