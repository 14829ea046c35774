use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use metalmq_runtime::*;
use tokio_util::sync::CancellationToken;

use crate::helper;

#[test]
fn listen_needs_a_consumer() {
    let (_broker, mut conn) = helper::connect();

    let err = to_client_error(conn.listen(Duration::from_secs(1)));

    assert_eq!(err.kind, ErrorKind::OperationFailed);
    assert_eq!(err.message, "No consumers are declared on this connection.");
}

#[test]
fn listen_returns_after_max_wait() {
    let (_broker, mut conn) = helper::connect();

    conn.queue_declare("silent", Default::default(), None).unwrap();
    conn.create_consumer("silent", ConsumerOptions::default(), |_| Ok(()))
        .unwrap();

    let start = Instant::now();
    let stop = conn.listen(Duration::from_secs(2)).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(stop, ListenStop::Elapsed);
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
}

#[test]
fn listen_can_be_interrupted() {
    let (_broker, mut conn) = helper::connect();
    let token = CancellationToken::new();

    conn.queue_declare("q", Default::default(), None).unwrap();
    conn.create_consumer("q", ConsumerOptions::default(), |_| Ok(())).unwrap();

    let canceller = {
        let token = token.clone();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            token.cancel();
        })
    };

    let start = Instant::now();
    let stop = conn.listen_until(Duration::from_secs(30), &token).unwrap();

    canceller.join().unwrap();

    assert_eq!(stop, ListenStop::Interrupted);
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(conn.is_connected());
    assert_eq!(conn.consumer_tags().len(), 1);
}

#[test]
fn deliveries_are_acked_after_the_callback() {
    let (broker, mut conn) = helper::connect();
    let (bodies, callback) = helper::collector();

    conn.queue_declare("jobs", Default::default(), None).unwrap();

    for i in 0..5 {
        conn.basic_publish("", "jobs", crate::message_from_string(&format!("job {i}")))
            .unwrap();
    }

    let handle = conn
        .create_consumer("jobs", ConsumerOptions::default().prefetch_count(2), callback)
        .unwrap();

    assert!(handle.consumer_tag().starts_with("amq.ctag-"));
    assert!(!handle.is_background());

    conn.listen(Duration::from_secs(1)).unwrap();

    let expected: Vec<String> = (0..5).map(|i| format!("job {i}")).collect();

    assert_eq!(*bodies.lock().unwrap(), expected);
    assert_eq!(broker.message_count("jobs"), Some(0));
    assert_eq!(broker.unacked_count(), 0);
}

#[test]
fn failed_callback_requeues_the_message() {
    let (broker, mut conn) = helper::connect();
    let seen = Arc::new(Mutex::new(vec![]));

    conn.queue_declare("flaky", Default::default(), None).unwrap();
    helper::inject(&broker, "flaky", "payload");

    let sink = seen.clone();
    conn.create_consumer("flaky", ConsumerOptions::default(), move |msg| {
        let attempt = {
            let mut seen = sink.lock().unwrap();
            seen.push(msg.redelivered);
            seen.len()
        };

        match attempt {
            1 => Err(anyhow!("not now")),
            2 => panic!("still not"),
            _ => Ok(()),
        }
    })
    .unwrap();

    conn.listen(Duration::from_secs(1)).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![false, true, true]);
    assert_eq!(broker.message_count("flaky"), Some(0));
    assert_eq!(broker.unacked_count(), 0);
}

#[test]
fn auto_ack_consumer_is_not_acked() {
    let (broker, mut conn) = helper::connect();
    let (bodies, callback) = helper::collector();

    conn.queue_declare("auto", Default::default(), None).unwrap();
    helper::inject(&broker, "auto", "fire and forget");

    conn.create_consumer("auto", ConsumerOptions::default().ack_mode(AckMode::Auto), callback)
        .unwrap();
    conn.listen(Duration::from_secs(1)).unwrap();

    assert_eq!(bodies.lock().unwrap().len(), 1);
    assert_eq!(broker.unacked_count(), 0);
}

#[test]
fn cancelled_consumer_does_not_affect_the_others() {
    let (broker, mut conn) = helper::connect();
    let (bodies, callback) = helper::collector();

    conn.queue_declare("a", Default::default(), None).unwrap();
    conn.queue_declare("b", Default::default(), None).unwrap();

    conn.create_consumer("a", ConsumerOptions::default().consumer_tag("T"), |_| Ok(()))
        .unwrap();
    conn.create_consumer("b", ConsumerOptions::default().consumer_tag("U"), callback)
        .unwrap();

    assert!(broker.cancel_consumer("T"));

    let err = to_client_error(conn.listen(Duration::from_secs(2)));

    assert_eq!(err.kind, ErrorKind::ConsumerFatal);
    assert_eq!(err.consumer_tag.as_deref(), Some("T"));
    assert_eq!(err.message, "Consumer 'T' was cancelled by the server.");
    assert!(conn.is_connected());

    helper::inject(&broker, "a", "nobody");
    helper::inject(&broker, "b", "for U");

    conn.listen(Duration::from_secs(1)).unwrap();

    assert_eq!(*bodies.lock().unwrap(), vec!["for U"]);
    assert_eq!(broker.message_count("a"), Some(1));
    assert_eq!(conn.consumer_tags(), vec!["T", "U"]);
}

#[test]
fn closed_consumer_channel_is_channel_fatal() {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("q", Default::default(), None).unwrap();
    let handle = conn
        .create_consumer("q", ConsumerOptions::default().consumer_tag("ctag"), |_| Ok(()))
        .unwrap();

    broker.close_consumer_channel("ctag", 406, "PRECONDITION_FAILED - delivery acknowledgement timed out");

    let err = to_client_error(conn.listen(Duration::from_secs(2)));

    assert_eq!(err.kind, ErrorKind::ChannelFatal);
    assert_eq!(err.channel, Some(handle.channel()));
    assert_eq!(err.code, 406);
    assert_eq!(err.consumer_tag.as_deref(), Some("ctag"));
    assert_eq!(
        err.message,
        "Failed to consume messages. Server channel error: \
         PRECONDITION_FAILED - delivery acknowledgement timed out. Open a new channel."
    );

    // the default channel is not affected
    conn.queue_declare("other", Default::default(), None).unwrap();
}

#[test]
fn server_closing_the_connection_stops_listen() {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("q", Default::default(), None).unwrap();
    conn.create_consumer("q", ConsumerOptions::default(), |_| Ok(())).unwrap();

    broker.close_connections(320, "CONNECTION_FORCED - broker forced connection closure");

    let err = to_client_error(conn.listen(Duration::from_secs(2)));

    assert_eq!(err.kind, ErrorKind::ConnectionFatal);
    assert_eq!(err.code, 320);
    assert!(err.message.ends_with("Disconnected."));
    assert!(!conn.is_connected());
}

#[test]
fn destroy_consumer_twice() {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("q", Default::default(), None).unwrap();

    let first = conn.create_consumer("q", ConsumerOptions::default(), |_| Ok(())).unwrap();
    let second = conn.create_consumer("q", ConsumerOptions::default(), |_| Ok(())).unwrap();

    assert_ne!(first.channel(), second.channel());
    assert_eq!(broker.consumer_count("q"), Some(2));

    conn.destroy_consumer(&first);
    conn.destroy_consumer(&first);

    assert_eq!(broker.consumer_count("q"), Some(1));
    assert_eq!(conn.consumer_tags(), vec![second.consumer_tag().to_string()]);
}

#[test]
fn consumer_of_missing_queue() {
    let (_broker, mut conn) = helper::connect();

    let err = to_client_error(conn.create_consumer("missing", ConsumerOptions::default(), |_| Ok(())));

    assert_eq!(err.kind, ErrorKind::ChannelFatal);
    assert_eq!(err.code, 404);
    assert!(err.message.starts_with("Failed to start a queue consumer."));
    assert!(conn.consumer_tags().is_empty());
}
