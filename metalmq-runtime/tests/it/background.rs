use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use metalmq_runtime::*;
use rand::Rng;

use crate::helper;

/// Run the pending tasks until `done` holds or nothing arrives for two seconds.
fn run_until(conn: &mut Connection, mut done: impl FnMut(&mut Connection) -> bool) {
    while !done(conn) {
        assert!(conn.run_pending_for(Duration::from_secs(2)) > 0, "no background task arrived");
    }
}

#[test]
fn callbacks_run_on_the_calling_thread() {
    let (broker, mut conn) = helper::connect();
    let threads = Arc::new(Mutex::new(vec![]));

    conn.queue_declare("bg", Default::default(), None).unwrap();

    let sink = threads.clone();
    let handle = conn
        .create_background_consumer("bg", ConsumerOptions::default(), move |_| {
            sink.lock().unwrap().push(thread::current().id());
            Ok(())
        })
        .unwrap();

    assert!(handle.is_background());
    assert_eq!(conn.background_consumer_tags(), vec![handle.consumer_tag().to_string()]);
    assert!(conn.consumer_tags().is_empty());

    // foreground and background have separate links
    assert_eq!(broker.connection_count(), 2);

    for i in 0..3 {
        helper::inject(&broker, "bg", &format!("bg {i}"));
    }

    run_until(&mut conn, |_| threads.lock().unwrap().len() == 3);

    let worker = conn.background_worker_id().unwrap();
    let me = thread::current().id();

    assert_ne!(worker, me);
    assert!(threads.lock().unwrap().iter().all(|id| *id == me));
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.message_count("bg"), Some(0));
}

#[test]
fn server_cancel_is_reported_as_warning() {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("q", Default::default(), None).unwrap();
    conn.create_background_consumer("q", ConsumerOptions::default().consumer_tag("x"), |_| Ok(()))
        .unwrap();

    assert!(broker.cancel_consumer("x"));

    run_until(&mut conn, |c| !c.warnings().is_empty());

    let warnings = conn.take_warnings();

    assert_eq!(warnings, vec!["Consumer 'x' was cancelled by the server."]);
    assert_eq!(broker.consumer_count("q"), Some(0));
}

#[test]
fn closed_channel_stops_only_that_consumer() {
    let (broker, mut conn) = helper::connect();
    let (bodies, callback) = helper::collector();

    conn.queue_declare("a", Default::default(), None).unwrap();
    conn.queue_declare("b", Default::default(), None).unwrap();

    conn.create_background_consumer("a", ConsumerOptions::default().consumer_tag("tag"), |_| Ok(()))
        .unwrap();
    conn.create_background_consumer("b", ConsumerOptions::default(), callback)
        .unwrap();

    assert!(broker.close_consumer_channel("tag", 406, "PRECONDITION_FAILED - delivery acknowledgement timed out"));

    run_until(&mut conn, |c| !c.warnings().is_empty());

    assert_eq!(
        conn.take_warnings(),
        vec![
            "Background consumer 'tag' stopped. Server channel error: \
             PRECONDITION_FAILED - delivery acknowledgement timed out. Open a new channel."
        ]
    );

    helper::inject(&broker, "b", "still here");

    run_until(&mut conn, |_| bodies.lock().unwrap().len() == 1);

    assert_eq!(broker.connection_count(), 2);
}

#[test]
fn destroy_background_consumer_twice() {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("q", Default::default(), None).unwrap();

    let handle = conn
        .create_background_consumer("q", ConsumerOptions::default(), |_| Ok(()))
        .unwrap();

    assert_eq!(broker.consumer_count("q"), Some(1));

    conn.destroy_background_consumer(&handle);
    conn.destroy_background_consumer(&handle);

    assert_eq!(broker.consumer_count("q"), Some(0));
    assert!(conn.background_consumer_tags().is_empty());

    // deliveries of a destroyed consumer are not run
    helper::inject(&broker, "q", "nobody");
    assert_eq!(conn.run_pending_for(Duration::from_millis(300)), 0);
}

#[test]
fn recreated_tag_does_not_get_the_queued_deliveries() {
    let (broker, mut conn) = helper::connect();
    let seen = Arc::new(Mutex::new(vec![]));

    conn.queue_declare("q", Default::default(), None).unwrap();

    let old = conn
        .create_background_consumer("q", ConsumerOptions::default().consumer_tag("t"), |_| Ok(()))
        .unwrap();

    for i in 0..3 {
        helper::inject(&broker, "q", &format!("m{i}"));
    }

    // let the worker queue the deliveries without running them
    thread::sleep(Duration::from_millis(300));

    conn.destroy_background_consumer(&old);

    let sink = seen.clone();
    let new = conn
        .create_background_consumer("q", ConsumerOptions::default().consumer_tag("t"), move |msg| {
            sink.lock()
                .unwrap()
                .push((msg.text().into_owned(), msg.redelivered, msg.message.channel));
            Ok(())
        })
        .unwrap();

    assert_ne!(new.channel(), old.channel());

    run_until(&mut conn, |_| seen.lock().unwrap().len() == 3);
    conn.run_pending_for(Duration::from_millis(300));

    let seen = seen.lock().unwrap().clone();

    assert_eq!(
        seen,
        vec![
            ("m0".to_string(), true, new.channel()),
            ("m1".to_string(), true, new.channel()),
            ("m2".to_string(), true, new.channel()),
        ]
    );
    assert!(conn.take_warnings().is_empty());
    assert_eq!(conn.background_consumer_tags(), vec!["t".to_string()]);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.message_count("q"), Some(0));
}

#[test]
fn background_consumer_of_missing_queue() {
    let (_broker, mut conn) = helper::connect();

    let err = to_client_error(conn.create_background_consumer("missing", ConsumerOptions::default(), |_| Ok(())));

    assert_eq!(err.kind, ErrorKind::ChannelFatal);
    assert_eq!(err.code, 404);
    assert!(conn.background_consumer_tags().is_empty());
}

#[test]
fn destroy_background_closes_the_link() {
    let (broker, mut conn) = helper::connect();

    conn.init_background().unwrap();
    assert_eq!(broker.connection_count(), 2);

    conn.destroy_background();

    assert_eq!(broker.connection_count(), 1);
    assert!(conn.background_worker_id().is_none());
    assert_eq!(conn.run_pending(), 0);

    conn.init_background().unwrap();

    drop(conn);

    assert_eq!(broker.connection_count(), 0);
}

#[test]
fn many_consumers_with_a_busy_publisher() {
    let (broker, mut conn) = helper::connect();
    let received = Arc::new(AtomicUsize::new(0));
    let total = 500;

    conn.queue_declare("work", Default::default(), None).unwrap();

    let mut handles = vec![];
    for i in 0..50 {
        let received = received.clone();
        let handle = conn
            .create_background_consumer(
                "work",
                ConsumerOptions::default().consumer_tag(&format!("w-{i}")).prefetch_count(5),
                move |_| {
                    received.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();

        handles.push(handle);
    }

    let publisher = {
        let broker = broker.clone();

        thread::spawn(move || {
            let mut rng = rand::thread_rng();

            for i in 0..total {
                let content = Content {
                    body: format!("work {i}").into(),
                    ..Default::default()
                };

                broker.publish("", "work", content);

                if rng.gen_bool(0.1) {
                    thread::sleep(Duration::from_millis(rng.gen_range(1..5)));
                }
            }
        })
    };

    // destroy some consumers while the messages flow
    for h in handles.iter().skip(1).step_by(3) {
        conn.run_pending();
        conn.destroy_background_consumer(h);
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    while received.load(Ordering::SeqCst) < total {
        assert!(Instant::now() < deadline, "got {} of {total}", received.load(Ordering::SeqCst));

        conn.run_pending_for(Duration::from_millis(200));
    }

    publisher.join().unwrap();

    assert_eq!(received.load(Ordering::SeqCst), total);
    assert_eq!(conn.background_consumer_tags().len(), 50 - 17);
    assert_eq!(broker.message_count("work"), Some(0));
    assert_eq!(broker.unacked_count(), 0);
    assert!(conn.take_warnings().is_empty());
}
