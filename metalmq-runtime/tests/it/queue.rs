use std::sync::Arc;

use anyhow::Result;
use metalmq_runtime::broker::QueueDeclareFlags;
use metalmq_runtime::*;

use crate::helper;

#[test]
fn server_named_queue() -> Result<()> {
    let (broker, mut conn) = helper::connect();

    let ok = conn.queue_declare("", QueueDeclareFlags::EXCLUSIVE, None)?;

    assert!(ok.queue.starts_with("amq.gen-"));
    assert_eq!(ok.message_count, 0);
    assert!(broker.queue_exists(&ok.queue));

    conn.disconnect()?;

    // exclusive queues go away with their connection
    assert!(!broker.queue_exists(&ok.queue));

    Ok(())
}

#[test]
fn redeclare_reports_counts() -> Result<()> {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("counted", QueueDeclareFlags::DURABLE, None)?;
    helper::inject(&broker, "counted", "1");
    helper::inject(&broker, "counted", "2");

    let ok = conn.queue_declare("counted", QueueDeclareFlags::DURABLE, None)?;
    assert_eq!(ok.message_count, 2);
    assert_eq!(ok.consumer_count, 0);

    let passive = conn.queue_declare("counted", QueueDeclareFlags::PASSIVE, None)?;
    assert_eq!(passive.message_count, 2);

    Ok(())
}

#[test]
fn passive_declare_of_missing_queue() {
    let (_broker, mut conn) = helper::connect();

    let err = to_client_error(conn.queue_declare("nope", QueueDeclareFlags::PASSIVE, None));

    assert_eq!(err.kind, ErrorKind::ChannelFatal);
    assert_eq!(err.code, 404);
    assert_eq!(err.class_method, model::QUEUE_DECLARE);
    assert_eq!(
        err.message,
        "Failed to declare queue. Server channel error: NOT_FOUND - no queue 'nope' in vhost '/'. Open a new channel."
    );

    // the channel is reopened transparently
    conn.queue_declare("nope", QueueDeclareFlags::empty(), None).unwrap();
}

#[test]
fn inequivalent_redeclare() {
    let (_broker, mut conn) = helper::connect();

    conn.queue_declare("q", QueueDeclareFlags::empty(), None).unwrap();

    let err = to_client_error(conn.queue_declare("q", QueueDeclareFlags::AUTO_DELETE, None));

    assert_eq!(err.code, 406);
    assert!(err.message.contains("inequivalent arg 'auto_delete'"));
}

#[test]
fn exclusive_queue_of_other_connection() {
    let (broker, mut owner) = helper::connect();
    let mut other = Connection::connect(ConnectionConfig::default(), Arc::new(broker.clone())).unwrap();

    owner.queue_declare("mine", QueueDeclareFlags::EXCLUSIVE, None).unwrap();

    let err = to_client_error(other.queue_purge("mine"));

    assert_eq!(err.code, 405);
    assert_eq!(err.kind, ErrorKind::ChannelFatal);
}

#[test]
fn purge_and_delete() -> Result<()> {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("trash", QueueDeclareFlags::empty(), None)?;

    for i in 0..3 {
        helper::inject(&broker, "trash", &i.to_string());
    }

    let err = to_client_error(conn.queue_delete("trash", false, true));
    assert_eq!(err.code, 406);

    assert_eq!(conn.queue_purge("trash")?, 3);

    helper::inject(&broker, "trash", "late");

    assert_eq!(conn.queue_delete("trash", true, false)?, 1);
    assert!(!broker.queue_exists("trash"));

    Ok(())
}

#[test]
fn delete_queue_in_use() {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("busy", QueueDeclareFlags::empty(), None).unwrap();
    conn.create_consumer("busy", ConsumerOptions::default(), |_| Ok(())).unwrap();

    let err = to_client_error(conn.queue_delete("busy", true, false));

    assert_eq!(err.code, 406);
    assert!(err.message.contains("in use"));
    assert_eq!(broker.consumer_count("busy"), Some(1));
}

#[test]
fn auto_delete_queue_goes_with_its_last_consumer() {
    let (broker, mut conn) = helper::connect();

    conn.queue_declare("temp", QueueDeclareFlags::AUTO_DELETE, None).unwrap();

    let handle = conn.create_consumer("temp", ConsumerOptions::default(), |_| Ok(())).unwrap();
    assert!(broker.queue_exists("temp"));

    conn.destroy_consumer(&handle);

    assert!(!broker.queue_exists("temp"));
}
