use anyhow::Result;
use metalmq_runtime::broker::{ExchangeDeclareFlags, QueueDeclareFlags};
use metalmq_runtime::*;

use crate::helper;

fn declare_queue(conn: &mut Connection, name: &str) {
    conn.queue_declare(name, QueueDeclareFlags::empty(), None).unwrap();
}

fn body_of(conn: &mut Connection, queue: &str) -> Option<String> {
    conn.basic_get(queue, true)
        .unwrap()
        .map(|m| String::from_utf8_lossy(&m.message.body).into_owned())
}

#[test]
fn declare_and_delete_exchange() -> Result<()> {
    let (broker, mut conn) = helper::connect();

    conn.exchange_declare("x-new", ExchangeType::Direct, ExchangeDeclareFlags::empty(), None)?;
    assert!(broker.exchange_exists("x-new"));

    // passive declare of an existing exchange
    conn.exchange_declare("x-new", ExchangeType::Direct, ExchangeDeclareFlags::PASSIVE, None)?;

    conn.exchange_delete("x-new", false)?;
    assert!(!broker.exchange_exists("x-new"));

    conn.exchange_declare("x-new", ExchangeType::Fanout, ExchangeDeclareFlags::empty(), None)?;

    Ok(())
}

#[test]
fn declare_exchange_with_different_type() {
    let (_broker, mut conn) = helper::connect();

    conn.exchange_declare("x-conflict", ExchangeType::Direct, ExchangeDeclareFlags::empty(), None)
        .unwrap();

    let err = to_client_error(conn.exchange_declare(
        "x-conflict",
        ExchangeType::Fanout,
        ExchangeDeclareFlags::empty(),
        None,
    ));

    assert_eq!(err.kind, ErrorKind::ChannelFatal);
    assert_eq!(err.code, 406);
    assert_eq!(err.class_method, model::EXCHANGE_DECLARE);
    assert!(err.message.contains("inequivalent arg 'type'"));
}

#[test]
fn reserved_exchange_names() {
    let (_broker, mut conn) = helper::connect();

    let err = to_client_error(conn.exchange_declare(
        "amq.mine",
        ExchangeType::Topic,
        ExchangeDeclareFlags::empty(),
        None,
    ));
    assert_eq!(err.code, 403);

    let err = to_client_error(conn.exchange_delete("amq.direct", false));
    assert_eq!(err.code, 403);
}

#[test]
fn topic_routing() -> Result<()> {
    let (_broker, mut conn) = helper::connect();

    conn.exchange_declare("prices", ExchangeType::Topic, ExchangeDeclareFlags::empty(), None)?;
    declare_queue(&mut conn, "nwse");
    declare_queue(&mut conn, "all-goog");

    conn.queue_bind("nwse", "prices", "stocks.nwse.*", None)?;
    conn.queue_bind("all-goog", "prices", "#.goog", None)?;

    conn.basic_publish("prices", "stocks.nwse.goog", "1".into())?;
    conn.basic_publish("prices", "stocks.bse.goog", "2".into())?;
    conn.basic_publish("prices", "stocks.nwse.msft", "3".into())?;

    assert_eq!(body_of(&mut conn, "nwse").as_deref(), Some("1"));
    assert_eq!(body_of(&mut conn, "nwse").as_deref(), Some("3"));
    assert_eq!(body_of(&mut conn, "nwse"), None);

    assert_eq!(body_of(&mut conn, "all-goog").as_deref(), Some("1"));
    assert_eq!(body_of(&mut conn, "all-goog").as_deref(), Some("2"));

    conn.queue_unbind("nwse", "prices", "stocks.nwse.*", None)?;
    conn.basic_publish("prices", "stocks.nwse.goog", "4".into())?;

    assert_eq!(body_of(&mut conn, "nwse"), None);

    Ok(())
}

#[test]
fn fanout_through_exchange_binding() -> Result<()> {
    let (broker, mut conn) = helper::connect();

    conn.exchange_declare("events", ExchangeType::Direct, ExchangeDeclareFlags::empty(), None)?;
    conn.exchange_declare("audit", ExchangeType::Fanout, ExchangeDeclareFlags::empty(), None)?;
    declare_queue(&mut conn, "orders");
    declare_queue(&mut conn, "audit-log");

    conn.queue_bind("orders", "events", "order", None)?;
    conn.queue_bind("audit-log", "audit", "", None)?;
    conn.exchange_bind("audit", "events", "order", None)?;

    conn.basic_publish("events", "order", crate::message_from_string("order #1"))?;
    conn.basic_publish("events", "refund", crate::message_from_string("refund #1"))?;

    assert_eq!(broker.message_count("orders"), Some(1));
    assert_eq!(broker.message_count("audit-log"), Some(1));

    let err = to_client_error(conn.exchange_delete("audit", true));
    assert_eq!(err.code, 406);

    conn.exchange_unbind("audit", "events", "order", None)?;
    conn.basic_publish("events", "order", crate::message_from_string("order #2"))?;

    assert_eq!(broker.message_count("orders"), Some(2));
    assert_eq!(broker.message_count("audit-log"), Some(1));

    Ok(())
}

#[test]
fn headers_routing() -> Result<()> {
    let (_broker, mut conn) = helper::connect();

    let mut args = FieldTable::new();
    args.insert("x-match".to_string(), "any".into());
    args.insert("format".to_string(), "pdf".into());
    args.insert("type".to_string(), "report".into());

    declare_queue(&mut conn, "docs");
    conn.queue_bind("docs", "amq.headers", "", Some(args))?;

    conn.basic_publish("amq.headers", "", PublishedMessage::from("a").header("format", "pdf"))?;
    conn.basic_publish("amq.headers", "", PublishedMessage::from("b").header("format", "zip"))?;

    assert_eq!(body_of(&mut conn, "docs").as_deref(), Some("a"));
    assert_eq!(body_of(&mut conn, "docs"), None);

    Ok(())
}

#[test]
fn publish_to_missing_exchange() {
    let (_broker, mut conn) = helper::connect();

    let err = to_client_error(conn.basic_publish("nowhere", "", "lost".into()));

    assert_eq!(err.code, 404);
    assert!(err.message.starts_with("Failed to publish message. Server channel error: NOT_FOUND"));

    // unroutable messages are dropped silently
    conn.basic_publish("amq.direct", "no-binding", "dropped".into()).unwrap();
}

#[test]
fn internal_exchange_refuses_publish() {
    let (_broker, mut conn) = helper::connect();

    conn.exchange_declare("inner", ExchangeType::Fanout, ExchangeDeclareFlags::INTERNAL, None)
        .unwrap();

    let err = to_client_error(conn.basic_publish("inner", "", "x".into()));

    assert_eq!(err.code, 403);
}
