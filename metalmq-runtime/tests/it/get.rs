use anyhow::Result;
use metalmq_runtime::broker::QueueDeclareFlags;
use metalmq_runtime::*;

use crate::helper;

fn prepare(conn: &mut Connection) {
    conn.queue_declare("q-get", QueueDeclareFlags::empty(), None).unwrap();

    for i in 1..=3 {
        conn.basic_publish("", "q-get", crate::message_from_string(&format!("Get #{i}")))
            .unwrap();
    }
}

#[test]
fn get_with_ack() -> Result<()> {
    let (broker, mut conn) = helper::connect();

    prepare(&mut conn);

    let gm = conn.basic_get("q-get", false)?.unwrap();

    assert!(!gm.redelivered);
    assert_eq!(gm.exchange, "");
    assert_eq!(gm.routing_key, "q-get");
    assert_eq!(&gm.message.body[..], b"Get #1");
    assert_eq!(gm.message_count, 2);
    assert_eq!(gm.message.properties.app_id.as_deref(), Some("metalmq-runtime-test"));

    assert_eq!(broker.unacked_count(), 1);

    conn.basic_ack(gm.delivery_tag, false)?;

    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.message_count("q-get"), Some(2));

    Ok(())
}

#[test]
fn nack_and_reject() -> Result<()> {
    let (broker, mut conn) = helper::connect();

    prepare(&mut conn);

    let first = conn.basic_get("q-get", false)?.unwrap();
    conn.basic_nack(first.delivery_tag, false, true)?;

    let again = conn.basic_get("q-get", false)?.unwrap();
    assert!(again.redelivered);
    assert_eq!(&again.message.body[..], b"Get #1");

    conn.basic_reject(again.delivery_tag, false)?;

    let second = conn.basic_get("q-get", false)?.unwrap();
    let third = conn.basic_get("q-get", false)?.unwrap();

    assert_eq!(&second.message.body[..], b"Get #2");
    assert_eq!(third.message_count, 0);

    // ack both with one call
    conn.basic_ack(third.delivery_tag, true)?;

    assert_eq!(broker.unacked_count(), 0);
    assert!(conn.basic_get("q-get", true)?.is_none());

    Ok(())
}

#[test]
fn ack_of_unknown_delivery_tag() {
    let (_broker, mut conn) = helper::connect();

    prepare(&mut conn);

    let err = to_client_error(conn.basic_ack(42, false));

    assert_eq!(err.kind, ErrorKind::ChannelFatal);
    assert_eq!(err.code, 406);
    assert_eq!(err.class_method, model::BASIC_ACK);
    assert!(conn.is_connected());
}
