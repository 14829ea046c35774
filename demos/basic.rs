use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metalmq_runtime::broker::{ExchangeDeclareFlags, QueueDeclareFlags};
use metalmq_runtime::memory::MemoryBroker;
use metalmq_runtime::{Connection, ConnectionConfig, ConsumerOptions, ExchangeType, PublishedMessage};

fn main() -> Result<()> {
    let exchange = "test-xchg";
    let queue = "test-queue";

    metalmq_runtime::setup_logger();

    let broker = MemoryBroker::new();
    let mut conn = Connection::connect(ConnectionConfig::default(), Arc::new(broker))?;

    conn.exchange_declare(exchange, ExchangeType::Fanout, ExchangeDeclareFlags::empty(), None)?;
    conn.queue_declare(queue, QueueDeclareFlags::empty(), None)?;
    conn.queue_bind(queue, exchange, "", None)?;

    for i in 0..5 {
        let message = PublishedMessage::default().text(&format!("Hey man #{i}"));

        conn.basic_publish(exchange, "no-key", message)?;
    }

    if let Some(first) = conn.basic_get(queue, false)? {
        println!("Got {} ({} more)", String::from_utf8_lossy(&first.message.body), first.message_count);

        conn.basic_ack(first.delivery_tag, false)?;
    }

    conn.create_consumer(queue, ConsumerOptions::default(), |msg| {
        println!("Consumed {}", msg.text());

        Ok(())
    })?;

    let stop = conn.listen(Duration::from_secs(1))?;
    println!("Listen returned {stop:?}");

    conn.disconnect()?;

    Ok(())
}
