use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use metalmq_runtime::memory::MemoryBroker;
use metalmq_runtime::{Connection, ConnectionConfig, ConsumerOptions, Content};

fn main() -> Result<()> {
    metalmq_runtime::setup_logger();

    let broker = MemoryBroker::new();
    broker.declare_queue("work");

    let mut conn = Connection::connect(ConnectionConfig::default(), Arc::new(broker.clone()))?;

    for i in 0..3 {
        conn.create_background_consumer(
            "work",
            ConsumerOptions::default().consumer_tag(&format!("worker-{i}")),
            move |msg| {
                println!("worker-{i} got {}", msg.text());

                Ok(())
            },
        )?;
    }

    let publisher = thread::spawn(move || {
        for i in 0..20 {
            let content = Content {
                body: format!("job {i}").into(),
                ..Default::default()
            };

            broker.publish("", "work", content);
            thread::sleep(Duration::from_millis(20));
        }
    });

    while conn.run_pending_for(Duration::from_secs(1)) > 0 {}

    if publisher.join().is_err() {
        anyhow::bail!("Publisher thread panicked");
    }

    for warning in conn.take_warnings() {
        println!("Warning: {warning}");
    }

    conn.destroy_background();
    conn.disconnect()?;

    Ok(())
}
