use std::sync::{Arc, Mutex};

use metalmq_runtime::memory::MemoryBroker;
use metalmq_runtime::{setup_logger, Connection, ConnectionConfig, Content, DeliveredMessage};

pub fn connect() -> (MemoryBroker, Connection) {
    setup_logger();

    let broker = MemoryBroker::new();
    let conn = Connection::connect(ConnectionConfig::default(), Arc::new(broker.clone())).unwrap();

    (broker, conn)
}

/// Publish from the server side to the queue by its name.
pub fn inject(broker: &MemoryBroker, queue: &str, body: &str) {
    let content = Content {
        body: body.to_string().into(),
        ..Default::default()
    };

    assert_eq!(broker.publish("", queue, content), 1, "queue {queue} doesn't exist");
}

/// A callback which stores the bodies it gets.
#[allow(dead_code)]
pub fn collector() -> (
    Arc<Mutex<Vec<String>>>,
    impl FnMut(&DeliveredMessage) -> anyhow::Result<()> + Send + 'static,
) {
    let bodies = Arc::new(Mutex::new(vec![]));
    let sink = bodies.clone();

    let callback = move |msg: &DeliveredMessage| {
        sink.lock().unwrap().push(msg.text().into_owned());
        Ok(())
    };

    (bodies, callback)
}
