use std::collections::VecDeque;

use bytes::Bytes;

use crate::message::MessageProperties;
use crate::model::ChannelNumber;

pub(crate) type ConnId = u64;

/// A message sitting in a queue or waiting for an ack.
#[derive(Clone, Debug)]
pub(crate) struct StoredMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) properties: MessageProperties,
    pub(crate) body: Bytes,
    pub(crate) redelivered: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct QueueConsumer {
    pub(crate) tag: String,
    pub(crate) conn: ConnId,
    pub(crate) channel: ChannelNumber,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
}

#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    /// The connection which declared the queue exclusive.
    pub(crate) owner: Option<ConnId>,
    pub(crate) messages: VecDeque<StoredMessage>,
    pub(crate) consumers: Vec<QueueConsumer>,
    /// Index of the consumer which gets the next message.
    next_consumer: usize,
    /// Auto delete queues are deleted when the last consumer leaves, but only if there were any.
    pub(crate) had_consumers: bool,
}

impl Queue {
    pub(crate) fn new(durable: bool, auto_delete: bool, owner: Option<ConnId>) -> Self {
        Queue {
            durable,
            auto_delete,
            owner,
            messages: VecDeque::new(),
            consumers: vec![],
            next_consumer: 0,
            had_consumers: false,
        }
    }

    pub(crate) fn add_consumer(&mut self, consumer: QueueConsumer) {
        self.consumers.push(consumer);
        self.had_consumers = true;
    }

    pub(crate) fn remove_consumer(&mut self, conn: ConnId, tag: &str) -> Option<QueueConsumer> {
        let pos = self.consumers.iter().position(|c| c.conn == conn && c.tag == tag)?;

        if pos < self.next_consumer {
            self.next_consumer -= 1;
        }

        Some(self.consumers.remove(pos))
    }

    /// Remove the consumers matching `pred` and return them.
    pub(crate) fn remove_consumers_where<F: Fn(&QueueConsumer) -> bool>(&mut self, pred: F) -> Vec<QueueConsumer> {
        let mut removed = vec![];
        let mut i = 0;

        while i < self.consumers.len() {
            if pred(&self.consumers[i]) {
                if i < self.next_consumer {
                    self.next_consumer -= 1;
                }

                removed.push(self.consumers.remove(i));
            } else {
                i += 1;
            }
        }

        removed
    }

    pub(crate) fn has_exclusive_consumer(&self) -> bool {
        self.consumers.iter().any(|c| c.exclusive)
    }

    /// Choose the next consumer in round-robin order among the ones `can_take` accepts.
    pub(crate) fn next_consumer<F: Fn(&QueueConsumer) -> bool>(&mut self, can_take: F) -> Option<QueueConsumer> {
        let n = self.consumers.len();

        for step in 0..n {
            let index = (self.next_consumer + step) % n;

            if can_take(&self.consumers[index]) {
                self.next_consumer = (index + 1) % n;

                return Some(self.consumers[index].clone());
            }
        }

        None
    }

    /// Put back a message which was delivered but not acked, it keeps its place at the head.
    pub(crate) fn requeue(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.messages.push_front(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(tag: &str) -> QueueConsumer {
        QueueConsumer {
            tag: tag.to_string(),
            conn: 1,
            channel: 1,
            no_ack: false,
            exclusive: false,
        }
    }

    #[test]
    fn round_robin_skips_busy_consumers() {
        let mut queue = Queue::new(false, false, None);

        queue.add_consumer(consumer("a"));
        queue.add_consumer(consumer("b"));
        queue.add_consumer(consumer("c"));

        let picked: Vec<String> = (0..4).filter_map(|_| queue.next_consumer(|c| c.tag != "b")).map(|c| c.tag).collect();

        assert_eq!(picked, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn removing_consumer_keeps_the_turn() {
        let mut queue = Queue::new(false, false, None);

        queue.add_consumer(consumer("a"));
        queue.add_consumer(consumer("b"));
        queue.add_consumer(consumer("c"));

        assert_eq!(queue.next_consumer(|_| true).unwrap().tag, "a");

        queue.remove_consumer(1, "a");

        assert_eq!(queue.next_consumer(|_| true).unwrap().tag, "b");
        assert!(queue.had_consumers);
    }
}
