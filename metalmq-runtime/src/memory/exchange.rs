//! Exchanges and their bindings.
//!
//! A binding points either to a queue or to another exchange. Routing follows exchange to exchange
//! bindings transitively, every queue gets a message at most once.
use std::collections::{HashMap, HashSet};

use crate::model::{ExchangeType, FieldTable, FieldValue};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Destination {
    Queue(String),
    Exchange(String),
}

#[derive(Clone, Debug)]
pub(crate) struct Binding {
    pub(crate) destination: Destination,
    pub(crate) routing_key: String,
    pub(crate) args: Option<FieldTable>,
}

#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) exchange_type: ExchangeType,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) bindings: Vec<Binding>,
}

impl Exchange {
    pub(crate) fn new(exchange_type: ExchangeType) -> Self {
        Exchange {
            exchange_type,
            durable: false,
            auto_delete: false,
            internal: false,
            bindings: vec![],
        }
    }

    /// Add a binding, the same binding is stored once.
    pub(crate) fn bind(&mut self, binding: Binding) {
        let exists = self
            .bindings
            .iter()
            .any(|b| b.destination == binding.destination && b.routing_key == binding.routing_key);

        if !exists {
            self.bindings.push(binding);
        }
    }

    pub(crate) fn unbind(&mut self, destination: &Destination, routing_key: &str) {
        self.bindings
            .retain(|b| !(&b.destination == destination && b.routing_key == routing_key));
    }

    pub(crate) fn remove_destination(&mut self, destination: &Destination) {
        self.bindings.retain(|b| &b.destination != destination);
    }

    /// The destinations this exchange routes a message to.
    fn matching(&self, routing_key: &str, headers: Option<&FieldTable>) -> Vec<&Destination> {
        self.bindings
            .iter()
            .filter(|b| match self.exchange_type {
                ExchangeType::Direct => b.routing_key == routing_key,
                ExchangeType::Fanout => true,
                ExchangeType::Topic => match_routing_key(&b.routing_key, routing_key),
                ExchangeType::Headers => match_headers(b.args.as_ref(), headers),
            })
            .map(|b| &b.destination)
            .collect()
    }
}

/// Collect the queues a message published to `exchange` reaches.
pub(crate) fn route(
    exchanges: &HashMap<String, Exchange>,
    exchange: &str,
    routing_key: &str,
    headers: Option<&FieldTable>,
) -> Vec<String> {
    let mut queues = vec![];
    let mut seen_queues = HashSet::new();
    let mut visited = HashSet::new();
    let mut pending = vec![exchange.to_string()];

    while let Some(name) = pending.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }

        let Some(ex) = exchanges.get(&name) else {
            continue;
        };

        for destination in ex.matching(routing_key, headers) {
            match destination {
                Destination::Queue(q) => {
                    if seen_queues.insert(q.clone()) {
                        queues.push(q.clone());
                    }
                }
                Destination::Exchange(e) => pending.push(e.clone()),
            }
        }
    }

    queues
}

/// Match a topic binding key to a routing key. `*` matches exactly one segment, `#` matches zero
/// or more segments.
pub(crate) fn match_routing_key(binding_key: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = binding_key.split('.').collect();
    let words: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };

    match_segments(&pattern, &words)
}

fn match_segments(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_segments(rest, &words[skip..])),
        Some((&p, rest)) => match words.split_first() {
            Some((&w, words_rest)) if p == "*" || p == w => match_segments(rest, words_rest),
            _ => false,
        },
    }
}

/// Headers binding. `x-match` is `all` (default) or `any`, the `x-` arguments are not compared.
fn match_headers(binding: Option<&FieldTable>, headers: Option<&FieldTable>) -> bool {
    let Some(binding) = binding else {
        return true;
    };

    let match_all = !matches!(binding.get("x-match"), Some(FieldValue::LongString(s)) if s == "any");
    let empty = FieldTable::new();
    let headers = headers.unwrap_or(&empty);

    let mut expected = binding.iter().filter(|(k, _)| !k.starts_with("x-")).peekable();

    if expected.peek().is_none() {
        return true;
    }

    let hit = |(k, v): (&String, &FieldValue)| match v {
        FieldValue::Void => headers.contains_key(k),
        _ => headers.get(k) == Some(v),
    };

    if match_all {
        expected.all(|e| hit(e))
    } else {
        expected.any(|e| hit(e))
    }
}
