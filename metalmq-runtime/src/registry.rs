//! Ordered set of consumers of one connection, keyed by consumer tag.
//!
//! Entries live in an arena and are chained in insertion order with index links, so removing an
//! entry from the middle is O(1) and iteration follows registration order. Removed slots are
//! reused, a generation counter makes the keys of removed entries stale.
use std::collections::HashMap;

/// Stable handle of a registry entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node<T> {
    tag: String,
    prev: Option<u32>,
    next: Option<u32>,
    value: T,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

#[derive(Debug)]
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    by_tag: HashMap<String, u32>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            slots: vec![],
            free: vec![],
            head: None,
            tail: None,
            by_tag: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// Append an entry to the end. If the tag is already registered the value is given back.
    pub fn insert(&mut self, tag: &str, value: T) -> Result<SlotKey, T> {
        if self.by_tag.contains_key(tag) {
            return Err(value);
        }

        let node = Node {
            tag: tag.to_string(),
            prev: self.tail,
            next: None,
            value,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        };

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }

        self.tail = Some(index);
        self.by_tag.insert(tag.to_string(), index);

        Ok(SlotKey {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Unlink and return an entry. A stale key gives `None`, so removing twice is harmless.
    pub fn remove(&mut self, key: SlotKey) -> Option<(String, T)> {
        let slot = self.slots.get_mut(key.index as usize)?;

        if slot.generation != key.generation {
            return None;
        }

        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }

        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }

        self.by_tag.remove(&node.tag);

        Some((node.tag, node.value))
    }

    pub fn remove_by_tag(&mut self, tag: &str) -> Option<T> {
        let key = self.key_of(tag)?;

        self.remove(key).map(|(_, value)| value)
    }

    pub fn key_of(&self, tag: &str) -> Option<SlotKey> {
        let index = *self.by_tag.get(tag)?;

        Some(SlotKey {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;

        if slot.generation != key.generation {
            return None;
        }

        slot.node.as_ref().map(|n| &n.value)
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;

        if slot.generation != key.generation {
            return None;
        }

        slot.node.as_mut().map(|n| &mut n.value)
    }

    /// Exact match lookup by consumer tag.
    pub fn find(&self, tag: &str) -> Option<&T> {
        let index = *self.by_tag.get(tag)?;

        self.slots[index as usize].node.as_ref().map(|n| &n.value)
    }

    pub fn find_mut(&mut self, tag: &str) -> Option<&mut T> {
        let index = *self.by_tag.get(tag)?;

        self.slots[index as usize].node.as_mut().map(|n| &mut n.value)
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            registry: self,
            cursor: self.head,
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.iter().map(|(tag, _)| tag.to_string()).collect()
    }

    /// Call `f` on every entry in registration order.
    pub fn for_each_mut<F: FnMut(&str, &mut T)>(&mut self, mut f: F) {
        let mut cursor = self.head;

        while let Some(index) = cursor {
            let node = self.node_mut(index);

            f(&node.tag, &mut node.value);
            cursor = node.next;
        }
    }

    /// Remove all the entries, in registration order.
    pub fn drain(&mut self) -> Vec<(String, T)> {
        let mut result = Vec::with_capacity(self.len());

        while let Some(head) = self.head {
            let key = SlotKey {
                index: head,
                generation: self.slots[head as usize].generation,
            };

            match self.remove(key) {
                Some(entry) => result.push(entry),
                None => break,
            }
        }

        result
    }

    /// Verify the links of the list. Returns the description of the first broken link.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut count = 0usize;
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            let node = self.slots[index as usize]
                .node
                .as_ref()
                .ok_or_else(|| format!("slot {index} is linked but empty"))?;

            if node.prev != prev {
                return Err(format!("slot {index} has prev {:?} instead of {:?}", node.prev, prev));
            }

            if self.by_tag.get(&node.tag) != Some(&index) {
                return Err(format!("tag {} doesn't point to slot {index}", node.tag));
            }

            count += 1;
            if count > self.slots.len() {
                return Err("the list has a cycle".to_string());
            }

            prev = Some(index);
            cursor = node.next;
        }

        if self.tail != prev {
            return Err(format!("tail is {:?} instead of {:?}", self.tail, prev));
        }

        if count != self.by_tag.len() {
            return Err(format!("{count} linked nodes but {} tags", self.by_tag.len()));
        }

        let occupied = self.slots.iter().filter(|s| s.node.is_some()).count();
        if occupied != count || occupied + self.free.len() != self.slots.len() {
            return Err(format!(
                "{occupied} occupied and {} free slots out of {}",
                self.free.len(),
                self.slots.len()
            ));
        }

        Ok(())
    }

    fn node_mut(&mut self, index: u32) -> &mut Node<T> {
        match self.slots[index as usize].node.as_mut() {
            Some(node) => node,
            None => unreachable!("linked slot {index} is empty"),
        }
    }
}

pub struct Iter<'a, T> {
    registry: &'a Registry<T>,
    cursor: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (&'a str, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.registry.slots[index as usize].node.as_ref()?;

        self.cursor = node.next;

        Some((node.tag.as_str(), &node.value))
    }
}
