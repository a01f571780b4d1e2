//! Subscription trie keyed by topic level
//!
//! Each node has literal children plus at most one `+` and one `#` child, so
//! matching a topic visits only the branches that can match it. Lookups take
//! the read lock; subscribe and unsubscribe take the write lock.

use crate::QoS;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    plus_child: Option<Box<Node>>,
    hash_child: Option<Box<Node>>,
    subscribers: HashMap<String, QoS>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
            && self.children.is_empty()
            && self.plus_child.is_none()
            && self.hash_child.is_none()
    }

    fn child_mut(&mut self, level: &str) -> &mut Node {
        match level {
            "+" => self.plus_child.get_or_insert_with(Box::default),
            "#" => self.hash_child.get_or_insert_with(Box::default),
            literal => self.children.entry(literal.to_string()).or_default(),
        }
    }

    /// Returns whether the subscription existed.
    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        let Some((level, rest)) = levels.split_first() else {
            return self.subscribers.remove(client_id).is_some();
        };

        match *level {
            "+" => remove_boxed(&mut self.plus_child, rest, client_id),
            "#" => remove_boxed(&mut self.hash_child, rest, client_id),
            literal => {
                let Some(child) = self.children.get_mut(literal) else {
                    return false;
                };
                let removed = child.remove(rest, client_id);
                if child.is_empty() {
                    self.children.remove(literal);
                }
                removed
            }
        }
    }

    fn collect(&self, levels: &[&str], first_level: bool, hidden: bool, out: &mut Matches) {
        // `$` topics are invisible to wildcards at the first level
        let wildcards_allowed = !(first_level && hidden);

        if wildcards_allowed {
            if let Some(hash) = &self.hash_child {
                out.extend(&hash.subscribers);
            }
        }

        let Some((level, rest)) = levels.split_first() else {
            out.extend(&self.subscribers);
            return;
        };

        if let Some(child) = self.children.get(*level) {
            child.collect(rest, false, hidden, out);
        }
        if wildcards_allowed {
            if let Some(plus) = &self.plus_child {
                plus.collect(rest, false, hidden, out);
            }
        }
    }
}

fn remove_boxed(slot: &mut Option<Box<Node>>, rest: &[&str], client_id: &str) -> bool {
    let Some(node) = slot.as_mut() else {
        return false;
    };
    let removed = node.remove(rest, client_id);
    if node.is_empty() {
        *slot = None;
    }
    removed
}

/// Highest granted QoS per client across every matching filter.
#[derive(Debug, Default)]
struct Matches(BTreeMap<String, QoS>);

impl Matches {
    fn extend(&mut self, subscribers: &HashMap<String, QoS>) {
        for (client_id, qos) in subscribers {
            self.0
                .entry(client_id.clone())
                .and_modify(|existing| *existing = (*existing).max(*qos))
                .or_insert(*qos);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    root: Node,
    count: usize,
}

#[derive(Debug, Default)]
pub struct TopicTree {
    inner: RwLock<Inner>,
}

impl TopicTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces `client_id`'s subscription to `filter`, returning the
    /// QoS it replaced. `filter` must already be validated.
    pub fn subscribe(&self, filter: &str, qos: QoS, client_id: &str) -> Option<QoS> {
        let mut inner = self.inner.write();
        let mut node = &mut inner.root;
        for level in filter.split('/') {
            node = node.child_mut(level);
        }
        let previous = node.subscribers.insert(client_id.to_string(), qos);
        if previous.is_none() {
            inner.count += 1;
        }
        previous
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let mut inner = self.inner.write();
        let removed = inner.root.remove(&levels, client_id);
        if removed {
            inner.count -= 1;
        }
        removed
    }

    /// Subscribers whose filters match `topic`, ordered by client id, each
    /// with the highest QoS granted among its matching filters.
    #[must_use]
    pub fn matches(&self, topic: &str) -> Vec<(String, QoS)> {
        let levels: Vec<&str> = topic.split('/').collect();
        let hidden = topic.starts_with('$');
        let mut out = Matches::default();
        self.inner.read().root.collect(&levels, true, hidden, &mut out);
        out.0.into_iter().collect()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.read().count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().root.is_empty()
    }
}
