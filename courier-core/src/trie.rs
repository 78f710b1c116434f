//! Generic subscription trie mapping MQTT topic filters to delivery targets.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches the remaining levels, including none (must be last)
//!
//! The trie does not validate filters; MQTT filter rules are enforced at the
//! subscription boundary, not here.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::error::TopicError;
use crate::topic::split_topic;

const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

#[derive(Debug)]
struct Node<T> {
    /// Targets of filters ending at this node.
    targets: HashSet<T>,
    /// Children with non-wildcard level names.
    children: HashMap<String, Node<T>>,
    /// Subtree descended into by a `+` level.
    plus_subtree: Option<Box<Node<T>>>,
    /// Targets of filters ending in `#` whose prefix leads here.
    multi_level_targets: HashSet<T>,
}

impl<T> Node<T> {
    fn new() -> Node<T> {
        Node {
            targets: HashSet::new(),
            children: HashMap::new(),
            plus_subtree: None,
            multi_level_targets: HashSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.targets.is_empty()
            && self.children.is_empty()
            && self.plus_subtree.is_none()
            && self.multi_level_targets.is_empty()
    }
}

/// Subscription container mapping topic filters to delivery targets.
///
/// A target may be attached under any number of filters; matching returns one
/// occurrence per matching attachment. Equality and hashing of `T` define
/// target identity.
#[derive(Debug)]
pub struct SubscriptionTrie<T> {
    // The root has no level name and is never pruned.
    root: Node<T>,
}

impl<T: Clone + Eq + Hash> SubscriptionTrie<T> {
    pub fn new() -> SubscriptionTrie<T> {
        SubscriptionTrie { root: Node::new() }
    }

    /// Attach `target` under `filter`. Idempotent per `(filter, target)`
    /// pair. Fails only when the filter cannot be split (empty input), in
    /// which case the trie is left untouched.
    pub fn insert(&mut self, filter: &str, target: T) -> Result<(), TopicError> {
        let levels = split_topic(filter)?;
        insert_at(&mut self.root, &levels, target);
        Ok(())
    }

    /// Collect every target whose filter matches `topic` under MQTT wildcard
    /// rules. Ordering is unspecified. An empty topic matches nothing.
    pub fn matches(&self, topic: &str) -> Vec<T> {
        let Ok(levels) = split_topic(topic) else {
            return Vec::new();
        };

        let mut result = Vec::new();
        collect_matches(&self.root, &levels, &mut result);
        result
    }

    /// Detach `target` from `filter`, pruning nodes that become empty.
    /// Unknown filters and targets are ignored.
    pub fn remove(&mut self, filter: &str, target: &T) {
        let Ok(levels) = split_topic(filter) else {
            return;
        };

        remove_at(&mut self.root, &levels, target);
    }

    /// True when nothing is attached anywhere in the trie.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<T: Clone + Eq + Hash> Default for SubscriptionTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_at<T: Eq + Hash>(node: &mut Node<T>, levels: &[&str], target: T) {
    match levels {
        [] => {
            // Last level consumed; the target belongs to this node.
            node.targets.insert(target);
        }
        [level, rest @ ..] => {
            if *level == SINGLE_LEVEL_WILDCARD {
                let subtree = node
                    .plus_subtree
                    .get_or_insert_with(|| Box::new(Node::new()));
                insert_at(subtree, rest, target);
            } else if *level == MULTI_LEVEL_WILDCARD {
                node.multi_level_targets.insert(target);
            } else {
                let child = node
                    .children
                    .entry((*level).to_string())
                    .or_insert_with(Node::new);
                insert_at(child, rest, target);
            }
        }
    }
}

fn collect_matches<T: Clone>(node: &Node<T>, levels: &[&str], result: &mut Vec<T>) {
    match levels {
        [] => {
            result.extend(node.targets.iter().cloned());
        }
        [level, rest @ ..] => {
            if let Some(child) = node.children.get(*level) {
                collect_matches(child, rest, result);
            }

            if let Some(subtree) = &node.plus_subtree {
                collect_matches(subtree, rest, result);
            }
        }
    }

    // A trailing `#` also matches its parent level: the filter `foo/#`
    // matches the topic `foo`.
    result.extend(node.multi_level_targets.iter().cloned());
}

/// Returns true when `node` became empty and must be pruned by its parent.
fn remove_at<T: Eq + Hash>(node: &mut Node<T>, levels: &[&str], target: &T) -> bool {
    match levels {
        [] => {
            node.targets.remove(target);
        }
        [level, rest @ ..] => {
            if *level == SINGLE_LEVEL_WILDCARD {
                if let Some(subtree) = node.plus_subtree.as_deref_mut() {
                    if remove_at(subtree, rest, target) {
                        node.plus_subtree = None;
                    }
                }
            } else if *level == MULTI_LEVEL_WILDCARD {
                node.multi_level_targets.remove(target);
            } else if let Some(child) = node.children.get_mut(*level) {
                if remove_at(child, rest, target) {
                    node.children.remove(*level);
                }
            }
        }
    }

    node.is_empty()
}
