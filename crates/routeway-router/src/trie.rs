//! Route trie
//!
//! Hosts are stored by reversed label (`com` -> `example` -> `www`), and each
//! host node may carry a path trie keyed by whole path segments. A pool sits
//! on any node that was registered as a route.

use crate::pool::RoutePool;
use crate::route_key::RouteKey;
use crate::wildcard::extract_parent_wildcard;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct PathNode {
    children: HashMap<String, PathNode>,
    pool: Option<Arc<RoutePool>>,
}

impl PathNode {
    fn is_empty(&self) -> bool {
        self.pool.is_none() && self.children.is_empty()
    }

    /// Deepest pool along `segments`
    fn longest_match<'a>(&self, segments: impl Iterator<Item = &'a str>) -> Option<Arc<RoutePool>> {
        let mut node = self;
        let mut found = node.pool.clone();
        for segment in segments {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.pool.is_some() {
                        found = node.pool.clone();
                    }
                }
                None => break,
            }
        }
        found
    }

    fn walk(&self, prefix: &mut String, f: &mut dyn FnMut(&str, &Arc<RoutePool>)) {
        if let Some(pool) = &self.pool {
            f(prefix.as_str(), pool);
        }
        for (segment, child) in &self.children {
            let len = prefix.len();
            prefix.push('/');
            prefix.push_str(segment);
            child.walk(prefix, f);
            prefix.truncate(len);
        }
    }

    fn prune(&mut self, prefix: &mut String, f: &mut dyn FnMut(&str, &RoutePool)) -> usize {
        let mut removed = 0;

        if let Some(pool) = &self.pool {
            f(prefix.as_str(), pool);
            if pool.is_empty() {
                self.pool = None;
                removed += 1;
            }
        }

        self.children.retain(|segment, child| {
            let len = prefix.len();
            prefix.push('/');
            prefix.push_str(segment);
            removed += child.prune(prefix, f);
            prefix.truncate(len);
            !child.is_empty()
        });

        removed
    }
}

#[derive(Debug, Default)]
struct HostNode {
    children: HashMap<String, HostNode>,
    routes: Option<PathNode>,
}

impl HostNode {
    fn is_empty(&self) -> bool {
        self.routes.is_none() && self.children.is_empty()
    }

    fn walk(&self, labels: &mut Vec<String>, f: &mut dyn FnMut(&str, &Arc<RoutePool>)) {
        if let Some(routes) = &self.routes {
            let mut prefix = host_from_reversed(labels);
            routes.walk(&mut prefix, f);
        }
        for (label, child) in &self.children {
            labels.push(label.clone());
            child.walk(labels, f);
            labels.pop();
        }
    }

    fn prune(&mut self, labels: &mut Vec<String>, f: &mut dyn FnMut(&str, &RoutePool)) -> usize {
        let mut removed = 0;

        if let Some(routes) = &mut self.routes {
            let mut prefix = host_from_reversed(labels);
            removed += routes.prune(&mut prefix, f);
            if routes.is_empty() {
                self.routes = None;
            }
        }

        self.children.retain(|label, child| {
            labels.push(label.clone());
            removed += child.prune(labels, f);
            labels.pop();
            !child.is_empty()
        });

        removed
    }
}

fn host_from_reversed(labels: &[String]) -> String {
    labels
        .iter()
        .rev()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Default)]
pub(crate) struct Trie {
    root: HostNode,
}

impl Trie {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn host_node<'a>(&self, mut labels: impl Iterator<Item = &'a str>) -> Option<&HostNode> {
        labels.try_fold(&self.root, |node, label| node.children.get(label))
    }

    /// Pool registered at exactly `key`, creating it with `make` if absent
    pub(crate) fn insert_or_get<F>(&mut self, key: &RouteKey, make: F) -> Arc<RoutePool>
    where
        F: FnOnce() -> RoutePool,
    {
        let mut host = &mut self.root;
        for label in key.reversed_labels() {
            host = host.children.entry(label.to_string()).or_default();
        }

        let mut node = host.routes.get_or_insert_with(PathNode::default);
        for segment in key.segments() {
            node = node.children.entry(segment.to_string()).or_default();
        }

        node.pool.get_or_insert_with(|| Arc::new(make())).clone()
    }

    /// Pool registered at exactly `key`
    pub(crate) fn get(&self, key: &RouteKey) -> Option<Arc<RoutePool>> {
        let mut node = self.host_node(key.reversed_labels())?.routes.as_ref()?;
        for segment in key.segments() {
            node = node.children.get(segment)?;
        }
        node.pool.clone()
    }

    /// Longest-match lookup, falling back to the parent wildcard host
    pub(crate) fn find(&self, key: &RouteKey) -> Option<Arc<RoutePool>> {
        let exact = self
            .host_node(key.reversed_labels())
            .and_then(|host| host.routes.as_ref())
            .and_then(|routes| routes.longest_match(key.segments()));
        if exact.is_some() {
            return exact;
        }

        let wildcard = extract_parent_wildcard(key.host())?;
        self.host_node(wildcard.rsplit('.'))?
            .routes
            .as_ref()?
            .longest_match(key.segments())
    }

    pub(crate) fn walk(&self, mut f: impl FnMut(&str, &Arc<RoutePool>)) {
        self.root.walk(&mut Vec::new(), &mut f);
    }

    /// Run `f` over every pool, then drop pools left empty and any node
    /// without pools below it. Returns the number of routes removed.
    pub(crate) fn prune(&mut self, mut f: impl FnMut(&str, &RoutePool)) -> usize {
        self.root.prune(&mut Vec::new(), &mut f)
    }

    pub(crate) fn route_count(&self) -> usize {
        let mut count = 0;
        self.walk(|_, _| count += 1);
        count
    }
}
