//! Path router (C1).
//!
//! A byte-trie mapping URL path prefixes to handler identifiers. Grounded on
//! `petrel::router`'s `path_set`/`path_node` (`original_source/src/core/router.h`):
//! a 256-ary trie keyed byte-by-byte, terminal nodes carrying the handler,
//! longest-prefix-wins lookup. The original leaks `node_type[256]` arrays with
//! raw `new`/`delete`; here each fan-out is an owned `Box<[Option<Node>; 256]>`
//! so there is nothing to leak and no `unsafe`.

use crate::error::ConfigError;

/// Default handler identifier returned when no registered prefix matches.
pub const DEFAULT_HANDLER: &str = "__default__";

struct Node {
    handler_id: Option<String>,
    children: Option<Box<[Option<Node>; 256]>>,
}

impl Node {
    const fn empty() -> Self {
        Node {
            handler_id: None,
            children: None,
        }
    }
}

fn empty_children() -> Box<[Option<Node>; 256]> {
    Box::new(std::array::from_fn(|_| None))
}

/// Longest-prefix path router. Built once during bootstrap on the main
/// thread; read-only and `Sync`-shared by every worker thereafter.
pub struct Router {
    root: Node,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Router { root: Node::empty() }
    }

    /// Inserts a prefix → handler mapping. Not safe to call concurrently with
    /// [`Router::find`]; callers only invoke this during bootstrap.
    ///
    /// Re-adding a prefix replaces its handler. An empty prefix is rejected.
    pub fn add(&mut self, prefix: &str, handler_id: impl Into<String>) -> Result<(), ConfigError> {
        if prefix.is_empty() {
            return Err(ConfigError::InvalidRoute);
        }

        let mut node = &mut self.root;
        for &byte in prefix.as_bytes() {
            let children = node.children.get_or_insert_with(empty_children);
            node = children[byte as usize].get_or_insert_with(Node::empty);
        }
        node.handler_id = Some(handler_id.into());
        Ok(())
    }

    /// Finds the handler identifier for the longest registered prefix of
    /// `path`, or [`DEFAULT_HANDLER`] if none match (including an empty
    /// `path`).
    pub fn find<'a>(&'a self, path: &str) -> &'a str {
        let mut node = &self.root;
        let mut best: Option<&str> = None;

        for &byte in path.as_bytes() {
            if let Some(id) = &node.handler_id {
                best = Some(id.as_str());
            }
            let Some(children) = &node.children else {
                break;
            };
            let Some(next) = &children[byte as usize] else {
                break;
            };
            node = next;
        }

        if let Some(id) = &node.handler_id {
            best = Some(id.as_str());
        }

        best.unwrap_or(DEFAULT_HANDLER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_returns_default() {
        let router = Router::new();
        assert_eq!(router.find(""), DEFAULT_HANDLER);
    }

    #[test]
    fn rejects_empty_prefix() {
        let mut router = Router::new();
        assert!(matches!(router.add("", "x"), Err(ConfigError::InvalidRoute)));
    }

    #[test]
    fn scenario_s1_routing() {
        let mut router = Router::new();
        router.add("/", "root").unwrap();
        router.add("/a", "A").unwrap();
        router.add("/a/b", "AB").unwrap();

        assert_eq!(router.find("/"), "root");
        assert_eq!(router.find("/x"), "root");
        assert_eq!(router.find("/a"), "A");
        assert_eq!(router.find("/a/"), "A");
        assert_eq!(router.find("/a/b"), "AB");
        assert_eq!(router.find("/a/b/c"), "AB");
        assert_eq!(router.find("/ab"), "A");
    }

    #[test]
    fn readd_replaces_handler() {
        let mut router = Router::new();
        router.add("/x", "first").unwrap();
        router.add("/x", "second").unwrap();
        assert_eq!(router.find("/x"), "second");
    }

    #[test]
    fn byte_wise_non_ascii() {
        let mut router = Router::new();
        router.add("/\u{e9}", "accented").unwrap();
        assert_eq!(router.find("/\u{e9}x"), "accented");
        assert_eq!(router.find("/\u{e9}"), "accented");
    }

    #[test]
    fn case_sensitive() {
        let mut router = Router::new();
        router.add("/Foo", "upper").unwrap();
        assert_eq!(router.find("/foo"), DEFAULT_HANDLER);
        assert_eq!(router.find("/Foo"), "upper");
    }

    proptest::proptest! {
        #[test]
        fn longest_prefix_always_wins(prefixes in proptest::collection::vec("[a-z/]{1,8}", 1..20)) {
            let mut router = Router::new();
            let mut added = Vec::new();
            for (i, p) in prefixes.iter().enumerate() {
                if !p.is_empty() && router.add(p, i.to_string()).is_ok() {
                    added.push((p.clone(), i.to_string()));
                }
            }
            for (path, _) in &added {
                let expected = added
                    .iter()
                    .filter(|(p, _)| path.starts_with(p.as_str()))
                    .max_by_key(|(p, _)| p.len())
                    .map(|(_, id)| id.as_str())
                    .unwrap_or(DEFAULT_HANDLER);
                proptest::prop_assert_eq!(router.find(path), expected);
            }
        }
    }
}
