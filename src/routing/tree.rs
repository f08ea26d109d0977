//! Segment tree used for request matching.
//!
//! The request method is folded into the path as a leading segment
//! (`GET /app/:id` is stored as `/GET/app/:id`, and `* /x` as
//! `/:METHOD/x`), so one tree serves every verb. Each level holds literal
//! children, at most one named-parameter child and at most one trailing
//! wildcard. Lookup prefers literal over parameter over wildcard and
//! backtracks when a preferred branch dead-ends.

use std::collections::HashMap;

use crate::method::RouteMethod;

/// Builds the tree path for a method and a route path.
pub(crate) fn tree_path(method: &str, path: &str) -> String {
    let method = if method == RouteMethod::Any.as_str() { ":METHOD" } else { method };
    format!("/{method}{path}")
}

fn segments(tree_path: &str) -> Vec<&str> {
    tree_path.split('/').skip(1).collect()
}

#[derive(Debug, Default)]
pub(crate) struct Tree {
    root: Node,
}

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Param>>,
    wildcard: Option<Wildcard>,
    leaf: Option<usize>,
}

#[derive(Debug)]
struct Param {
    name: String,
    node: Node,
}

#[derive(Debug)]
struct Wildcard {
    name: String,
    leaf: usize,
}

/// What a successful lookup yields: the leaf value and the captured
/// parameters in path order.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Found {
    pub leaf: usize,
    pub captures: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InsertError {
    Duplicate,
    ParamConflict { existing: String, new: String },
    WildcardNotLast,
}

impl std::fmt::Display for InsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => f.write_str("duplicate path"),
            Self::ParamConflict { existing, new } => {
                write!(f, "parameter `{new}` conflicts with `{existing}` at the same depth")
            }
            Self::WildcardNotLast => f.write_str("wildcard must be the last path segment"),
        }
    }
}

impl Tree {
    /// Adds `leaf` under `tree_path`.
    ///
    /// With `keep_existing`, an already occupied leaf is left untouched and
    /// the call succeeds; used for the implicit HEAD mirrors of GET routes.
    pub(crate) fn insert(&mut self, tree_path: &str, leaf: usize, keep_existing: bool) -> Result<(), InsertError> {
        let segs = segments(tree_path);
        let mut node = &mut self.root;

        for (i, seg) in segs.iter().enumerate() {
            if let Some(name) = seg.strip_prefix('*') {
                if i + 1 != segs.len() {
                    return Err(InsertError::WildcardNotLast);
                }
                let name = if name.is_empty() { "*" } else { name };
                if let Some(existing) = &node.wildcard {
                    if existing.name != name {
                        return Err(InsertError::ParamConflict {
                            existing: existing.name.clone(),
                            new: name.to_owned(),
                        });
                    }
                    return if keep_existing { Ok(()) } else { Err(InsertError::Duplicate) };
                }
                node.wildcard = Some(Wildcard { name: name.to_owned(), leaf });
                return Ok(());
            }

            if let Some(name) = seg.strip_prefix(':') {
                let param = node.param.get_or_insert_with(|| {
                    Box::new(Param { name: name.to_owned(), node: Node::default() })
                });
                if param.name != name {
                    return Err(InsertError::ParamConflict {
                        existing: param.name.clone(),
                        new: name.to_owned(),
                    });
                }
                node = &mut param.node;
            } else {
                node = node.literals.entry((*seg).to_owned()).or_default();
            }
        }

        match node.leaf {
            Some(_) if keep_existing => Ok(()),
            Some(_) => Err(InsertError::Duplicate),
            None => {
                node.leaf = Some(leaf);
                Ok(())
            }
        }
    }

    pub(crate) fn find(&self, tree_path: &str) -> Option<Found> {
        let segs = segments(tree_path);
        let mut captures = Vec::new();
        let leaf = self.root.find(&segs, &mut captures)?;
        Some(Found { leaf, captures })
    }
}

impl Node {
    fn find(&self, segs: &[&str], captures: &mut Vec<(String, String)>) -> Option<usize> {
        let Some((head, rest)) = segs.split_first() else {
            return self.leaf;
        };

        if let Some(child) = self.literals.get(*head) {
            if let Some(leaf) = child.find(rest, captures) {
                return Some(leaf);
            }
        }

        if let Some(param) = &self.param {
            if !head.is_empty() {
                captures.push((param.name.clone(), (*head).to_owned()));
                if let Some(leaf) = param.node.find(rest, captures) {
                    return Some(leaf);
                }
                captures.pop();
            }
        }

        self.wildcard.as_ref().map(|w| {
            captures.push((w.name.clone(), segs.join("/")));
            w.leaf
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(paths: &[&str]) -> Tree {
        let mut tree = Tree::default();
        for (i, p) in paths.iter().enumerate() {
            tree.insert(p, i, false).unwrap();
        }
        tree
    }

    fn caps(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn literal_beats_param_regardless_of_order() {
        let t = tree(&["/GET/:param", "/GET/x"]);
        assert_eq!(t.find("/GET/x").unwrap().leaf, 1);
        assert_eq!(t.find("/GET/y").unwrap(), Found { leaf: 0, captures: caps(&[("param", "y")]) });
    }

    #[test]
    fn wildcard_captures_remainder() {
        let t = tree(&["/GET/a/*"]);
        assert_eq!(t.find("/GET/a/b/c").unwrap().captures, caps(&[("*", "b/c")]));
        let t = tree(&["/GET/static/*filepath"]);
        assert_eq!(t.find("/GET/static/css/site.css").unwrap().captures, caps(&[("filepath", "css/site.css")]));
        assert!(t.find("/GET/static").is_none());
    }

    #[test]
    fn backtracks_from_dead_literal_branch() {
        let t = tree(&["/GET/users/new", "/GET/:section/:id/edit"]);
        let found = t.find("/GET/users/new/edit").unwrap();
        assert_eq!(found.leaf, 1);
        assert_eq!(found.captures, caps(&[("section", "users"), ("id", "new")]));
    }

    #[test]
    fn any_method_is_a_parameter_segment() {
        let t = tree(&[&tree_path("*", "/ping"), &tree_path("GET", "/ping")]);
        assert_eq!(t.find("/GET/ping").unwrap().leaf, 1);
        let found = t.find("/DELETE/ping").unwrap();
        assert_eq!(found.leaf, 0);
        assert_eq!(found.captures, caps(&[("METHOD", "DELETE")]));
    }

    #[test]
    fn params_do_not_match_empty_segments() {
        let t = tree(&["/GET/user/:name"]);
        assert!(t.find("/GET/user/").is_none());
    }

    #[test]
    fn rejects_collisions() {
        let mut t = tree(&["/GET/a/:id"]);
        assert_eq!(t.insert("/GET/a/:id", 9, false), Err(InsertError::Duplicate));
        assert!(matches!(t.insert("/GET/a/:other/x", 9, false), Err(InsertError::ParamConflict { .. })));
        assert_eq!(t.insert("/GET/*rest/x", 9, false), Err(InsertError::WildcardNotLast));
        assert_eq!(t.insert("/GET/a/:id", 9, true), Ok(()));
        assert_eq!(t.find("/GET/a/1").unwrap().leaf, 0);
    }
}
