//! Route compilation, matching and reverse routing.
//!
//! Route files are parsed into [`Route`]s, validated against the
//! [`Registry`] and compiled into a [`RouteTable`]. The live table sits
//! behind an [`ArcSwap`] in the [`Router`]: a refresh publishes a new table
//! while requests already routing keep the snapshot they loaded.

pub mod parser;
pub mod route;
mod tree;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use tracing::info;

use crate::action::Registry;
use crate::error::{Error, ReverseError, RouteError};
use crate::method::RouteMethod;
use crate::routing::route::{Route, load_route_files, parse_routes};
use crate::routing::tree::{Tree, tree_path};

/// Captured route parameters.
pub type Params = HashMap<String, String>;

/// The result of matching a request against a route.
#[derive(Clone, Debug)]
pub struct RouteMatch {
    /// After `:controller` substitution.
    pub controller: String,
    /// After `:action` substitution.
    pub action: String,
    pub params: Params,
    pub fixed_params: Arc<[String]>,
    pub tls_only: bool,
    /// Method the route was declared with.
    pub method: RouteMethod,
}

#[derive(Clone, Debug)]
pub enum Lookup {
    Matched(RouteMatch),
    /// The request hit an explicit `404` route.
    NotFound,
}

/// Where an action can be reached, as built by [`RouteTable::reverse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionDefinition {
    pub method: String,
    pub url: String,
    /// The route accepts any method.
    pub star: bool,
    pub action: String,
    /// Arguments not consumed by the path; they make up the query string.
    pub args: BTreeMap<String, String>,
}

// ── RouteTable ────────────────────────────────────────────────────────────────

/// A compiled, immutable set of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    tree: Tree,
}

impl RouteTable {
    /// Validates every route against `registry` and builds the matcher.
    ///
    /// Each GET route is mirrored as HEAD unless a HEAD route for the same
    /// path was declared explicitly.
    pub fn compile(routes: Vec<Route>, registry: &Registry) -> Result<Self, RouteError> {
        let mut tree = Tree::default();

        for (i, route) in routes.iter().enumerate() {
            validate(route, registry)?;
            tree.insert(&tree_path(route.method.as_str(), &route.path), i, false)
                .map_err(|e| located(route, format!("{} {}: {e}", route.method, route.path)))?;
        }
        for (i, route) in routes.iter().enumerate().filter(|(_, r)| r.method == RouteMethod::Get) {
            tree.insert(&tree_path(RouteMethod::Head.as_str(), &route.path), i, true)
                .map_err(|e| located(route, format!("HEAD {}: {e}", route.path)))?;
        }

        Ok(Self { routes, tree })
    }

    pub fn routes(&self) -> &[Route] { &self.routes }

    /// Matches a request method and path. `None` means no route applies and
    /// the request should fall through.
    pub fn lookup(&self, method: &str, path: &str) -> Option<Lookup> {
        let found = self.tree.find(&tree_path(method, path))?;
        let route = &self.routes[found.leaf];
        if route.is_not_found() {
            return Some(Lookup::NotFound);
        }

        let params: Params = found
            .captures
            .into_iter()
            .map(|(k, v)| (k, percent_decode(&v).into_owned()))
            .collect();
        let controller = substitute(&route.controller, &params);
        let action = substitute(&route.action_name, &params);

        Some(Lookup::Matched(RouteMatch {
            controller,
            action,
            params,
            fixed_params: Arc::clone(&route.fixed_params),
            tls_only: route.tls_only,
            method: route.method,
        }))
    }

    /// Builds the URL that reaches `action` (`Controller.Action`).
    ///
    /// The first route whose controller and action match, literally or via
    /// a `:name` placeholder, wins. Placeholder bindings join `args`, path
    /// parameters are taken from `args` and percent-encoded, and what is left
    /// becomes the query string, sorted by key. A path parameter missing from
    /// `args` is an error.
    pub fn reverse(&self, action: &str, mut args: BTreeMap<String, String>) -> Result<ActionDefinition, ReverseError> {
        let (controller, name) = action
            .split_once('.')
            .filter(|(c, a)| !c.is_empty() && !a.is_empty() && !a.contains('.'))
            .ok_or_else(|| ReverseError::InvalidAction(action.to_owned()))?;

        for route in self.routes.iter().filter(|r| !r.is_not_found()) {
            let Some(bindings) = bind(route, controller, name) else { continue };
            args.extend(bindings);

            let mut url = String::new();
            for seg in route.path.split('/').skip(1) {
                url.push('/');
                let param = match seg.as_bytes().first() {
                    Some(b':') => Some((&seg[1..], SEGMENT)),
                    Some(b'*') => Some((if seg.len() == 1 { "*" } else { &seg[1..] }, WILDCARD)),
                    _ => None,
                };
                match param {
                    Some((param, escaped)) => {
                        let value = args.remove(param).ok_or_else(|| ReverseError::MissingArgument {
                            action: action.to_owned(),
                            name: param.to_owned(),
                        })?;
                        url.extend(utf8_percent_encode(&value, escaped));
                    }
                    None => url.push_str(seg),
                }
            }
            if !args.is_empty() {
                let query = url::form_urlencoded::Serializer::new(String::new()).extend_pairs(&args).finish();
                url.push('?');
                url.push_str(&query);
            }

            let star = route.method == RouteMethod::Any;
            let method = if star { RouteMethod::Get } else { route.method };
            return Ok(ActionDefinition { method: method.to_string(), url, star, action: action.to_owned(), args });
        }

        Err(ReverseError::NoRoute(action.to_owned()))
    }
}

fn located(route: &Route, message: String) -> RouteError {
    RouteError::new(message, route.source.file.clone(), route.source.line)
}

fn validate(route: &Route, registry: &Registry) -> Result<(), RouteError> {
    if route.is_not_found() {
        return Ok(());
    }
    if route.controller.is_empty() || route.action_name.is_empty() {
        return Err(located(route, format!("invalid action `{}`; expected Controller.Action", route.action)));
    }

    for placeholder in [&route.controller, &route.action_name] {
        if let Some(name) = placeholder.strip_prefix(':') {
            let captured = route
                .path
                .split('/')
                .any(|seg| seg.strip_prefix(':').or_else(|| seg.strip_prefix('*')) == Some(name));
            if !captured {
                return Err(located(route, format!("`{placeholder}` is not a parameter of {}", route.path)));
            }
        }
    }

    if route.controller_is_variable() {
        return Ok(());
    }
    if !registry.contains_controller(&route.controller) {
        return Err(located(route, format!("controller `{}` is not registered", route.controller)));
    }
    if !route.action_is_variable() && registry.lookup(&route.controller, &route.action_name).is_none() {
        return Err(located(route, format!("action `{}` not found", route.action)));
    }
    Ok(())
}

/// Matches a route's action against `controller.name`, returning the
/// placeholder bindings.
fn bind(route: &Route, controller: &str, name: &str) -> Option<Vec<(String, String)>> {
    let mut bindings = Vec::new();
    for (pattern, value) in [(&route.controller, controller), (&route.action_name, name)] {
        match pattern.strip_prefix(':') {
            Some(placeholder) => bindings.push((placeholder.to_owned(), value.to_owned())),
            None if pattern == value => {}
            None => return None,
        }
    }
    Some(bindings)
}

fn substitute(name: &str, params: &Params) -> String {
    name.strip_prefix(':')
        .and_then(|p| params.get(p))
        .cloned()
        .unwrap_or_else(|| name.to_owned())
}

/// Decodes `%XX` escapes in a path segment. Invalid escapes are kept.
fn percent_decode(s: &str) -> Cow<'_, str> {
    percent_decode_str(s).decode_utf8_lossy()
}

/// Bytes escaped when a value fills a `:param` segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ').add(b'"').add(b'#').add(b'%').add(b'/').add(b'<')
    .add(b'>').add(b'?').add(b'`').add(b'{').add(b'}');

/// Same as [`SEGMENT`] minus `/`, for values filling a `*wildcard`.
const WILDCARD: &AsciiSet = &SEGMENT.remove(b'/');

// ── Router ────────────────────────────────────────────────────────────────────

/// Where route definitions come from.
#[derive(Clone, Debug)]
pub enum RouteSource {
    File(PathBuf),
    /// Route text held in memory; `name` appears in diagnostics.
    Text { name: PathBuf, content: String },
}

fn load_sources(sources: &[RouteSource]) -> Result<Vec<Route>, Error> {
    let mut routes = Vec::new();
    for source in sources {
        match source {
            RouteSource::File(path) => routes.extend(load_route_files(std::slice::from_ref(path))?),
            RouteSource::Text { name, content } => routes.extend(parse_routes(content, name, "")),
        }
    }
    Ok(routes)
}

/// Publishes the current [`RouteTable`] and rebuilds it on demand.
pub struct Router {
    table: ArcSwap<RouteTable>,
    sources: Vec<RouteSource>,
    registry: Arc<Registry>,
}

impl Router {
    /// Loads and compiles every source in order.
    pub fn new(sources: Vec<RouteSource>, registry: Arc<Registry>) -> Result<Self, Error> {
        let table = RouteTable::compile(load_sources(&sources)?, &registry)?;
        info!(routes = table.routes().len(), "routes compiled");
        Ok(Self { table: ArcSwap::from_pointee(table), sources, registry })
    }

    /// The table requests should route against. Callers keep the returned
    /// snapshot for the whole request.
    pub fn current(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Re-reads every source and publishes the result. On error the
    /// previous table stays live.
    pub fn refresh(&self) -> Result<(), Error> {
        let table = RouteTable::compile(load_sources(&self.sources)?, &self.registry)?;
        info!(routes = table.routes().len(), "routes refreshed");
        self.table.store(Arc::new(table));
        Ok(())
    }

    /// Publishes an already compiled table.
    pub fn replace(&self, table: RouteTable) {
        self.table.store(Arc::new(table));
    }

    pub fn registry(&self) -> &Arc<Registry> { &self.registry }
}
