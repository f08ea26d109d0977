//! Controllers, actions and the registry that binds them to names.
//!
//! # How actions are stored
//!
//! Routes name actions as text (`App.Login`), so the registry must hold
//! actions of *different* controller types in one map keyed by name. Each
//! action is a plain function pointer over its controller:
//!
//! ```text
//! fn login<'a>(app: &'a App, cx: &'a mut In) -> BoxFuture<'a, Out>
//!        ↓ table.add("Login", App::login)         ← inside Controller::actions
//! BoundAction { controller: Arc<App>, action }      ← typed, one per action
//!        ↓  stored as ActionHandle = Arc<dyn ErasedAction>
//! handle.call(&mut cx)  at request time            ← one vtable dispatch
//! ```
//!
//! The calling convention (one `&mut In` in, one [`Out`] out) is the
//! [`ActionFn`] type itself: anything else fails to compile at the
//! `add` call instead of being discovered at runtime. Names that belong to
//! controller lifecycle hooks are refused at registration so a route can
//! never dispatch into a hook.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::In;
use crate::output::Out;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future borrowing from the request.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The one accepted action signature.
pub type ActionFn<C> = for<'a> fn(&'a C, &'a mut In) -> BoxFuture<'a, Out>;

/// Default action when a route does not name one.
pub const DEFAULT_ACTION: &str = "Index";

/// Names reserved for controller hooks; never registered as actions.
const RESERVED: &[&str] = &["Init", "PreFilter", "Render", "Layout", "PageTitle", "Actions"];

/// Internal dispatch interface.
#[doc(hidden)]
pub trait ErasedAction: Send + Sync {
    fn call<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out>;
}

/// A validated, callable reference to one controller action.
pub type ActionHandle = Arc<dyn ErasedAction>;

struct BoundAction<C> {
    controller: Arc<C>,
    action: ActionFn<C>,
}

impl<C: Controller> ErasedAction for BoundAction<C> {
    fn call<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        (self.action)(&self.controller, cx)
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

/// A named group of actions sharing a pre-filter, a layout and a page title.
///
/// ```rust,no_run
/// use trellis::{ActionTable, BoxFuture, Controller, In, Out};
///
/// struct App;
///
/// impl App {
///     fn login<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
///         Box::pin(async move { cx.string("sign in") })
///     }
/// }
///
/// impl Controller for App {
///     const NAME: &'static str = "App";
///
///     fn actions(table: &mut ActionTable<Self>) {
///         table.add("Login", App::login);
///     }
/// }
/// ```
pub trait Controller: Send + Sync + Sized + 'static {
    const NAME: &'static str;

    /// Registers the controller's actions.
    fn actions(table: &mut ActionTable<Self>);

    /// Runs after the global filters and before the action. Anything but
    /// [`In::continue_`] is rendered in place of the action.
    fn pre_filter<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Box::pin(std::future::ready(cx.continue_()))
    }

    /// Layout used by template outputs, as `layouts/{name}.tpl`.
    fn layout(&self) -> Option<&str> {
        Some("default")
    }

    /// Untranslated page title.
    fn page_title(&self) -> &str {
        ""
    }
}

/// Collects a controller's actions during registration.
pub struct ActionTable<C> {
    actions: Vec<(String, ActionFn<C>)>,
}

impl<C: Controller> ActionTable<C> {
    /// Adds an action. Reserved hook names are ignored.
    pub fn add(&mut self, name: &str, action: ActionFn<C>) -> &mut Self {
        if RESERVED.contains(&name) {
            debug!(controller = C::NAME, action = name, "reserved name; not registered as an action");
            return self;
        }
        self.actions.push((name.to_owned(), action));
        self
    }
}

/// Controller hooks without the concrete type.
pub(crate) trait ErasedController: Send + Sync {
    fn pre_filter<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out>;
    fn layout(&self) -> Option<&str>;
    fn page_title(&self) -> &str;
}

impl<C: Controller> ErasedController for C {
    fn pre_filter<'a>(&'a self, cx: &'a mut In) -> BoxFuture<'a, Out> {
        Controller::pre_filter(self, cx)
    }

    fn layout(&self) -> Option<&str> {
        Controller::layout(self)
    }

    fn page_title(&self) -> &str {
        Controller::page_title(self)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct Registered {
    controller: Arc<dyn ErasedController>,
    actions: HashMap<String, ActionHandle>,
}

/// Live controller instances and their actions, owned by one server.
#[derive(Default)]
pub struct Registry {
    controllers: HashMap<&'static str, Registered>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Registers a controller instance under [`Controller::NAME`].
    /// Registering the same name twice replaces the earlier instance.
    pub fn register<C: Controller>(&mut self, controller: C) -> &mut Self {
        let controller = Arc::new(controller);
        let mut table = ActionTable { actions: Vec::new() };
        C::actions(&mut table);

        let actions = table
            .actions
            .into_iter()
            .map(|(name, action)| {
                let handle: ActionHandle = Arc::new(BoundAction { controller: Arc::clone(&controller), action });
                (name, handle)
            })
            .collect();

        let erased: Arc<dyn ErasedController> = controller;
        if self.controllers.insert(C::NAME, Registered { controller: erased, actions }).is_some() {
            warn!(controller = C::NAME, "controller registered twice; keeping the last one");
        }
        self
    }

    /// Looks up a registered action.
    pub fn lookup(&self, controller: &str, action: &str) -> Option<ActionHandle> {
        self.controllers.get(controller)?.actions.get(action).cloned()
    }

    pub fn contains_controller(&self, controller: &str) -> bool {
        self.controllers.contains_key(controller)
    }

    pub(crate) fn controller(&self, name: &str) -> Option<Arc<dyn ErasedController>> {
        self.controllers.get(name).map(|r| Arc::clone(&r.controller))
    }

    /// Registered action names of a controller, sorted.
    pub fn actions_of(&self, controller: &str) -> Vec<&str> {
        let mut names: Vec<_> = self
            .controllers
            .get(controller)
            .map(|r| r.actions.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}
