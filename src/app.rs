//! Application assembly.
//!
//! [`App`] collects configuration, controllers, filters and collaborators,
//! then [`App::build`] loads and validates the routes and returns the
//! [`Dispatcher`] the server runs. Nothing here is global: two apps built
//! in one process share no state.

use std::sync::Arc;

use crate::action::{BoxFuture, Controller, Registry};
use crate::config::AppConfig;
use crate::dispatch::{Dispatcher, error_page};
use crate::error::Error;
use crate::filter::Filter;
use crate::i18n::{NoTranslation, Translator, resolve_language};
use crate::monitor::Monitor;
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::routing::route::split_route_files;
use crate::routing::{RouteSource, Router};
use crate::session::{MemorySessionStore, SessionProvider};
use crate::template::{NoTemplates, TemplateResolver};

/// Server-level collaborators every request can reach through
/// [`In`](crate::In).
pub struct Services {
    pub config: AppConfig,
    pub templates: Arc<dyn TemplateResolver>,
    pub sessions: Arc<dyn SessionProvider>,
    pub translator: Arc<dyn Translator>,
}

/// Handles requests that match no route, e.g. by serving static files.
pub trait Fallback: Send + Sync + 'static {
    fn handle(&self, req: Request, services: Arc<Services>) -> BoxFuture<'static, ResponseWriter>;
}

impl<F> Fallback for F
where
    F: Fn(Request, Arc<Services>) -> BoxFuture<'static, ResponseWriter> + Send + Sync + 'static,
{
    fn handle(&self, req: Request, services: Arc<Services>) -> BoxFuture<'static, ResponseWriter> {
        self(req, services)
    }
}

/// The default fallback: the 404 error page.
pub struct NotFound;

impl Fallback for NotFound {
    fn handle(&self, req: Request, services: Arc<Services>) -> BoxFuture<'static, ResponseWriter> {
        let lang = resolve_language(&req, &*services.translator, &services.config.default_language);
        Box::pin(async move { error_page(&services, &lang.code, http::StatusCode::NOT_FOUND) })
    }
}

pub struct App {
    config: AppConfig,
    registry: Registry,
    filters: Vec<Arc<dyn Filter>>,
    templates: Arc<dyn TemplateResolver>,
    sessions: Arc<dyn SessionProvider>,
    translator: Arc<dyn Translator>,
    fallback: Arc<dyn Fallback>,
    routes: Vec<RouteSource>,
}

impl App {
    /// Starts an app with in-memory sessions, no templates and no
    /// translations.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            filters: Vec::new(),
            templates: Arc::new(NoTemplates),
            sessions: Arc::new(MemorySessionStore::new()),
            translator: Arc::new(NoTranslation),
            fallback: Arc::new(NotFound),
            routes: Vec::new(),
        }
    }

    pub fn controller<C: Controller>(mut self, controller: C) -> Self {
        self.registry.register(controller);
        self
    }

    /// Appends a global filter; filters run in the order they were added.
    pub fn filter(mut self, filter: impl Filter) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn templates(mut self, templates: impl TemplateResolver + 'static) -> Self {
        self.templates = Arc::new(templates);
        self
    }

    /// Shared so the caller can keep a handle, e.g. to inspect or drop sessions.
    pub fn sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn translator(mut self, translator: impl Translator + 'static) -> Self {
        self.translator = Arc::new(translator);
        self
    }

    pub fn fallback(mut self, fallback: impl Fallback) -> Self {
        self.fallback = Arc::new(fallback);
        self
    }

    /// Adds route definitions held in memory. They load after the files
    /// named by `routes_config_path`.
    pub fn routes(mut self, name: &str, content: &str) -> Self {
        self.routes.push(RouteSource::Text { name: name.into(), content: content.to_owned() });
        self
    }

    /// Loads and validates the routes. Fails when a route file cannot be
    /// read or a route names an unknown controller or action.
    pub fn build(self) -> Result<Dispatcher, Error> {
        let mut sources: Vec<_> = split_route_files(&self.config.routes_config_path)
            .into_iter()
            .map(RouteSource::File)
            .collect();
        sources.extend(self.routes);

        let router = Router::new(sources, Arc::new(self.registry))?;
        let services = Services {
            config: self.config,
            templates: self.templates,
            sessions: self.sessions,
            translator: self.translator,
        };

        Ok(Dispatcher::new(
            Arc::new(router),
            self.filters.into(),
            Arc::new(services),
            Arc::new(Monitor::new()),
            self.fallback,
        ))
    }
}
