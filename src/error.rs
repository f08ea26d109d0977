//! Unified error types.

use std::path::PathBuf;

/// The error type returned by trellis' fallible startup operations.
///
/// Application-level failures (404, 500, etc.) never surface as `Error`s;
/// the dispatcher turns them into responses. This type covers what must
/// stop the server from starting: unreadable files, bad configuration,
/// route tables that reference missing actions, and missing TLS material.
/// Reverse-routing failures convert into it for callers using `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("tls: {0}")]
    Tls(String),

    #[error("invalid address `{0}`")]
    Address(String),

    #[error(transparent)]
    Reverse(#[from] ReverseError),
}

/// A route table could not be compiled.
///
/// Carries the route file and the 1-based line of the offending route so a
/// typo is reported where it was made.
#[derive(Debug, thiserror::Error)]
#[error("route validation error; {message}; {}; line {line}", source_file.display())]
pub struct RouteError {
    pub message: String,
    pub source_file: PathBuf,
    pub line: usize,
}

impl RouteError {
    pub(crate) fn new(message: impl Into<String>, source_file: PathBuf, line: usize) -> Self {
        Self { message: message.into(), source_file, line }
    }
}

/// Reverse routing failed to build a URL for an action.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReverseError {
    #[error("invalid action `{0}`; expected Controller.Action")]
    InvalidAction(String),

    #[error("no route leads to `{0}`")]
    NoRoute(String),

    #[error("route for `{action}` needs argument `{name}`")]
    MissingArgument { action: String, name: String },
}

/// A failure while producing the response body for a request.
///
/// Always recovered inside the dispatcher: logged, and converted into a
/// 500 when nothing has been written yet.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("marshal: {0}")]
    Marshal(String),

    #[error("template `{0}` not found")]
    TemplateNotFound(String),

    #[error("template: {0}")]
    Template(String),

    #[error("controller `{0}` has no layout configured")]
    NoLayout(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_error_names_file_and_line() {
        let e = RouteError::new("controller `Shop` is not registered", "conf/routes".into(), 7);
        assert_eq!(
            e.to_string(),
            "route validation error; controller `Shop` is not registered; conf/routes; line 7"
        );
    }

    #[test]
    fn reverse_error_converts() {
        let e: Error = ReverseError::NoRoute("Shop.List".into()).into();
        assert_eq!(e.to_string(), "no route leads to `Shop.List`");
    }
}
