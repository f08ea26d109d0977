//! Route descriptors and route-file loading.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::Error;
use crate::method::RouteMethod;
use crate::routing::parser::{decode_fixed_args, parse_line};

/// Action name that marks a route as an explicit "not found" terminal.
pub const NOT_FOUND_ACTION: &str = "404";

/// Where a route was declared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: PathBuf,
    /// 1-based.
    pub line: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// One compiled line of a route file. Immutable once built.
#[derive(Clone, Debug)]
pub struct Route {
    pub method: RouteMethod,
    /// e.g. `/app/:id` or `/static/*filepath`
    pub path: String,
    /// e.g. `Application.ShowApp`, `404`
    pub action: String,
    /// e.g. `Application`, or `:controller`; empty for `404`
    pub controller: String,
    /// e.g. `ShowApp`, or `:action`; empty for `404`
    pub action_name: String,
    /// Shared with every match produced from this route.
    pub fixed_params: Arc<[String]>,
    pub tls_only: bool,
    pub source: SourceLocation,
}

impl Route {
    pub fn new(
        method: RouteMethod,
        path: impl Into<String>,
        action: impl Into<String>,
        fixed_params: Vec<String>,
        tls_only: bool,
        source: SourceLocation,
    ) -> Self {
        let action = action.into();
        let (controller, action_name) = match action.split_once('.') {
            Some((c, a)) if !a.contains('.') => (c.to_owned(), a.to_owned()),
            _ => (String::new(), String::new()),
        };
        Self {
            method,
            path: path.into(),
            action,
            controller,
            action_name,
            fixed_params: fixed_params.into(),
            tls_only,
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.action == NOT_FOUND_ACTION
    }

    pub(crate) fn controller_is_variable(&self) -> bool {
        self.controller.starts_with(':')
    }

    pub(crate) fn action_is_variable(&self) -> bool {
        self.action_name.starts_with(':')
    }
}

/// Parses the content of one route file.
///
/// Malformed lines are logged with their line number and skipped; the rest
/// of the file still loads. `prefix` is prepended to every path, which lets
/// one route file be mounted below another.
pub fn parse_routes(content: &str, source: &Path, prefix: &str) -> Vec<Route> {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    let mut routes = Vec::new();

    for (n, line) in content.lines().enumerate() {
        let line_no = n + 1;
        let parsed = match parse_line(line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(failure) => {
                let upto = line.get(..failure.offset).unwrap_or(line);
                error!(
                    file = %source.display(),
                    line = line_no,
                    offset = failure.offset,
                    "route error: {upto} <<[{}] {}",
                    failure.offset,
                    failure.message,
                );
                continue;
            }
        };

        let fixed = match decode_fixed_args(&parsed.fixed_args) {
            Ok(fixed) => fixed,
            Err((partial, message)) => {
                warn!(
                    file = %source.display(),
                    line = line_no,
                    "invalid fixed parameters ({message}) for `{}`",
                    parsed.fixed_args,
                );
                partial
            }
        };

        routes.push(Route::new(
            parsed.method,
            format!("{prefix}{}", parsed.path),
            parsed.action,
            fixed,
            parsed.tls,
            SourceLocation { file: source.to_path_buf(), line: line_no },
        ));
    }

    routes
}

/// Splits a `;`-joined list of route files.
pub fn split_route_files(list: &str) -> Vec<PathBuf> {
    list.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Reads every route file in order; later files append after earlier ones.
pub fn load_route_files(files: &[PathBuf]) -> Result<Vec<Route>, Error> {
    let mut routes = Vec::new();
    for file in files {
        let content = std::fs::read_to_string(file)?;
        routes.extend(parse_routes(&content, file, ""));
    }
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = r#"
# application routes
GET     /                 App.Index
GET     /login            App.Login         # sign in
POST    /action/:id       Home.Action("okay","(())")
BOGUS   /nope             App.Nope
WS      /ws/chat          Chat.WSChat TLS
GET     /gone             404
"#;

    #[test]
    fn skips_bad_lines_and_keeps_line_numbers() {
        let routes = parse_routes(ROUTES, Path::new("conf/routes"), "");
        let actions: Vec<_> = routes.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, ["App.Index", "App.Login", "Home.Action", "Chat.WSChat", "404"]);
        assert_eq!(routes[1].source.line, 4);
        assert_eq!(routes[3].source.to_string(), "conf/routes:7");
    }

    #[test]
    fn splits_controller_and_action() {
        let routes = parse_routes(ROUTES, Path::new("routes"), "");
        assert_eq!(routes[2].controller, "Home");
        assert_eq!(routes[2].action_name, "Action");
        assert_eq!(&*routes[2].fixed_params, ["okay", "(())"]);
        assert!(routes[3].tls_only);
        assert!(routes[4].is_not_found());
        assert!(routes[4].controller.is_empty());
    }

    #[test]
    fn mount_prefix_does_not_double_slash() {
        let routes = parse_routes("GET /users Users.List", Path::new("admin"), "/admin/");
        assert_eq!(routes[0].path, "/admin/users");
    }

    #[test]
    fn splits_file_list() {
        let files = split_route_files("conf/routes; conf/admin.routes;");
        assert_eq!(files, [PathBuf::from("conf/routes"), PathBuf::from("conf/admin.routes")]);
    }
}
