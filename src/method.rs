//! Route-file verbs as a typed enum.
//!
//! Covers the verbs a route line may declare: the usual RFC 9110 methods,
//! `WS` for WebSocket endpoints and `*` for "any method".

use std::fmt;
use std::str::FromStr;

/// A verb accepted in the first column of a route line.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RouteMethod {
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Ws,
    /// `*`: matches every request method.
    Any,
}

impl RouteMethod {
    /// Returns the route-file spelling (e.g. `"GET"`, `"*"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete  => "DELETE",
            Self::Get     => "GET",
            Self::Head    => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch   => "PATCH",
            Self::Post    => "POST",
            Self::Put     => "PUT",
            Self::Ws      => "WS",
            Self::Any     => "*",
        }
    }

    /// Whether a WebSocket upgrade may be performed on a route with this verb.
    pub fn accepts_upgrade(self) -> bool {
        matches!(self, Self::Ws | Self::Any)
    }
}

/// Parses a route-file verb. Case-insensitive; route files are hand-written.
impl FromStr for RouteMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DELETE"  => Ok(Self::Delete),
            "GET"     => Ok(Self::Get),
            "HEAD"    => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "PATCH"   => Ok(Self::Patch),
            "POST"    => Ok(Self::Post),
            "PUT"     => Ok(Self::Put),
            "WS"      => Ok(Self::Ws),
            "*"       => Ok(Self::Any),
            _         => Err(()),
        }
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
