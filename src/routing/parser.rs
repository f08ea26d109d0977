//! Route-line grammar.
//!
//! ```text
//! METHOD /path/:param/* Controller.Action("fixed1","fixed2") TLS  # comment
//! ```
//!
//! A line is read left to right exactly once. A stage counter says which
//! column is being collected; there is no token table. Quoting rules for the
//! fixed-argument list live in one match arm.

use std::fmt;

use crate::method::RouteMethod;

/// The columns of one accepted route line, before any validation against
/// registered controllers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedLine {
    pub method: RouteMethod,
    pub path: String,
    pub action: String,
    /// Raw fixed-argument text with insignificant whitespace removed, e.g.
    /// `"okay","(())"`. Decoded by [`decode_fixed_args`].
    pub fixed_args: String,
    pub tls: bool,
}

impl fmt::Display for ParsedLine {
    /// Writes the line back in route-file form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.path, self.action)?;
        if !self.fixed_args.is_empty() {
            write!(f, "({})", self.fixed_args)?;
        }
        if self.tls {
            f.write_str(" TLS")?;
        }
        Ok(())
    }
}

/// Why a line was rejected and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseFailure {
    pub message: String,
    /// Byte offset into the line at which parsing stopped.
    pub offset: usize,
}

impl ParseFailure {
    fn at(offset: usize, message: impl Into<String>) -> Self {
        Self { message: message.into(), offset }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Method,
    Path,
    Action,
    FixedArgs,
    Tls,
    Trailing,
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Parses one route line.
///
/// Returns `Ok(None)` for blank and comment-only lines.
pub fn parse_line(line: &str) -> Result<Option<ParsedLine>, ParseFailure> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let mut stage = Stage::Method;
    let mut begun = false;
    let mut quoted = false;
    let mut backslashes = 0usize;
    let mut buf = String::new();

    let mut method = None;
    let mut path = String::new();
    let mut action = String::new();
    let mut fixed_args = String::new();
    let mut tls = false;

    for (i, c) in line.char_indices() {
        match stage {
            Stage::Method => {
                if !begun {
                    if !is_blank(c) {
                        begun = true;
                        buf.push(c);
                    }
                } else if is_blank(c) {
                    match buf.parse::<RouteMethod>() {
                        Ok(m) => method = Some(m),
                        Err(()) => {
                            return Err(ParseFailure::at(i, format!("method {buf} is not valid")));
                        }
                    }
                    buf.clear();
                    begun = false;
                    stage = Stage::Path;
                } else {
                    buf.push(c);
                }
            }
            Stage::Path => {
                if !begun {
                    if is_blank(c) {
                        continue;
                    }
                    if c != '/' {
                        return Err(ParseFailure::at(i, "paths must begin with a slash"));
                    }
                    begun = true;
                    buf.push(c);
                } else if is_blank(c) {
                    path = std::mem::take(&mut buf);
                    begun = false;
                    stage = Stage::Action;
                } else {
                    buf.push(c);
                }
            }
            Stage::Action => {
                if !begun {
                    if is_blank(c) {
                        continue;
                    }
                    if c == '#' || c == '(' {
                        return Err(ParseFailure::at(i, "missing action"));
                    }
                    begun = true;
                    buf.push(c);
                } else if is_blank(c) || c == '(' {
                    action = std::mem::take(&mut buf);
                    begun = false;
                    stage = if c == '(' { Stage::FixedArgs } else { Stage::Tls };
                } else {
                    buf.push(c);
                }
            }
            Stage::FixedArgs => {
                if !begun {
                    match c {
                        '#' => {
                            return Err(ParseFailure::at(i, "comment inside the fixed-argument list"));
                        }
                        ')' => stage = Stage::Tls,
                        '"' => {
                            begun = true;
                            quoted = true;
                            buf.push(c);
                        }
                        c if is_blank(c) => {}
                        c => {
                            return Err(ParseFailure::at(i, format!("bad character ({c}) between fixed arguments")));
                        }
                    }
                } else if quoted {
                    if c == '\\' {
                        backslashes += 1;
                    } else {
                        // An even run of backslashes escapes itself, not the quote.
                        if c == '"' && backslashes % 2 == 0 {
                            quoted = false;
                        }
                        backslashes = 0;
                    }
                    buf.push(c);
                } else {
                    match c {
                        ')' => {
                            fixed_args = std::mem::take(&mut buf);
                            begun = false;
                            stage = Stage::Tls;
                        }
                        '"' => {
                            quoted = true;
                            buf.push(c);
                        }
                        ',' => buf.push(c),
                        c if is_blank(c) => {}
                        c => {
                            return Err(ParseFailure::at(i, format!("bad character ({c}) between fixed arguments")));
                        }
                    }
                }
            }
            Stage::Tls => {
                if !begun {
                    if c == '#' {
                        break;
                    }
                    if !is_blank(c) {
                        begun = true;
                        buf.push(c);
                    }
                } else if c == '#' {
                    return Err(ParseFailure::at(i, "found a comment while parsing the TLS marker"));
                } else if is_blank(c) {
                    if buf != "TLS" {
                        return Err(ParseFailure::at(i, format!("TLS parameter `{buf}` invalid")));
                    }
                    tls = true;
                    buf.clear();
                    begun = false;
                    stage = Stage::Trailing;
                } else {
                    buf.push(c);
                }
            }
            Stage::Trailing => {
                if c == '#' {
                    break;
                }
                if !is_blank(c) {
                    return Err(ParseFailure::at(i, format!("unexpected ({c}) after the TLS marker")));
                }
            }
        }
    }

    let end = line.len();
    match stage {
        Stage::Method | Stage::Path => {
            return Err(ParseFailure::at(end, "end of line before the action"));
        }
        Stage::Action => {
            if !begun {
                return Err(ParseFailure::at(end, "missing action"));
            }
            action = buf;
        }
        Stage::FixedArgs => {
            return Err(ParseFailure::at(end, "unterminated fixed-argument list"));
        }
        Stage::Tls => {
            if begun {
                if buf != "TLS" {
                    return Err(ParseFailure::at(end, format!("TLS parameter `{buf}` invalid")));
                }
                tls = true;
            }
        }
        Stage::Trailing => {}
    }

    let Some(method) = method else {
        return Err(ParseFailure::at(end, "end of line before the action"));
    };

    Ok(Some(ParsedLine { method, path, action, fixed_args, tls }))
}

/// Decodes raw fixed-argument text into its ordered values.
///
/// CSV rules with leading whitespace trimmed per field. Inside a quoted
/// value both `""` and `\"` stand for a literal quote. On malformed input
/// the values decoded before the fault are returned alongside the message.
pub fn decode_fixed_args(raw: &str) -> Result<Vec<String>, (Vec<String>, String)> {
    let mut fields = Vec::new();
    if raw.trim().is_empty() {
        return Ok(fields);
    }

    let mut chars = raw.chars().peekable();
    loop {
        while chars.next_if(|c| is_blank(*c)).is_some() {}

        let mut field = String::new();
        if chars.next_if_eq(&'"').is_some() {
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' if chars.peek().is_some_and(|n| *n == '"' || *n == '\\') => {
                        if let Some(escaped) = chars.next() {
                            field.push(escaped);
                        }
                    }
                    '"' if chars.next_if_eq(&'"').is_some() => field.push('"'),
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => field.push(c),
                }
            }
            if !closed {
                return Err((fields, "unterminated quoted value".to_owned()));
            }
            while chars.next_if(|c| is_blank(*c)).is_some() {}
            match chars.peek() {
                None | Some(',') => {}
                Some(c) => {
                    let msg = format!("unexpected ({c}) after a quoted value");
                    return Err((fields, msg));
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                if c == '"' {
                    return Err((fields, "bare quote in an unquoted value".to_owned()));
                }
                field.push(c);
            }
        }

        fields.push(field);
        if chars.next().is_none() {
            break;
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(line: &str) -> ParsedLine {
        match parse_line(line) {
            Ok(Some(parsed)) => parsed,
            other => panic!("`{line}` should parse, got {other:?}"),
        }
    }

    fn rejected(line: &str) -> ParseFailure {
        match parse_line(line) {
            Err(failure) => failure,
            other => panic!("`{line}` should be rejected, got {other:?}"),
        }
    }

    #[test]
    fn accepts_route_lines() {
        let cases: &[(&str, RouteMethod, &str, &str, &str, bool)] = &[
            ("GET  /login       App.Login         # A simple path", RouteMethod::Get, "/login", "App.Login", "", false),
            ("GET  /login       App.Login", RouteMethod::Get, "/login", "App.Login", "", false),
            ("WS   /ws/chat     Chat.WSChat  TLS  # Websocket chat", RouteMethod::Ws, "/ws/chat", "Chat.WSChat", "", true),
            ("WS   /ws/chat     Chat.WSChat  TLS", RouteMethod::Ws, "/ws/chat", "Chat.WSChat", "", true),
            (r#"POST /action/:id  Home.Action("okay", "(())") # Action"#, RouteMethod::Post, "/action/:id", "Home.Action", r#""okay","(())""#, false),
            (r#"POST /action/:id  Home.Action("okay", "(())")"#, RouteMethod::Post, "/action/:id", "Home.Action", r#""okay","(())""#, false),
            (r#"POST /action/:id  Home.Action("okay", "(())") TLS"#, RouteMethod::Post, "/action/:id", "Home.Action", r#""okay","(())""#, true),
            (r#"POST /action/:id  Home.Action("okay", "(())") TLS #Comment"#, RouteMethod::Post, "/action/:id", "Home.Action", r#""okay","(())""#, true),
            (
                r#"POST /action/:id  Home.Action("okay", "it is \"really\" corn") TLS #Comment"#,
                RouteMethod::Post, "/action/:id", "Home.Action", r#""okay","it is \"really\" corn""#, true,
            ),
            ("* /:controller/:action :controller.:action", RouteMethod::Any, "/:controller/:action", ":controller.:action", "", false),
            ("get /static/*filepath Static.Serve", RouteMethod::Get, "/static/*filepath", "Static.Serve", "", false),
            ("GET /empty App.Empty()", RouteMethod::Get, "/empty", "App.Empty", "", false),
        ];
        for (line, method, path, action, fixed, tls) in cases {
            let parsed = ok(line);
            assert_eq!(parsed.method, *method, "{line}");
            assert_eq!(parsed.path, *path, "{line}");
            assert_eq!(parsed.action, *action, "{line}");
            assert_eq!(parsed.fixed_args, *fixed, "{line}");
            assert_eq!(parsed.tls, *tls, "{line}");
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in [
            "GET  /login      # A simple path",
            "GET  login      # A simple path",
            "NO  /login  Login(\"a\")    # A simple path",
            "GET  /login App.Login( ",
            "GET  /login App.Login( notquoted ) ",
            "GET  /login App.Login TLz ",
            "GET  /login App.Login TLS extra",
            "GET  /login App.Login(\"a\" # oops )",
            "GET",
            "GET /login",
        ] {
            rejected(line);
        }
    }

    #[test]
    fn failure_reports_offset() {
        let failure = rejected("NOPE /x A.B");
        assert_eq!(failure.offset, 4);
        assert!(failure.message.contains("NOPE"));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   \t"), Ok(None));
        assert_eq!(parse_line("  # GET /x A.B"), Ok(None));
    }

    #[test]
    fn trailing_comment_does_not_change_result() {
        let plain = ok(r#"PUT /a/:b Ctl.Act("x") TLS"#);
        let commented = ok(r#"PUT /a/:b Ctl.Act("x") TLS   # note"#);
        assert_eq!(plain, commented);
    }

    #[test]
    fn reserialized_lines_parse_identically() {
        for line in [
            "GET /login App.Login",
            r#"POST /action/:id Home.Action("okay", "(())") TLS"#,
            r#"* /files/* Files.Get("a\"b", "c")"#,
            "ws /chat Chat.Join TLS # comment",
        ] {
            let first = ok(line);
            let second = ok(&first.to_string());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn escaped_backslash_before_quote_closes_value() {
        let parsed = ok(r#"GET /x A.B("a\\", "b")"#);
        assert_eq!(parsed.fixed_args, r#""a\\","b""#);
        assert_eq!(decode_fixed_args(&parsed.fixed_args).unwrap(), vec![r"a\", "b"]);
    }

    #[test]
    fn decodes_fixed_args() {
        assert_eq!(decode_fixed_args(r#""okay","(())""#).unwrap(), vec!["okay", "(())"]);
        assert_eq!(
            decode_fixed_args(r#""okay","it is \"really\" corn""#).unwrap(),
            vec!["okay", r#"it is "really" corn"#],
        );
        assert_eq!(decode_fixed_args(r#""a""b", plain"#).unwrap(), vec![r#"a"b"#, "plain"]);
        assert!(decode_fixed_args("").unwrap().is_empty());
    }

    #[test]
    fn malformed_fixed_args_keep_decoded_prefix() {
        let (partial, message) = decode_fixed_args(r#""one","two"#).unwrap_err();
        assert_eq!(partial, vec!["one"]);
        assert!(message.contains("unterminated"));
    }
}
