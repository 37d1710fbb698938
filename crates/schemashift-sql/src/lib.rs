//! SQL text helpers.
//!
//! Quoting and escaping for generated DDL, whitespace normalization for
//! comparing definitions, and the blake3-based content hashes that make
//! change ids and fingerprints deterministic.

use std::fmt;

/// Prefix of the object comment that carries a definition fingerprint.
pub const FINGERPRINT_PREFIX: &str = "schemashift:";

/// A PostgreSQL string literal wrapper.
///
/// Display writes the value escaped and quoted with single quotes.
///
/// # Example
/// ```
/// use schemashift_sql::Lit;
/// assert_eq!(format!("{}", Lit("foo")), "'foo'");
/// assert_eq!(format!("{}", Lit("it's")), "'it''s'");
/// ```
pub struct Lit<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Lit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'")?;
        for c in self.0.as_ref().chars() {
            if c == '\'' {
                write!(f, "''")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "'")
    }
}

/// A PostgreSQL identifier wrapper.
///
/// Display writes the value escaped and quoted with double quotes.
///
/// # Example
/// ```
/// use schemashift_sql::Ident;
/// assert_eq!(format!("{}", Ident("order")), "\"order\"");
/// assert_eq!(format!("{}", Ident("bla\"h")), "\"bla\"\"h\"");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// Quote a PostgreSQL identifier.
///
/// Always quotes, so reserved words like `order` or `user` are safe as
/// object names. Doubles any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("{}", Ident(name))
}

/// Wrap a routine body in dollar quotes, picking a tag the body does not contain.
///
/// ```
/// use schemashift_sql::dollar_quote;
/// assert_eq!(dollar_quote("SELECT 1"), "$$SELECT 1$$");
/// assert_eq!(dollar_quote("x $$ y"), "$body$x $$ y$body$");
/// ```
pub fn dollar_quote(body: &str) -> String {
    if !body.contains("$$") {
        return format!("$${}$$", body);
    }
    let mut n = 0usize;
    loop {
        let tag = if n == 0 {
            "$body$".to_string()
        } else {
            format!("$body{}$", n)
        };
        if !body.contains(&tag) {
            return format!("{tag}{body}{tag}");
        }
        n += 1;
    }
}

/// Collapse whitespace runs outside of quoted sections and trim trailing
/// semicolons, so that two spellings of the same statement compare equal.
///
/// Quoted literals (`'...'`) and quoted identifiers (`"..."`) are kept verbatim.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;

    let mut in_single_quote = false;
    let mut in_double_quote = false;

    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_single_quote {
            out.push(ch);
            if ch == '\'' {
                // SQL escapes single quotes by doubling them: ''
                if let Some(escaped) = chars.next_if_eq(&'\'') {
                    out.push(escaped);
                } else {
                    in_single_quote = false;
                }
            }
            continue;
        }

        if in_double_quote {
            out.push(ch);
            if ch == '"' {
                if let Some(escaped) = chars.next_if_eq(&'"') {
                    out.push(escaped);
                } else {
                    in_double_quote = false;
                }
            }
            continue;
        }

        match ch {
            '\'' | '"' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(ch);
                if ch == '\'' {
                    in_single_quote = true;
                } else {
                    in_double_quote = true;
                }
            }
            c if c.is_whitespace() => {
                pending_space = true;
            }
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }

    let trimmed = out.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    trimmed.trim_start().to_string()
}

/// Hash a sequence of text parts into a hex digest.
///
/// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` hash
/// differently.
pub fn content_hash<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().to_hex().to_string()
}

/// Render the object comment that stores a fingerprint.
pub fn fingerprint_comment(fingerprint: &str) -> String {
    format!("{}{}", FINGERPRINT_PREFIX, fingerprint)
}

/// Extract a fingerprint from an object comment, if it carries one.
///
/// ```
/// use schemashift_sql::parse_fingerprint_comment;
/// assert_eq!(parse_fingerprint_comment("schemashift:abc123"), Some("abc123"));
/// assert_eq!(parse_fingerprint_comment("hand-written view"), None);
/// ```
pub fn parse_fingerprint_comment(comment: &str) -> Option<&str> {
    let rest = comment.trim().strip_prefix(FINGERPRINT_PREFIX)?;
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(rest)
    } else {
        None
    }
}
