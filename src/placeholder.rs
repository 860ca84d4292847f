//! Placeholder expansion for formula step arguments.
//!
//! Formula steps refer to install locations that are only known at build time.
//! Arguments are parsed into literal and placeholder segments, then expanded
//! against a [`Scope`] describing one formula's keg.
//!
//! # Placeholders
//!
//! - `{prefix}` - the formula's keg, e.g. `<root>/Cellar/librm/2.1.1`
//! - `{bin}`, `{sbin}`, `{lib}`, `{libexec}`, `{include}`, `{share}`, `{etc}` -
//!   subdirectories of the keg
//! - `{root}` - the global install prefix
//! - `{name}`, `{version}`, `{jobs}`
//! - `{opt:<formula>}` - the stable `<root>/opt/<formula>` link of another formula
//!
//! `{{` and `}}` produce literal braces.
//!
//! # Example
//!
//! ```
//! use kegworks::placeholder::{Placeholder, Segment, parse};
//!
//! let segments = parse("--prefix={prefix}").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Literal("--prefix=".to_string()),
//!     Segment::Placeholder(Placeholder::Keg("prefix")),
//! ]);
//! ```

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Keg subdirectories addressable by placeholder, `prefix` being the keg itself.
pub const KEG_DIRS: &[&str] = &[
    "prefix", "bin", "sbin", "lib", "libexec", "include", "share", "etc",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `{prefix}` or one of its subdirectories.
    Keg(&'static str),
    Root,
    Name,
    Version,
    Jobs,
    /// `{opt:<formula>}`
    Opt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
    #[error("unclosed placeholder at position {0}")]
    Unclosed(usize),

    #[error("unmatched '}}' at position {0}")]
    Unmatched(usize),

    #[error("unknown placeholder {{{0}}}")]
    Unknown(String),
}

/// Split `input` into literal and placeholder segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err(PlaceholderError::Unmatched(pos)),
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for (_, k) in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(PlaceholderError::Unclosed(pos));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(classify(&key)?));
            }
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

fn classify(key: &str) -> Result<Placeholder, PlaceholderError> {
    if let Some(dir) = KEG_DIRS.iter().find(|d| **d == key) {
        return Ok(Placeholder::Keg(*dir));
    }

    match key {
        "root" => Ok(Placeholder::Root),
        "name" => Ok(Placeholder::Name),
        "version" => Ok(Placeholder::Version),
        "jobs" => Ok(Placeholder::Jobs),
        _ => match key.strip_prefix("opt:") {
            Some(formula) if !formula.is_empty() && !formula.contains('/') => {
                Ok(Placeholder::Opt(formula.to_string()))
            }
            _ => Err(PlaceholderError::Unknown(key.to_string())),
        },
    }
}

/// Check an argument without expanding it.
pub fn validate(input: &str) -> Result<(), PlaceholderError> {
    parse(input).map(|_| ())
}

/// Values placeholders expand to for one formula.
#[derive(Debug, Clone)]
pub struct Scope {
    pub root: PathBuf,
    pub keg: PathBuf,
    pub name: String,
    pub version: String,
    pub jobs: usize,
}

impl Scope {
    pub fn new(root: &Path, keg: &Path, name: &str, version: &str, jobs: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            keg: keg.to_path_buf(),
            name: name.to_string(),
            version: version.to_string(),
            jobs,
        }
    }

    fn resolve(&self, placeholder: &Placeholder) -> String {
        match placeholder {
            Placeholder::Keg("prefix") => self.keg.display().to_string(),
            Placeholder::Keg(dir) => self.keg.join(dir).display().to_string(),
            Placeholder::Root => self.root.display().to_string(),
            Placeholder::Name => self.name.clone(),
            Placeholder::Version => self.version.clone(),
            Placeholder::Jobs => self.jobs.to_string(),
            Placeholder::Opt(formula) => self.root.join("opt").join(formula).display().to_string(),
        }
    }

    /// Expand every placeholder in `input`.
    pub fn expand(&self, input: &str) -> Result<String, PlaceholderError> {
        let mut out = String::with_capacity(input.len());
        for segment in parse(input)? {
            match segment {
                Segment::Literal(text) => out.push_str(&text),
                Segment::Placeholder(p) => out.push_str(&self.resolve(&p)),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(
            Path::new("/opt/keg"),
            Path::new("/opt/keg/Cellar/librm/2.1.1"),
            "librm",
            "2.1.1",
            4,
        )
    }

    #[test]
    fn test_expand_keg_dirs() {
        let s = scope();
        assert_eq!(
            s.expand("--prefix={prefix}").unwrap(),
            "--prefix=/opt/keg/Cellar/librm/2.1.1"
        );
        assert_eq!(
            s.expand("{lib}/rm/*dylib").unwrap(),
            "/opt/keg/Cellar/librm/2.1.1/lib/rm/*dylib"
        );
    }

    #[test]
    fn test_expand_root_and_opt() {
        let s = scope();
        assert_eq!(
            s.expand("{opt:glib}/bin/glib-compile-schemas").unwrap(),
            "/opt/keg/opt/glib/bin/glib-compile-schemas"
        );
        assert_eq!(
            s.expand("{root}/share/icons/hicolor").unwrap(),
            "/opt/keg/share/icons/hicolor"
        );
        assert_eq!(s.expand("-j{jobs}").unwrap(), "-j4");
        assert_eq!(s.expand("{name}-{version}").unwrap(), "librm-2.1.1");
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(scope().expand("{{literal}}").unwrap(), "{literal}");
    }

    #[test]
    fn test_unknown_placeholder() {
        assert_eq!(
            validate("{cellar}"),
            Err(PlaceholderError::Unknown("cellar".to_string()))
        );
        assert!(validate("{opt:}").is_err());
        assert!(validate("{opt:tabos/rogerrouter/libgdata}").is_err());
    }

    #[test]
    fn test_unclosed_and_unmatched() {
        assert_eq!(validate("--prefix={prefix"), Err(PlaceholderError::Unclosed(9)));
        assert_eq!(validate("a}b"), Err(PlaceholderError::Unmatched(1)));
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(scope().expand("ninja").unwrap(), "ninja");
        assert!(parse("").unwrap().is_empty());
    }
}
