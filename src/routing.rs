//! # Routing Table
//!
//! Maps the name of an intercepted function to the name of the function that should run
//! instead. Entries come from a loosely formatted mapping document of `"source":"target"`
//! string pairs. Sources are literal names or glob patterns (`*` matches any run of
//! characters, `?` matches exactly one).
//!
//! Literal entries always beat pattern entries. Among pattern entries the first one in
//! document order wins. A name that no entry matches resolves to itself.
//!
//! A process-wide table is available through [`RoutingTable::global`]. It is loaded from the
//! file named by the `WRAP_MAP` environment variable on first use and never changes afterwards.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, trace, warn};

use crate::errors::Result;
use crate::launcher::map_path_from_env;

static GLOBAL_TABLE: OnceLock<RoutingTable> = OnceLock::new();

/// A source pattern compiled for matching against symbol names
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// A plain name, compared for equality
    Exact(String),
    /// A glob, compiled to an anchored regex
    Glob(Regex),
}

impl NamePattern {
    /// Compiles `pattern`; it is a glob if it contains `*` or `?`
    pub fn compile(pattern: &str) -> Result<Self> {
        if !is_glob(pattern) {
            return Ok(Self::Exact(pattern.to_string()));
        }
        Ok(Self::Glob(glob_to_regex(pattern)?))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(s) => s == name,
            Self::Glob(regex) => regex.is_match(name),
        }
    }
}

#[inline]
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Converts a glob to a case sensitive regex anchored at both ends
fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push_str("(?s)^");
    let mut literal = String::new();
    for c in glob.chars() {
        match c {
            '*' | '?' => {
                re.push_str(&regex::escape(&literal));
                literal.clear();
                re.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    re.push_str(&regex::escape(&literal));
    re.push('$');
    Ok(Regex::new(&re)?)
}

/// Name to name mapping with literal and pattern entries
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    exact: HashMap<String, String>,
    wildcard: Vec<(NamePattern, String)>,
}

impl RoutingTable {
    /// A table without entries, every name resolves to itself
    pub fn empty() -> Self {
        Self::default()
    }

    /// The process-wide table, loaded from `$WRAP_MAP` (or `./function_map.json`) on first use
    pub fn global() -> &'static RoutingTable {
        GLOBAL_TABLE.get_or_init(|| Self::from_file(map_path_from_env()))
    }

    /// Loads a table from a mapping file
    ///
    /// A missing or unreadable file is not an error: the table is empty and every lookup is
    /// the identity.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(document) => {
                let table = Self::parse(&document);
                debug!(
                    "loaded {} routing entries from {}",
                    table.len(),
                    path.display()
                );
                table
            }
            Err(e) => {
                debug!("no routing table at {}: {e}", path.display());
                Self::empty()
            }
        }
    }

    /// Builds a table from the `"key":"value"` pairs found in `document`, in document order
    ///
    /// Content between pairs is ignored. A pair whose pattern cannot be compiled is skipped.
    pub fn parse(document: &str) -> Self {
        let mut table = Self::empty();
        for (key, value) in scan_pairs(document) {
            if let Err(e) = table.insert(key, value) {
                warn!("skipping routing entry {key:?}: {e}");
            }
        }
        table
    }

    /// Adds an entry; a later literal entry for the same name replaces the earlier one
    pub fn insert(&mut self, source: &str, target: &str) -> Result<()> {
        if is_glob(source) {
            let pattern = NamePattern::compile(source)?;
            self.wildcard.push((pattern, target.to_string()));
        } else {
            self.exact.insert(source.to_string(), target.to_string());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the name that calls to `name` should be routed to
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        if let Some(target) = self.exact.get(name) {
            if !target.is_empty() {
                return target;
            }
        }
        self.wildcard
            .iter()
            .find(|(pattern, target)| !target.is_empty() && pattern.matches(name))
            .map(|(_, target)| target.as_str())
            .unwrap_or(name)
    }

    /// Whether any entry, literal or pattern, names `name` as a source
    pub fn intercepts(&self, name: &str) -> bool {
        self.exact.contains_key(name) || self.wildcard.iter().any(|(p, _)| p.matches(name))
    }
}

/// Extracts quoted key/value pairs the way a forgiving reader would
///
/// Looks for a quoted key, then a `:`, then a quoted value. Scanning stops at the first
/// truncated pair. Empty keys are dropped.
fn scan_pairs(document: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut rest = document;
    loop {
        let Some(k1) = rest.find('"') else { break };
        let Some(k2) = rest[k1 + 1..].find('"').map(|i| i + k1 + 1) else {
            break;
        };
        let key = &rest[k1 + 1..k2];
        let Some(colon) = rest[k2..].find(':').map(|i| i + k2) else {
            break;
        };
        let Some(v1) = rest[colon..].find('"').map(|i| i + colon) else {
            break;
        };
        let Some(v2) = rest[v1 + 1..].find('"').map(|i| i + v1 + 1) else {
            break;
        };
        let value = &rest[v1 + 1..v2];
        if key.is_empty() {
            trace!("dropping routing pair with empty key");
        } else {
            pairs.push((key, value));
        }
        rest = &rest[v2 + 1..];
    }
    pairs
}
