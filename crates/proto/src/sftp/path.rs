//! Syntactic path manipulation with on-demand canonicalization.
//!
//! Everything here is string algebra over a configured separator; the one
//! exception, [`PathHelper::canonical`], delegates to a caller-provided
//! hook (the engine's REALPATH round trip) and performs no I/O itself.

use skiff_platform::SkiffResult;
use std::sync::Arc;

/// Default path separator.
pub const DEFAULT_PATH_SEPARATOR: &str = "/";

/// Resolves a path to its canonical remote form.
#[async_trait::async_trait]
pub trait Canonicalizer: Send + Sync {
    /// Canonicalizes `path` on the remote server.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails remotely.
    async fn canonicalize(&self, path: &str) -> SkiffResult<String>;
}

/// A path split into its parent and final component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathComponents {
    /// Everything before the final separator; empty for bare names
    pub parent: String,
    /// The final component
    pub name: String,
}

impl PathComponents {
    /// Creates components from parts.
    pub fn new(parent: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            name: name.into(),
        }
    }
}

/// Pure path algebra over a configured separator.
pub struct PathHelper {
    canonicalizer: Arc<dyn Canonicalizer>,
    separator: String,
}

impl PathHelper {
    /// Creates a helper with the given canonicalization hook and separator.
    pub fn new(canonicalizer: Arc<dyn Canonicalizer>, separator: impl Into<String>) -> Self {
        Self {
            canonicalizer,
            separator: separator.into(),
        }
    }

    /// The configured separator.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Strips trailing separators, leaving a bare root untouched.
    pub fn trim_trailing_separator<'a>(&self, path: &'a str) -> &'a str {
        let mut trimmed = path;
        while trimmed.len() > self.separator.len() && trimmed.ends_with(self.separator.as_str()) {
            trimmed = &trimmed[..trimmed.len() - self.separator.len()];
        }
        trimmed
    }

    /// Collapses runs of the separator and strips any trailing one.
    pub fn normalize(&self, path: &str) -> String {
        if path.is_empty() {
            return String::new();
        }
        let sep = self.separator.as_str();
        let double = format!("{}{}", sep, sep);
        let mut normalized = path.to_string();
        while normalized.contains(&double) {
            normalized = normalized.replace(&double, sep);
        }
        self.trim_trailing_separator(&normalized).to_string()
    }

    /// Splits a path into parent and final component.
    pub fn components(&self, path: &str) -> PathComponents {
        let sep = self.separator.as_str();
        if path.is_empty() {
            return PathComponents::new("", "");
        }
        if path == sep {
            return PathComponents::new("", sep);
        }
        let trimmed = self.trim_trailing_separator(path);
        match trimmed.rfind(sep) {
            Some(0) => PathComponents::new(sep, &trimmed[sep.len()..]),
            Some(idx) => PathComponents::new(&trimmed[..idx], &trimmed[idx + sep.len()..]),
            None => PathComponents::new("", trimmed),
        }
    }

    /// Parent of `path`; empty for bare names.
    pub fn parent(&self, path: &str) -> String {
        self.components(path).parent
    }

    /// Final component of `path`.
    pub fn leaf(&self, path: &str) -> String {
        self.components(path).name
    }

    /// Joins two path fragments with exactly one separator.
    ///
    /// An absolute `child` wins outright, as it does at a shell.
    pub fn join(&self, parent: &str, child: &str) -> String {
        let sep = self.separator.as_str();
        if child.starts_with(sep) {
            return child.to_string();
        }
        if parent.is_empty() {
            return child.to_string();
        }
        format!("{}{}{}", self.trim_trailing_separator(parent), sep, child)
    }

    /// Canonicalizes `path` through the configured hook.
    ///
    /// # Errors
    ///
    /// Propagates the hook's failure.
    pub async fn canonical(&self, path: &str) -> SkiffResult<String> {
        self.canonicalizer.canonicalize(path).await
    }
}

impl std::fmt::Debug for PathHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHelper")
            .field("separator", &self.separator)
            .finish_non_exhaustive()
    }
}
