//! Call identities and their two-tier keys
//!
//! The hot path only ever computes a [`FastKey`]: a cheap hash of the call
//! identity that may collide. The expensive [`SlowKey`] (the stable
//! `"file:line"` name) is produced by an [`IdentityResolver`] at most once per
//! fast key and memoized by the registry.
//!
//! Collision tolerance: two different functions that happen to share a fast
//! key are both attributed to whichever slow key the first resolution produced.
//! With address-derived fast keys this requires two live functions at the same
//! address, so in practice it only happens after the host frees and reuses
//! function objects, and [`reset`](crate::registry::CallSiteRegistry::reset)
//! clears it.

use crate::classify::{Category, FileInfo, PathClassifier};
use crate::error::ResolveError;
use fnv::FnvHasher;
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Cheap, possibly colliding hot-path key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FastKey(pub u64);

impl FastKey {
    /// Identity hash: the address of the referenced value
    pub fn of_address<T: ?Sized>(value: &T) -> Self {
        FastKey(value as *const T as *const () as usize as u64)
    }

    /// FNV-1a hash of a value
    pub fn of_hash<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = FnvHasher::default();
        value.hash(&mut hasher);
        FastKey(hasher.finish())
    }
}

impl fmt::Display for FastKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Unique aggregation key
///
/// Ordering is used to break ranking ties deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlowKey {
    /// Stable `"source:line"` name
    Named(Arc<str>),
    /// Resolution failed; samples are kept under the fast key until it succeeds
    Unresolved(FastKey),
    /// Measurements of the engine itself
    Internal(&'static str),
}

impl SlowKey {
    pub fn named(name: &str) -> Self {
        SlowKey::Named(Arc::from(name))
    }

    pub fn stable_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlowKey::Named(name) => f.write_str(name),
            SlowKey::Unresolved(fast) => write!(f, "<unresolved {}>", fast),
            SlowKey::Internal(name) => write!(f, "<callstat {}>", name),
        }
    }
}

/// Anything the hook source can hand to the registry as "the function called"
pub trait CallIdentity {
    /// Must be O(1) and allocation free
    fn fast_key(&self) -> FastKey;
}

impl CallIdentity for Location<'static> {
    fn fast_key(&self) -> FastKey {
        FastKey::of_address(self)
    }
}

impl CallIdentity for str {
    fn fast_key(&self) -> FastKey {
        FastKey::of_hash(self)
    }
}

impl CallIdentity for FastKey {
    fn fast_key(&self) -> FastKey {
        *self
    }
}

/// Cold-path resolution of identities into stable names
///
/// Implementations are called at most once per fast key on the recording path
/// and must be thread safe. Errors and panics are absorbed by the registry.
pub trait IdentityResolver: Send + Sync {
    type Identity: CallIdentity + ?Sized;

    /// Stable `"source:line"` name of the identity
    fn resolve(&self, identity: &Self::Identity) -> Result<String, ResolveError>;

    /// Category and display path of a source path
    fn classify(&self, source_path: &str) -> FileInfo {
        FileInfo::unknown(source_path)
    }
}

/// Split `"path/to/file.ext:line"` into its path and line
///
/// A missing or non-numeric line yields line 0 and the whole name as path.
pub fn parse_stable_name(name: &str) -> (&str, u32) {
    match name.rfind(':') {
        Some(idx) if idx > 0 => match name[idx + 1..].parse() {
            Ok(line) => (&name[..idx], line),
            Err(_) => (name, 0),
        },
        _ => (name, 0),
    }
}

/// Display identity of a call site, derived on the cold path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteInfo {
    pub category: Category,
    pub relative_path: String,
    pub line: u32,
}

impl SiteInfo {
    /// Describe a slow key using the resolver's classification
    pub fn describe<R: IdentityResolver + ?Sized>(key: &SlowKey, resolver: &R) -> Self {
        match key {
            SlowKey::Named(name) => {
                let (path, line) = parse_stable_name(name);
                let info = resolver.classify(path);
                SiteInfo {
                    category: info.category,
                    relative_path: info.relative_path,
                    line,
                }
            }
            SlowKey::Unresolved(_) => SiteInfo {
                category: Category::Unknown,
                relative_path: key.to_string(),
                line: 0,
            },
            SlowKey::Internal(name) => SiteInfo {
                category: Category::Internal,
                relative_path: (*name).to_string(),
                line: 0,
            },
        }
    }

    /// Type column and `file:line` column for tabular output
    ///
    /// Mod categories show their top-level folder (the mod name) as the type
    /// and drop it from the path. Paths longer than 80 chars are truncated.
    pub fn display_columns(&self) -> (String, String) {
        let normalized = self.relative_path.replace('\\', "/");
        let (kind, path) = match self.category {
            Category::Internal => ("callstat".to_string(), normalized),
            Category::LocalMod | Category::SteamMod | Category::Workshop => {
                match normalized.find('/') {
                    Some(slash) if slash > 0 => (
                        normalized[..slash].to_string(),
                        normalized[slash + 1..].to_string(),
                    ),
                    _ => (self.category.label().to_string(), normalized),
                }
            }
            _ => (self.category.label().to_string(), normalized),
        };

        let file = if self.line > 0 || path.contains('/') {
            format!("{}:{}", path, self.line)
        } else {
            path
        };
        let file = if file.chars().count() > 80 {
            let head: String = file.chars().take(77).collect();
            format!("{}...", head)
        } else {
            file
        };
        (kind, file)
    }
}

/// Resolver for Rust call sites captured with `#[track_caller]`
#[derive(Debug, Default)]
pub struct LocationResolver {
    classifier: PathClassifier,
}

impl LocationResolver {
    pub fn new(classifier: PathClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &PathClassifier {
        &self.classifier
    }
}

impl IdentityResolver for LocationResolver {
    type Identity = Location<'static>;

    fn resolve(&self, identity: &Location<'static>) -> Result<String, ResolveError> {
        if identity.file().is_empty() {
            return Err(ResolveError::NoSourceInfo);
        }
        Ok(format!("{}:{}", identity.file(), identity.line()))
    }

    fn classify(&self, source_path: &str) -> FileInfo {
        self.classifier.classify(source_path)
    }
}
