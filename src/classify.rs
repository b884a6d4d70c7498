//! Source path classification
//!
//! Sorts script sources into where they came from (a locally installed mod,
//! a workshop download, a Steam-installed mod, the host application itself)
//! and strips the install root so reports show short, relative paths.
//!
//! Only the reporting layer and the exclusion policy call into this, never the
//! per-sample path. Results are cached because the same handful of files is
//! classified over and over.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;

/// Paths at least this long are classified but not cached
const MAX_CACHED_PATH_LEN: usize = 1000;

/// Origin of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    /// `<cache_dir>/mods/...`
    LocalMod,
    /// `<cache_dir>/workshop/...`
    Workshop,
    /// Installed from the Steam workshop
    SteamMod,
    /// Shipped with the host application
    Game,
    /// The engine measuring itself
    Internal,
    Unknown,
}

impl Category {
    /// Short label used in report columns
    pub fn label(&self) -> &'static str {
        match self {
            Category::LocalMod => "LMOD",
            Category::Workshop => "WMOD",
            Category::SteamMod => "SMOD",
            Category::Game => "GAME",
            Category::Internal => "INT",
            Category::Unknown => "UNK",
        }
    }

    /// Sources belonging to the host application rather than user content
    pub fn is_builtin(&self) -> bool {
        matches!(self, Category::Game)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classified source path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub category: Category,
    pub relative_path: String,
}

impl FileInfo {
    pub fn new(category: Category, relative_path: impl Into<String>) -> Self {
        Self {
            category,
            relative_path: relative_path.into(),
        }
    }

    pub fn unknown(path: &str) -> Self {
        Self::new(Category::Unknown, path)
    }
}

/// Classifies source paths against the host's install layout
///
/// # Example
///
/// ```
/// use callstat::classify::{Category, PathClassifier};
///
/// let classifier = PathClassifier::new()
///     .with_cache_dir("/home/u/Zomboid")
///     .with_game_root("/opt/game");
///
/// let info = classifier.classify("/home/u/Zomboid/mods/Hydrocraft/media/lua/a.lua");
/// assert_eq!(info.category, Category::LocalMod);
/// assert_eq!(info.relative_path, "Hydrocraft/media/lua/a.lua");
///
/// let info = classifier.classify("/opt/game/media/lua/client/ISUI.lua");
/// assert_eq!(info.category, Category::Game);
/// assert_eq!(info.relative_path, "client/ISUI.lua");
/// ```
#[derive(Debug, Default)]
pub struct PathClassifier {
    cache_dir: Option<String>,
    steam_folders: Vec<String>,
    game_root: Option<String>,
    cache: DashMap<String, FileInfo>,
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

fn strip_prefix_ci<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path.len() >= prefix.len()
        && path.is_char_boundary(prefix.len())
        && path[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&path[prefix.len()..])
    } else {
        None
    }
}

/// Drop the leading `mods/` and then `lua/` folder of a Steam mod path
fn strip_steam_layout(relative: &str) -> &str {
    let relative = relative.trim_start_matches('/');
    let relative = relative.strip_prefix("mods/").unwrap_or(relative);
    relative.strip_prefix("lua/").unwrap_or(relative)
}

impl PathClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// User cache directory holding `mods/` and `workshop/`
    pub fn with_cache_dir(mut self, dir: impl Into<String>) -> Self {
        self.cache_dir = Some(normalize(&dir.into()).trim_end_matches('/').to_string());
        self
    }

    /// Folder of one installed Steam workshop item
    pub fn with_steam_folder(mut self, dir: impl Into<String>) -> Self {
        self.steam_folders.push(normalize(&dir.into()));
        self
    }

    /// Install root of the host application
    pub fn with_game_root(mut self, dir: impl Into<String>) -> Self {
        self.game_root = Some(normalize(&dir.into()).trim_end_matches('/').to_string());
        self
    }

    /// Classify a source path, consulting the cache first
    pub fn classify(&self, path: &str) -> FileInfo {
        if let Some(cached) = self.cache.get(path) {
            return cached.clone();
        }
        let info = self.classify_uncached(path);
        if path.len() < MAX_CACHED_PATH_LEN {
            self.cache.insert(path.to_string(), info.clone());
        }
        info
    }

    fn classify_uncached(&self, path: &str) -> FileInfo {
        let normalized = normalize(path);

        if let Some(cache_dir) = &self.cache_dir {
            let local_mods = format!("{}/mods/", cache_dir);
            if let Some(rest) = normalized.strip_prefix(&local_mods) {
                return FileInfo::new(Category::LocalMod, rest.trim_start_matches('/'));
            }
            let workshop = format!("{}/workshop/", cache_dir);
            if let Some(rest) = strip_prefix_ci(&normalized, &workshop) {
                return FileInfo::new(Category::Workshop, rest.trim_start_matches('/'));
            }
        }

        for folder in &self.steam_folders {
            if let Some(rest) = normalized.strip_prefix(folder.as_str()) {
                return FileInfo::new(Category::SteamMod, strip_steam_layout(rest));
            }
        }

        // Workshop downloads the host did not report as installed
        if normalized.contains("/workshop/content/") {
            if let Some(idx) = normalized.find("/mods/") {
                let rest = &normalized[idx + "/mods/".len()..];
                return FileInfo::new(Category::SteamMod, strip_steam_layout(rest));
            }
        }

        if let Some(root) = &self.game_root {
            if let Some(rest) = normalized.strip_prefix(root.as_str()) {
                let rest = rest.trim_start_matches('/');
                let rest = rest.strip_prefix("media/lua/").unwrap_or(rest);
                return FileInfo::new(Category::Game, rest);
            }
        }

        FileInfo::unknown(path)
    }

    /// Forget cached classifications (e.g. after mods are reloaded)
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
