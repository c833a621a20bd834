//! Interfaces of the collaborators the build core drives.
//!
//! The core does not know how to resolve a specifier, parse a file, group
//! assets into bundles or serialize them; it only schedules that work and
//! applies the results to the graph. Implementations plug in through the
//! traits below. All futures run on the core's single-threaded scheduler,
//! so none of them need to be `Send`.
#![allow(async_fn_in_trait)]

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::graph::{AssetGraph, DependencyNode};

/// Raw content previously materialized by a transform.
pub type Blob = Vec<u8>;

/// A unit of transformed content produced from a file.
#[derive(Clone, Debug)]
pub struct Asset {
    /// Output type, e.g. `js` or `css`.
    pub kind: Box<str>,
    /// Materialized content of the asset.
    pub content: String,
    /// Import specifiers discovered while producing this asset.
    pub dependencies: Vec<String>,
}

/// Everything a transform produced for one file.
#[derive(Clone, Debug, Default)]
pub struct TransformOutput {
    pub assets: Vec<Asset>,
}

/// A group of assets destined for a single output file.
#[derive(Clone, Debug)]
pub struct Bundle {
    pub kind: Box<str>,
    pub name: Option<Box<str>>,
    pub dest_path: Utf8PathBuf,
    pub assets: Vec<Asset>,
}

impl Bundle {
    /// The key a packager is looked up under: the bundle's name, or a
    /// default derived from its kind.
    pub fn packager_key(&self) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => format!("file.{}", self.kind),
        }
    }
}

/// Turns a dependency request into the path of the file that satisfies it.
pub trait Resolver {
    async fn resolve(&self, dep: &DependencyNode) -> anyhow::Result<Utf8PathBuf>;
}

/// Turns a file into assets, discovering further imports along the way.
pub trait Transformer {
    async fn transform(&self, file: &Utf8Path) -> anyhow::Result<TransformOutput>;
}

/// Groups the completed graph's assets into output bundles.
pub trait Bundler {
    async fn bundle(&self, graph: &AssetGraph) -> anyhow::Result<Vec<Bundle>>;
}

/// Serializes one bundle into its output representation.
pub trait Packager {
    /// Render a single member asset from its cached blobs.
    async fn asset(&self, blobs: Vec<Blob>) -> anyhow::Result<String>;

    /// Combine rendered member contents, in bundle order, into final bytes.
    async fn package(&self, contents: Vec<String>) -> anyhow::Result<Vec<u8>>;

    async fn write_file(&self, path: &Utf8Path, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Fetches previously materialized transform output for an asset.
pub trait ContentCache {
    async fn read_blobs(&self, asset: &Asset) -> anyhow::Result<Vec<Blob>>;
}

/// File watching as the orchestrator sees it. Implementations report their
/// own failures; from the core's point of view both calls are fire-and-forget.
pub trait Watch {
    fn watch(&self, path: &Utf8Path);
    fn unwatch(&self, path: &Utf8Path);
}

/// Mapping from bundle name patterns to packagers.
///
/// Patterns are compiled once at registration; selection is a plain match
/// against [`Bundle::packager_key`], first registered pattern wins.
pub struct PackagerRegistry<P> {
    entries: Vec<(Pattern, P)>,
}

impl<P> PackagerRegistry<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(mut self, pattern: &str, packager: P) -> Result<Self, glob::PatternError> {
        self.entries.push((Pattern::new(pattern)?, packager));
        Ok(self)
    }

    pub fn select(&self, bundle: &Bundle) -> Option<&P> {
        let key = bundle.packager_key();
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(&key))
            .map(|(_, packager)| packager)
    }
}

impl<P> Default for PackagerRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(kind: &str, name: Option<&str>) -> Bundle {
        Bundle {
            kind: kind.into(),
            name: name.map(Into::into),
            dest_path: "dist/out".into(),
            assets: Vec::new(),
        }
    }

    #[test]
    fn unnamed_bundles_match_by_kind() {
        let registry = PackagerRegistry::new().register("*.js", "js").unwrap();

        assert_eq!(registry.select(&bundle("js", None)), Some(&"js"));
        assert_eq!(registry.select(&bundle("css", None)), None);
    }

    #[test]
    fn named_bundles_match_by_name() {
        let registry = PackagerRegistry::new()
            .register("vendor.*", "vendor")
            .unwrap();

        assert_eq!(
            registry.select(&bundle("js", Some("vendor.js"))),
            Some(&"vendor"),
        );
        assert_eq!(registry.select(&bundle("js", Some("app.js"))), None);
    }

    #[test]
    fn first_registered_pattern_wins() {
        let registry = PackagerRegistry::new()
            .register("*.js", "first")
            .unwrap()
            .register("*", "second")
            .unwrap();

        assert_eq!(registry.select(&bundle("js", None)), Some(&"first"));
        assert_eq!(registry.select(&bundle("css", None)), Some(&"second"));
    }
}
