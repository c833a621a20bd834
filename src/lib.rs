#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod build;
mod error;
mod graph;
mod plugin;
mod queue;
mod signal;
#[cfg(feature = "live")]
mod watch;

pub use crate::build::{BuildReport, Options, Project};
pub use crate::error::BuildError;
#[cfg(feature = "live")]
pub use crate::error::WatchError;
pub use crate::graph::{
    AssetGraph, DependencyId, DependencyNode, DependencyRequest, DependencyUpdate, Edge, FileNode,
    FileUpdate, Node, NodeKey, NodeState,
};
pub use crate::plugin::{
    Asset, Blob, Bundle, Bundler, ContentCache, Packager, PackagerRegistry, Resolver,
    TransformOutput, Transformer, Watch,
};
pub use crate::queue::TaskQueue;
pub use crate::signal::BuildSignal;
#[cfg(feature = "live")]
pub use crate::watch::FsWatcher;

/// Install a `tracing` subscriber that reads its filter from the
/// environment and logs to stderr. Call once, early.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
