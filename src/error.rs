use camino::Utf8PathBuf;
use thiserror::Error;

/// Error type for a single build generation.
///
/// `Aborted` is a control signal rather than a real failure: it marks work
/// belonging to a generation that has been superseded by a newer change. It
/// must never be reported as an error to the user; the watch loop swallows it.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The generation was superseded before its results could be applied.
    #[error("build superseded by a newer change")]
    Aborted,

    #[error("Failed to resolve '{0}':\n{1}")]
    Resolution(Box<str>, anyhow::Error),

    #[error("Failed to transform '{0}':\n{1}")]
    Transform(Utf8PathBuf, anyhow::Error),

    #[error("Bundling failed:\n{0}")]
    Bundler(anyhow::Error),

    #[error("No packager registered for bundle '{0}'")]
    PackagerConfig(Box<str>),

    #[error("Failed to package '{0}':\n{1}")]
    Packager(Utf8PathBuf, anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Whether this value is the abort sentinel rather than a genuine error.
    pub fn is_abort(&self) -> bool {
        matches!(self, BuildError::Aborted)
    }
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}
