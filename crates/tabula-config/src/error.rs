use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No `.config/tabula.json` found in any parent directory.
    #[error("no .config/tabula.json found in current directory or any parent")]
    NotFound,

    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid table config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("column declares more than one kind: {}", .0.join(", "))]
    AmbiguousColumn(Vec<&'static str>),

    #[error("`{0}` is only valid together with `isText: true`")]
    TextOptionWithoutText(&'static str),

    #[error("`isText: false` is not a column kind, omit the key instead")]
    TextDisabled,

    #[error("table declares both `isLookupTable` and regular table fields ({0})")]
    ShapeConflict(&'static str),

    #[error("table declares neither `columns` nor `isLookupTable`")]
    MissingShape,

    #[error("trigger must declare at least one action")]
    NoTriggerActions,

    #[error("current directory is not valid UTF-8")]
    NonUtf8Path,
}
