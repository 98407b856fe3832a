use tablesync_core::{EngineError, config::ConfigError, storage::StorageError};

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Invalid --root '{root}': {source}"))]
    InvalidRoot { root: String, source: StorageError },

    #[snafu(display("Failed to load config: {source}"))]
    LoadConfig { source: ConfigError },

    #[snafu(display("Failed to read {path}: {source}"))]
    ReadInput {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse {path} as JSON: {source}"))]
    ParseInput {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Invalid --value '{spec}': expected COLUMN=VALUE"))]
    InvalidValue { spec: String },

    #[snafu(display("Failed to open tables under {root}: {source}"))]
    OpenEngine {
        root: String,
        #[snafu(source(from(EngineError, Box::new)))]
        source: Box<EngineError>,
    },

    #[snafu(display("{op} failed ({kind}): {source}", kind = source.kind()))]
    Operation {
        op: &'static str,
        #[snafu(source(from(EngineError, Box::new)))]
        source: Box<EngineError>,
    },

    #[snafu(display("Failed to render output: {source}"))]
    Render { source: serde_json::Error },
}
