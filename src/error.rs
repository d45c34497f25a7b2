use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ScreenError {
    #[error("invalid element symbol: {0}")]
    InvalidElementSymbol(String),

    #[error("invalid source name: {0}")]
    InvalidSource(String),

    #[error("invalid property database type: {0}")]
    InvalidDatabaseType(String),

    #[error("missing config file magscreen.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("seed table error: {0}")]
    SeedRead(String),

    #[error("seed table is missing required column: {0}")]
    SeedColumn(String),

    #[error("structure repository request failed: {0}")]
    MpHttp(String),

    #[error("structure repository returned status {status}: {message}")]
    MpStatus { status: u16, message: String },

    #[error("property service request failed: {0}")]
    NemadHttp(String),

    #[error("property service returned status {status}: {message}")]
    NemadStatus { status: u16, message: String },

    #[error("structure database gateway request failed: {0}")]
    IcsdHttp(String),

    #[error("structure database gateway returned status {status}: {message}")]
    IcsdStatus { status: u16, message: String },

    #[error("no schema variant matched for field {0}")]
    SchemaVariantExhausted(String),

    #[error("batch capacity violated: {0}")]
    BatchCapacity(String),

    #[error("all {attempts} attempts failed: {cause}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        cause: Box<ScreenError>,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("output error: {0}")]
    Output(String),
}

impl ScreenError {
    /// Transient provider failures are eligible for retry; everything else
    /// escalates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ScreenError::MpHttp(_) | ScreenError::NemadHttp(_) | ScreenError::IcsdHttp(_) => true,
            ScreenError::MpStatus { status, .. }
            | ScreenError::NemadStatus { status, .. }
            | ScreenError::IcsdStatus { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}
