// error.rs - Script layer errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("cannot convert a {kind} value")]
    Unsupported { kind: String },

    #[error("value nests deeper than {limit} levels")]
    StackExhausted { limit: usize },

    #[error("container holds more than {limit} elements")]
    TooManyElements { limit: usize },

    #[error("interpreter error during conversion: {0}")]
    Engine(#[from] rquickjs::Error),
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to set up script interpreter: {0}")]
    Engine(#[from] rquickjs::Error),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}
