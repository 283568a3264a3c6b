#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unexpected end of stream at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("structural error: {0}")]
    Structural(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    /// A script field whose byte width cannot be determined. Decoding past it
    /// would desynchronize every later field, so the walk stops here.
    #[error("field {name:?} of type {type_name:?} cannot be decoded safely")]
    UnsupportedField { name: String, type_name: String },
}

/// [`Error`] annotated with the stream offset at which parsing failed.
#[derive(thiserror::Error, Debug)]
#[error("error at offset {offset}: {error}")]
pub struct ParseError {
    pub offset: usize,
    pub error: Error,
}
