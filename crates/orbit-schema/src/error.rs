use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{file}: cannot find include '{include}'")]
    IncludeNotFound { file: String, include: String },

    #[error("{file}:{line}: {message}")]
    Syntax {
        file: String,
        line: usize,
        message: String,
    },

    #[error("'{0}' is defined more than once")]
    DuplicateDefinition(String),

    #[error("unknown type '{name}' in {context}")]
    UnresolvedType { name: String, context: String },

    #[error("interface '{interface}' extends unknown interface '{base}'")]
    UnknownBase { interface: String, base: String },

    #[error("interface '{0}' inherits from itself")]
    CyclicInheritance(String),

    #[error("interface '{interface}' declares operation '{operation}' more than once")]
    DuplicateOperation { interface: String, operation: String },

    #[error("invalid compiler arguments: {0}")]
    InvalidArgs(String),

    #[error("failed to write output: {0}")]
    Output(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
