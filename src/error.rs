use thiserror::Error;

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum AlarmError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while encoding or decoding a wire message
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed regular expression in an authorization rule
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// No alarm tree item exists at the given path
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// An item with the same path already exists
    #[error("Duplicate path: {0}")]
    DuplicatePath(String),

    /// Path or item name is not acceptable
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Operation would make an item its own ancestor
    #[error("Cyclic tree operation: cannot place '{item}' below '{parent}'")]
    Cycle { item: String, parent: String },

    /// Operation is only valid for a leaf or a group
    #[error("Wrong item kind at {path}: expected {expected}")]
    WrongKind { path: String, expected: &'static str },

    /// Message log / broker failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// Automated action could not be executed
    #[error("Action error: {0}")]
    Action(String),

    /// User lacks the permission for a request
    #[error("Not authorized: {user} lacks '{permission}'")]
    NotAuthorized { user: String, permission: String },
}

/// Convenient alias over [`Result`] using [`AlarmError`]
pub type Result<T> = std::result::Result<T, AlarmError>;
