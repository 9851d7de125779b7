use thiserror::Error;

/// Result type used across the Undertow workspace
pub type CoreResult<T> = Result<T, CoreError>;

/// Error types shared by the request managers and the browser pool
#[derive(Error, Debug)]
pub enum CoreError {
    /// Argument shape violation, never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `new_page` called with an id that is already bound to a live page
    #[error("page with id {0} already exists")]
    DuplicatePageId(String),

    /// `new_page` called with a plugin that is not registered with the pool
    #[error("browser plugin {0} is not registered with this pool")]
    UnknownPlugin(String),

    /// Driver launch or post-launch hook failure
    #[error("failed to launch browser ({hint}): {source}")]
    LaunchFailed {
        /// Executable path or plugin name to point the operator at
        hint: String,
        #[source]
        source: Box<CoreError>,
    },

    /// `controller.new_page` failed or timed out
    #[error("failed to open new page: {0}")]
    PageOpenFailed(String),

    /// Persisted request-list state does not match the loaded sources
    #[error("request list state is inconsistent with sources: {0}")]
    StateInconsistent(String),

    /// `sources_function` or a remote URL list failed to load
    #[error("failed to load request sources: {context}")]
    SourcesLoadFailed {
        context: String,
        #[source]
        source: Option<Box<CoreError>>,
    },

    /// Server-side request lock expired or was taken by another client
    #[error("lock lost for request {0}")]
    LockLost(String),

    /// An operation-timeout wrapper fired
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The surrounding task was cancelled or torn down
    #[error("operation aborted")]
    Aborted,

    /// Storage driver error
    #[error("storage error: {0}")]
    Storage(String),

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization of persisted state failed
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// URL parsing failure
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn sources(msg: impl Into<String>) -> Self {
        Self::SourcesLoadFailed {
            context: msg.into(),
            source: None,
        }
    }

    /// A sources failure wrapping the error that caused it, typically an
    /// [`Http`](Self::Http) transport failure.
    pub fn sources_with(msg: impl Into<String>, source: CoreError) -> Self {
        Self::SourcesLoadFailed {
            context: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn page_open(msg: impl Into<String>) -> Self {
        Self::PageOpenFailed(msg.into())
    }

    pub fn launch(hint: impl Into<String>, source: CoreError) -> Self {
        Self::LaunchFailed {
            hint: hint.into(),
            source: Box::new(source),
        }
    }
}
