use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes blob store errors by their semantic meaning,
/// independent of the concrete backend.
///
/// The registry layer above cares chiefly about one distinction:
/// [`BlobErrorKind::NotFound`] is a legitimate, expected outcome for
/// reads (mapped to a 404-equivalent by the host), while everything
/// else is a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobErrorKind {
    /// The requested key does not exist in the store.
    NotFound,

    /// The caller lacks permission for the requested operation.
    PermissionDenied,

    /// The operation failed due to I/O errors (network, disk, etc.).
    Io,

    /// The operation was aborted by its cancellation token.
    Cancelled,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl fmt::Display for BlobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobErrorKind::NotFound => write!(f, "not found"),
            BlobErrorKind::PermissionDenied => write!(f, "permission denied"),
            BlobErrorKind::Io => write!(f, "I/O error"),
            BlobErrorKind::Cancelled => write!(f, "cancelled"),
            BlobErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace, controlled by RUST_BACKTRACE.
    backtrace: Backtrace,

    /// Span context at the point where the error was created, giving
    /// the logical async call stack.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// An error from a blob store client, carrying the semantic kind, the
/// engine that produced it and the key involved.
#[derive(Debug)]
pub struct BlobError {
    kind: BlobErrorKind,

    /// The name of the blob store engine that produced this error.
    engine: &'static str,

    /// The blob key, if applicable.
    key: Option<String>,

    /// Additional context about the failing operation.
    context: Option<String>,

    /// The underlying error.
    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for BlobError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl BlobError {
    /// Create a new blob error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: BlobErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            key: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder to attach key and context information.
    pub fn builder<E>(engine: &'static str, kind: BlobErrorKind, error: E) -> BlobErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        BlobErrorBuilder {
            engine,
            kind,
            source: error.into(),
            key: None,
            context: None,
        }
    }

    /// A not-found error for the given key.
    pub fn not_found(engine: &'static str, key: impl Into<String>) -> Self {
        let key = key.into();
        BlobError::builder(
            engine,
            BlobErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("key not found: {key}"),
            ),
        )
        .key(key)
        .build()
    }

    /// A cancellation error for the given key.
    pub fn cancelled(engine: &'static str, key: impl Into<String>) -> Self {
        BlobError::builder(
            engine,
            BlobErrorKind::Cancelled,
            std::io::Error::new(std::io::ErrorKind::Interrupted, "transfer cancelled"),
        )
        .key(key)
        .build()
    }

    /// Returns a closure that creates a blob error from a downstream
    /// error, for use with `.map_err()`.
    pub fn with<E>(
        engine: &'static str,
        kind: BlobErrorKind,
    ) -> Box<dyn FnOnce(E) -> BlobError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| BlobError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> BlobErrorKind {
        self.kind
    }

    /// Returns whether this error represents a missing key.
    pub fn is_not_found(&self) -> bool {
        self.kind == BlobErrorKind::NotFound
    }

    /// Returns whether this error represents a cancelled transfer.
    pub fn is_cancelled(&self) -> bool {
        self.kind == BlobErrorKind::Cancelled
    }

    /// Returns the blob store engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the blob key, if available.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns the span context captured when the error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob store error [{}] from {}", self.kind, self.engine)?;

        if let Some(key) = &self.key {
            write!(f, " (key: {})", key)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing a [`BlobError`] with optional context.
#[derive(Debug)]
pub struct BlobErrorBuilder {
    kind: BlobErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    key: Option<String>,
    context: Option<String>,
}

impl BlobErrorBuilder {
    /// Set the blob key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the [`BlobError`].
    pub fn build(self) -> BlobError {
        BlobError {
            kind: self.kind,
            engine: self.engine,
            key: self.key,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
