use core::fmt;

/// Result type used by all manager-facing operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Domain-specific error kinds surfaced by the multiplexer.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// A listener with the same name is already registered for this session.
    DuplicateName,
    /// The operation targets a channel that is not in the `Open` state.
    ChannelClosed,
    /// Lookup miss.
    NotFound,
    /// The channel-open request was declined, or no listener matched.
    ChannelRefused,
    /// Channel I/O was attempted while the session is not connected.
    SessionNotReady,
    /// Peer misbehavior (e.g. data for an unknown channel id). Logged and
    /// tolerated by the manager, never session-fatal.
    ProtocolAnomaly,
    /// General failure.
    General,
}

impl fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelErrorKind::DuplicateName => write!(f, "listener name already registered"),
            ChannelErrorKind::ChannelClosed => write!(f, "channel is not open"),
            ChannelErrorKind::NotFound => write!(f, "not found"),
            ChannelErrorKind::ChannelRefused => write!(f, "channel refused"),
            ChannelErrorKind::SessionNotReady => write!(f, "session is not connected"),
            ChannelErrorKind::ProtocolAnomaly => write!(f, "protocol anomaly"),
            ChannelErrorKind::General => write!(f, "general error"),
        }
    }
}

/// A multiplexer error holding a context string along a domain-specific
/// kind for detailed reporting.
#[non_exhaustive]
#[derive(Debug)]
pub struct ChannelError {
    /// Context string.
    pub context: &'static str,
    /// Domain-specific error kind.
    pub kind: ChannelErrorKind,
    source: Option<Box<dyn std::error::Error + Sync + Send>>,
}

impl ChannelError {
    /// Creates a new error of the given kind.
    #[cold]
    #[must_use]
    pub fn new(context: &'static str, kind: ChannelErrorKind) -> Self {
        Self {
            context,
            kind,
            source: None,
        }
    }

    /// Attaches a source to this error.
    #[cold]
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Sync + Send + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ChannelErrorKind {
        self.kind
    }

    /// Returns a struct for formatting and reporting this error to the user.
    pub fn report(&self) -> ChannelErrorReport<'_> {
        ChannelErrorReport(self)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.context, self.kind)
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // NOTE: we can’t use Option::as_ref here because of type inference
        if let Some(e) = &self.source {
            Some(e.as_ref())
        } else {
            None
        }
    }
}

impl From<ChannelError> for std::io::Error {
    fn from(error: ChannelError) -> Self {
        Self::new(std::io::ErrorKind::Other, error)
    }
}

/// The reporting type to use when showing the final error to the user.
pub struct ChannelErrorReport<'a>(&'a ChannelError);

impl fmt::Display for ChannelErrorReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::error::Error as _;

        write!(f, "{}", self.0)?;

        let mut next_source = self.0.source();

        while let Some(e) = next_source {
            write!(f, ", caused by: {e}")?;
            next_source = e.source();
        }

        Ok(())
    }
}

/// Constructors for [`ChannelError`], one per kind.
pub trait ChannelErrorExt {
    fn duplicate_name(context: &'static str) -> Self;
    fn channel_closed(context: &'static str) -> Self;
    fn not_found(context: &'static str) -> Self;
    fn channel_refused(context: &'static str) -> Self;
    fn session_not_ready(context: &'static str) -> Self;
    fn protocol_anomaly(context: &'static str) -> Self;
    fn general(context: &'static str) -> Self;
    fn custom<E>(context: &'static str, e: E) -> Self
    where
        E: std::error::Error + Sync + Send + 'static;
}

impl ChannelErrorExt for ChannelError {
    fn duplicate_name(context: &'static str) -> Self {
        Self::new(context, ChannelErrorKind::DuplicateName)
    }

    fn channel_closed(context: &'static str) -> Self {
        Self::new(context, ChannelErrorKind::ChannelClosed)
    }

    fn not_found(context: &'static str) -> Self {
        Self::new(context, ChannelErrorKind::NotFound)
    }

    fn channel_refused(context: &'static str) -> Self {
        Self::new(context, ChannelErrorKind::ChannelRefused)
    }

    fn session_not_ready(context: &'static str) -> Self {
        Self::new(context, ChannelErrorKind::SessionNotReady)
    }

    fn protocol_anomaly(context: &'static str) -> Self {
        Self::new(context, ChannelErrorKind::ProtocolAnomaly)
    }

    fn general(context: &'static str) -> Self {
        Self::new(context, ChannelErrorKind::General)
    }

    fn custom<E>(context: &'static str, e: E) -> Self
    where
        E: std::error::Error + Sync + Send + 'static,
    {
        Self::new(context, ChannelErrorKind::General).with_source(e)
    }
}

pub trait ChannelResultExt {
    #[must_use]
    fn with_context(self, context: &'static str) -> Self;
    #[must_use]
    fn with_source<E>(self, source: E) -> Self
    where
        E: std::error::Error + Sync + Send + 'static;
}

impl<T> ChannelResultExt for ChannelResult<T> {
    fn with_context(self, context: &'static str) -> Self {
        self.map_err(|mut e| {
            e.context = context;
            e
        })
    }

    fn with_source<E>(self, source: E) -> Self
    where
        E: std::error::Error + Sync + Send + 'static,
    {
        self.map_err(|e| e.with_source(source))
    }
}
