use std::{fmt, io};

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
///
/// Use [`Error::kind`] to decide how to react to an error; the [`fmt::Display`] output carries
/// the underlying cause (typically the D-Bus error name and message).
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Repr,
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The adapter or device does not exist (anymore).
    Unavailable,
    /// A call to BlueZ or the OBEX daemon failed.
    RemoteCallFailed,
    /// [`Agent::register`][crate::agent::Agent::register] was called on a registered agent.
    AlreadyRegistered,
    /// Another device is currently pairing.
    AgentBusy,
    /// The remote side (or the user) rejected the request.
    Rejected,
    /// The request was canceled before it completed.
    Canceled,
    /// The configuration or history file could not be parsed.
    Config,
    /// Local I/O failed.
    Io,
    /// Anything else.
    Other,
}

impl Error {
    pub(crate) fn from(e: impl Into<Repr>) -> Self {
        let inner = e.into();
        let kind = inner.classify();
        Self { kind, inner }
    }

    pub(crate) fn with_kind(kind: ErrorKind, e: impl Into<Repr>) -> Self {
        Self {
            kind,
            inner: e.into(),
        }
    }

    /// Creates an [`ErrorKind::Unavailable`] error with the given message.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Unavailable, msg.into())
    }

    /// Creates an [`ErrorKind::RemoteCallFailed`] error with the given message.
    ///
    /// Mostly useful for [`Backend`][crate::bus::Backend] implementations that don't talk to a
    /// real bus.
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::RemoteCallFailed, msg.into())
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Repr::Zbus(e) => e.fmt(f),
            Repr::Fdo(e) => e.fmt(f),
            Repr::Toml(e) => e.fmt(f),
            Repr::Io(e) => e.fmt(f),
            Repr::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            Repr::Zbus(e) => Some(e),
            Repr::Fdo(e) => Some(e),
            Repr::Toml(e) => Some(e),
            Repr::Io(e) => Some(e),
            Repr::Other(_) => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Repr {
    Zbus(zbus::Error),
    Fdo(zbus::fdo::Error),
    Toml(toml::de::Error),
    Io(io::Error),
    Other(String),
}

impl Repr {
    fn classify(&self) -> ErrorKind {
        match self {
            Repr::Zbus(zbus::Error::MethodError(name, _, _)) => classify_error_name(name.as_str()),
            Repr::Zbus(zbus::Error::FDO(e)) => classify_fdo(e),
            Repr::Zbus(_) => ErrorKind::RemoteCallFailed,
            Repr::Fdo(e) => classify_fdo(e),
            Repr::Toml(_) => ErrorKind::Config,
            Repr::Io(_) => ErrorKind::Io,
            Repr::Other(_) => ErrorKind::Other,
        }
    }
}

fn classify_fdo(e: &zbus::fdo::Error) -> ErrorKind {
    match e {
        zbus::fdo::Error::UnknownObject(_) => ErrorKind::Unavailable,
        _ => ErrorKind::RemoteCallFailed,
    }
}

/// Maps a D-Bus error name returned by BlueZ onto an [`ErrorKind`].
pub(crate) fn classify_error_name(name: &str) -> ErrorKind {
    match name {
        "org.bluez.Error.Canceled" | "org.bluez.Error.AuthenticationCanceled" => {
            ErrorKind::Canceled
        }
        "org.bluez.Error.Rejected"
        | "org.bluez.Error.AuthenticationRejected"
        | "org.bluez.Error.AuthenticationFailed" => ErrorKind::Rejected,
        "org.bluez.Error.DoesNotExist" | "org.freedesktop.DBus.Error.UnknownObject" => {
            ErrorKind::Unavailable
        }
        _ => ErrorKind::RemoteCallFailed,
    }
}

impl From<zbus::Error> for Repr {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::fdo::Error> for Repr {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<toml::de::Error> for Repr {
    fn from(value: toml::de::Error) -> Self {
        Self::Toml(value)
    }
}

impl From<io::Error> for Repr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<String> for Repr {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for Repr {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}
