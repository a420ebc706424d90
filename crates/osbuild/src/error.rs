use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidVariant,
    ExternalBuildFailed,
    PackagingFailed,
    ImageTooSmall,
    ExternalToolFailed,
    ToolNotFound,
    BuildActionInconsistency,
    Config,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidVariant => "invalid variant",
            ErrorKind::ExternalBuildFailed => "external build failed",
            ErrorKind::PackagingFailed => "packaging failed",
            ErrorKind::ImageTooSmall => "image too small",
            ErrorKind::ExternalToolFailed => "external tool failed",
            ErrorKind::ToolNotFound => "external tool not found",
            ErrorKind::BuildActionInconsistency => "build action inconsistency",
            ErrorKind::Config => "configuration error",
            ErrorKind::Other => "error",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefix the message (e.g. with the failing target) while keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }

    /// Process exit status for the CLI: build failures are 1, configuration errors 2,
    /// missing external tools 3.
    pub fn exit_code(&self) -> u8 {
        match self.kind {
            ErrorKind::InvalidVariant | ErrorKind::ImageTooSmall | ErrorKind::Config => 2,
            ErrorKind::ToolNotFound => 3,
            ErrorKind::ExternalBuildFailed
            | ErrorKind::PackagingFailed
            | ErrorKind::ExternalToolFailed
            | ErrorKind::BuildActionInconsistency
            | ErrorKind::Other => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
