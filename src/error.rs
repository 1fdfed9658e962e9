use std::{fmt, io, path::StripPrefixError};

use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;
use tokio::sync::{mpsc::error::SendError as TokioSendError, oneshot::error::RecvError};
use url::ParseError as UrlParseError;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

use crate::{commands::CommandEnvelope, delta::TreeChange};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TreeError {
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Invalid Command: {0}")]
    Command(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("Parent of '{0}' does not exist or cannot hold children")]
    InvalidParent(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Cannot move '{from}' onto existing node '{to}'")]
    MoveOntoOccupant { from: String, to: String },
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Content parser error: {0}")]
    Parse(String),
    #[error("Path '{0}' is already occupied")]
    PathCollision(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl TreeError {
    /// Structural errors come from node store invariants and must be handled by the caller,
    /// everything else is an environmental failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TreeError::InvalidParent(_)
                | TreeError::MoveOntoOccupant { .. }
                | TreeError::PathCollision(_)
        )
    }
}

impl From<StripPrefixError> for TreeError {
    fn from(src: StripPrefixError) -> TreeError {
        TreeError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for TreeError {
    fn from(src: toml::de::Error) -> TreeError {
        TreeError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for TreeError {
    fn from(src: toml::ser::Error) -> TreeError {
        TreeError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<serde_yaml::Error> for TreeError {
    fn from(src: serde_yaml::Error) -> TreeError {
        TreeError::Serialization(format!("Yaml deserialization error: {src}"))
    }
}

impl From<JsonError> for TreeError {
    fn from(src: JsonError) -> TreeError {
        TreeError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<UrlParseError> for TreeError {
    fn from(src: UrlParseError) -> TreeError {
        TreeError::Serialization(format!("Invalid URL: {src}"))
    }
}

impl From<io::Error> for TreeError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => TreeError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => TreeError::PermissionDenied,
            _ => TreeError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<fmt::Error> for TreeError {
    fn from(x: fmt::Error) -> Self {
        TreeError::Custom(format!("{x}"))
    }
}

impl From<RegexError> for TreeError {
    fn from(x: RegexError) -> Self {
        TreeError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<TokioSendError<TreeChange>> for TreeError {
    fn from(x: TokioSendError<TreeChange>) -> Self {
        TreeError::Channel(format!(
            "Channel send error, could not transmit tree change {}",
            x.0
        ))
    }
}

impl From<TokioSendError<CommandEnvelope>> for TreeError {
    fn from(x: TokioSendError<CommandEnvelope>) -> Self {
        TreeError::Channel(format!(
            "Channel send error, could not transmit command {}",
            x.0.op
        ))
    }
}

impl From<RecvError> for TreeError {
    fn from(_: RecvError) -> Self {
        TreeError::Channel("Backend dropped the command reply channel".to_string())
    }
}

impl From<tokio::task::JoinError> for TreeError {
    fn from(x: tokio::task::JoinError) -> Self {
        TreeError::Custom(format!("Background task failed: {x}"))
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for TreeError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => TreeError::Custom(format!(
                "notify: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => TreeError::Io(format!(
                "notify: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => TreeError::NotFound(format!(
                "notify: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => TreeError::NotFound(format!(
                "notify: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                TreeError::Custom("notify invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                TreeError::Custom("notify max file watch limit reached".to_string())
            }
        }
    }
}
