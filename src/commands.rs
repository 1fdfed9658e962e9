use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use tokio::sync::oneshot;

use crate::{error::TreeError, node::Node};

/// New content for a file: full text, or a merge patch against structured content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentUpdate {
    Text(String),
    Patch(Value),
}

/// Command surface of the authoritative backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Create a file, promoting a virtual node at the same path.
    CreateFile {
        path: String,
        contents: Option<String>,
    },
    CreateFolder(String),
    /// Move or rename, rewriting every link that refers into the moved subtree.
    Move { from: String, to: String },
    Copy { from: String, to: String },
    Delete(String),
    UpdateFileContents { path: String, update: ContentUpdate },
    /// Merge patch applied to the node's opaque metadata.
    UpdateMetadata { path: String, patch: Value },
    EnsureFolderExists { path: String, is_virtual: bool },
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Op::CreateFile { path, .. } => write!(f, "CreateFile({path})"),
            Op::CreateFolder(path) => write!(f, "CreateFolder({path})"),
            Op::Move { from, to } => write!(f, "Move({from} -> {to})"),
            Op::Copy { from, to } => write!(f, "Copy({from} -> {to})"),
            Op::Delete(path) => write!(f, "Delete({path})"),
            Op::UpdateFileContents { path, update } => match update {
                ContentUpdate::Text(text) => {
                    write!(f, "UpdateFileContents({path}, {} bytes)", text.len())
                }
                ContentUpdate::Patch(_) => write!(f, "UpdateFileContents({path}, patch)"),
            },
            Op::UpdateMetadata { path, .. } => write!(f, "UpdateMetadata({path})"),
            Op::EnsureFolderExists { path, is_virtual } => {
                write!(f, "EnsureFolderExists({path}, virtual: {is_virtual})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    Ok,
    Node(Node),
}

impl OpResult {
    pub fn node(self) -> Option<Node> {
        match self {
            OpResult::Node(node) => Some(node),
            OpResult::Ok => None,
        }
    }
}

impl Display for OpResult {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OpResult::Ok => write!(f, "Ok"),
            OpResult::Node(node) => write!(f, "Node({})", node.path),
        }
    }
}

/// A command in flight from a mirror to the backend.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub request_id: u64,
    pub op: Op,
    pub reply: oneshot::Sender<Result<OpResult, TreeError>>,
}
