use crate::layer::LayerId;

/// Errors raised by document, history and pipeline operations.
///
/// Every variant leaves the document in its last committed state: a call
/// that returns one of these has had no side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    /// A buffer or canvas dimension was zero or too large.
    InvalidDimensions { width: u32, height: u32 },
    /// Byte length or channel count did not match the expected format.
    FormatMismatch { expected: usize, actual: usize },
    LayerLocked(LayerId),
    /// `node` cannot be placed inside `group` because `group` is `node` or one of its descendants.
    CyclicGroupError { node: LayerId, group: LayerId },
    /// The edit region misses the layer bounds, the canvas or the selection entirely.
    OutOfBounds,
    /// The document changed incompatibly since the generation request was issued.
    StaleGenerationTarget(String),
    NothingToUndo,
    NothingToRedo,
    UnknownLayer(LayerId),
    NotAGroup(LayerId),
    NotALeaf(LayerId),
    NoLayerBelow(LayerId),
    /// The document must keep at least one pixel layer.
    LastLayer,
    NotRecording,
    AlreadyRecording,
}

impl std::fmt::Display for EditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditError::InvalidDimensions { width, height } => {
                write!(f, "Invalid dimensions {}x{}", width, height)
            }
            EditError::FormatMismatch { expected, actual } => {
                write!(f, "Format mismatch: expected {}, got {}", expected, actual)
            }
            EditError::LayerLocked(id) => write!(f, "Layer {} is locked", id),
            EditError::CyclicGroupError { node, group } => {
                write!(f, "Cannot place {} inside {}: grouping would form a cycle", node, group)
            }
            EditError::OutOfBounds => write!(f, "Edit region lies outside the editable area"),
            EditError::StaleGenerationTarget(reason) => {
                write!(f, "Generation target is stale: {}", reason)
            }
            EditError::NothingToUndo => write!(f, "Nothing to undo"),
            EditError::NothingToRedo => write!(f, "Nothing to redo"),
            EditError::UnknownLayer(id) => write!(f, "No layer with id {}", id),
            EditError::NotAGroup(id) => write!(f, "Layer {} is not a group", id),
            EditError::NotALeaf(id) => write!(f, "Layer {} is a group, not a pixel layer", id),
            EditError::NoLayerBelow(id) => write!(f, "Layer {} has no layer below it", id),
            EditError::LastLayer => write!(f, "Cannot remove the last pixel layer"),
            EditError::NotRecording => write!(f, "No history scope is open"),
            EditError::AlreadyRecording => write!(f, "A history scope is already open"),
        }
    }
}

impl std::error::Error for EditError {}

pub type EditResult<T> = Result<T, EditError>;

/// Error type for document file operations
#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    Serialize(String),
    InvalidFormat(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "I/O error: {}", e),
            PersistError::Serialize(e) => write!(f, "Serialization error: {}", e),
            PersistError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Io(e)
    }
}

impl From<Box<bincode::ErrorKind>> for PersistError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        PersistError::Serialize(e.to_string())
    }
}

impl From<EditError> for PersistError {
    fn from(e: EditError) -> Self {
        PersistError::InvalidFormat(e.to_string())
    }
}
