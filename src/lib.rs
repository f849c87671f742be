//! Layered raster document engine: layer tree, selection, compositing,
//! undo/redo history and an edit pipeline that merges manual strokes and
//! asynchronous generation results onto a single mutation thread.

#![allow(clippy::too_many_arguments)]

#[macro_use]
pub mod logger;

pub mod blend;
pub mod components;
pub mod compositor;
pub mod document;
pub mod error;
pub mod geometry;
pub mod io;
pub mod layer;
pub mod ops;
pub mod pixels;
pub mod selection;
pub mod settings;

pub use blend::BlendMode;
pub use components::history::{EntryKind, HistoryEntry, HistoryManager};
pub use compositor::CompositingEngine;
pub use document::{Document, EditMask, NewLayer};
pub use error::{EditError, EditResult, PersistError};
pub use geometry::{IRect, LayerTransform};
pub use layer::{Layer, LayerGroup, LayerId, LayerNode, LayerTree};
pub use ops::generation::{GenerationParams, GenerationRequest, GenerationResult, PipelineMessage};
pub use ops::pipeline::{EditPipeline, MergeOutcome, StrokeDab, StrokeRenderer, StrokeSample};
pub use pixels::{Anchor, PixelBuffer};
pub use selection::{SelectionMask, SelectionMode, SelectionShape, SelectionSource};
pub use settings::EngineSettings;
