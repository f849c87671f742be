// ============================================================================
// EDIT PIPELINE: manual strokes and generation merges against one document
// ============================================================================
//
// Single mutation thread: the pipeline, document and history all live on the
// caller's thread. Background work only ever talks back through the inbox
// channel, and `pump()` is where those messages meet the document.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};

use image::{GrayImage, Luma};
use uuid::Uuid;

use crate::components::history::HistoryManager;
use crate::document::{Document, EditMask};
use crate::error::{EditError, EditResult};
use crate::geometry::IRect;
use crate::layer::{Layer, LayerId};
use crate::ops::generation::{
    GenerationParams, GenerationRequest, GenerationResult, PipelineMessage, spawn_generation,
};
use crate::pixels::PixelBuffer;
use crate::{log_info, log_warn};

// ---- stroke boundary -----------------------------------------------------------

/// One input sample from a pointer or stylus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrokeSample {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub timestamp_ms: u64,
}

/// A rasterized piece of a stroke: final pixel values for `rect` (canvas space).
#[derive(Clone, Debug)]
pub struct StrokeDab {
    pub rect: IRect,
    pub pixels: PixelBuffer,
}

/// External stroke-to-pixels service. Implementations own the brush physics;
/// the pipeline only folds their output into the document and history.
pub trait StrokeRenderer {
    /// Rasterize the segment from `from` (None on the first sample) to `to`
    /// against the current content of `layer`.
    fn render(&mut self, layer: &Layer, from: Option<&StrokeSample>, to: &StrokeSample) -> Vec<StrokeDab>;
}

struct StrokeState {
    layer: LayerId,
    last: Option<StrokeSample>,
}

/// What `pump()` did with each message it handled.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    Applied { request: Uuid, rect: IRect },
    /// Held back until the open history scope closes.
    Queued,
    /// Cancelled or unknown request; dropped without error.
    Discarded,
    /// The backend reported an error.
    Failed(String),
    Rejected(EditError),
}

// ---- pipeline ---------------------------------------------------------------

const MAX_REMEMBERED_CANCELS: usize = 256;

pub struct EditPipeline {
    sender: Sender<PipelineMessage>,
    receiver: Receiver<PipelineMessage>,
    /// Issued and still awaited.
    pending: HashMap<Uuid, GenerationRequest>,
    /// Recently cancelled ids, oldest first. Results for ids that fall off
    /// the end are still dropped, as unknown requests.
    cancelled: VecDeque<Uuid>,
    /// Results that arrived while a history scope was open, in arrival order.
    queued: VecDeque<GenerationResult>,
    stroke: Option<StrokeState>,
}

impl Default for EditPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl EditPipeline {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            pending: HashMap::new(),
            cancelled: VecDeque::new(),
            queued: VecDeque::new(),
            stroke: None,
        }
    }

    /// Sender half for background threads.
    pub fn inbox(&self) -> Sender<PipelineMessage> {
        self.sender.clone()
    }

    pub fn is_stroking(&self) -> bool {
        self.stroke.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    // ---- manual strokes ------------------------------------------------------

    /// Pointer-down: open the history scope every dab of this stroke folds into.
    pub fn begin_stroke(&mut self, doc: &Document, history: &mut HistoryManager, layer: LayerId) -> EditResult<()> {
        if self.stroke.is_some() {
            return Err(EditError::AlreadyRecording);
        }
        doc.layer(layer)?;
        if doc.tree().effectively_locked(layer) {
            return Err(EditError::LayerLocked(layer));
        }
        history.begin("Brush Stroke")?;
        self.stroke = Some(StrokeState { layer, last: None });
        Ok(())
    }

    /// Feed one sample through `renderer` and apply the resulting dabs.
    /// Returns the canvas area touched.
    pub fn stroke_to(
        &mut self,
        doc: &mut Document,
        history: &mut HistoryManager,
        renderer: &mut dyn StrokeRenderer,
        sample: StrokeSample,
    ) -> EditResult<IRect> {
        let stroke = self.stroke.as_ref().ok_or(EditError::NotRecording)?;
        let dabs = renderer.render(doc.layer(stroke.layer)?, stroke.last.as_ref(), &sample);
        let mut touched = IRect::EMPTY;
        for dab in &dabs {
            touched = touched.union(&self.apply_stroke_write(doc, history, dab)?);
        }
        if let Some(stroke) = self.stroke.as_mut() {
            stroke.last = Some(sample);
        }
        Ok(touched)
    }

    /// Apply one pre-rasterized dab. Dabs wholly outside the editable area
    /// are no-ops.
    pub fn apply_stroke_write(
        &mut self,
        doc: &mut Document,
        history: &mut HistoryManager,
        dab: &StrokeDab,
    ) -> EditResult<IRect> {
        let layer = self.stroke.as_ref().ok_or(EditError::NotRecording)?.layer;
        match doc.apply_masked_edit(history, layer, dab.rect, &dab.pixels) {
            Err(EditError::OutOfBounds) => Ok(IRect::EMPTY),
            other => other,
        }
    }

    /// Pointer-up: commit the stroke as one history entry, then merge any
    /// generation results that queued up behind it.
    pub fn end_stroke(&mut self, doc: &mut Document, history: &mut HistoryManager) -> EditResult<Vec<MergeOutcome>> {
        self.stroke.take().ok_or(EditError::NotRecording)?;
        history.commit(doc)?;
        Ok(self.pump(doc, history))
    }

    /// Drop the stroke and restore the layer to its pre-stroke pixels.
    pub fn abort_stroke(&mut self, doc: &mut Document, history: &mut HistoryManager) -> EditResult<()> {
        self.stroke.take().ok_or(EditError::NotRecording)?;
        history.cancel(doc)
    }

    // ---- generation -----------------------------------------------------------

    /// Capture a request for `layer` over the current selection (or the whole
    /// canvas when nothing is selected).
    pub fn issue_generation(
        &mut self,
        doc: &Document,
        layer: LayerId,
        params: GenerationParams,
    ) -> EditResult<GenerationRequest> {
        let target = doc.layer(layer)?;
        let selection = doc.selection();
        let region = if selection.is_empty() {
            doc.canvas_rect()
        } else {
            selection.bounding_box()
        };
        let bounds = target.canvas_bounds().unwrap_or(IRect::EMPTY);
        if !region.intersects(&bounds) {
            return Err(EditError::OutOfBounds);
        }
        let mask = if selection.is_empty() {
            GrayImage::from_pixel(region.width(), region.height(), Luma([255]))
        } else {
            selection.crop(region)
        };
        let request = GenerationRequest {
            id: Uuid::new_v4(),
            target_layer: layer,
            region,
            mask,
            source: doc.composite(region)?,
            params,
            canvas_size: (doc.width(), doc.height()),
            structure_revision: doc.structure_revision(),
        };
        log_info!("Generation {} issued for layer {} over {:?}", request.id, layer, region);
        self.pending.insert(request.id, request.clone());
        Ok(request)
    }

    /// Cancel an in-flight request. Its result, if it still arrives, is dropped.
    pub fn cancel_generation(&mut self, request_id: Uuid) -> bool {
        if self.pending.remove(&request_id).is_some() {
            if self.cancelled.len() == MAX_REMEMBERED_CANCELS {
                self.cancelled.pop_front();
            }
            self.cancelled.push_back(request_id);
            log_info!("Generation {} cancelled", request_id);
            true
        } else {
            false
        }
    }

    /// Run `backend` for `request` on a worker; the result lands in the inbox.
    pub fn spawn_generation(
        &self,
        request: GenerationRequest,
        backend: impl FnOnce(&GenerationRequest) -> Result<Vec<PixelBuffer>, String> + Send + 'static,
    ) {
        spawn_generation(request, self.inbox(), backend);
    }

    /// Drain the inbox on the mutation thread. Results merge in arrival
    /// order; while a history scope is open they are queued instead.
    pub fn pump(&mut self, doc: &mut Document, history: &mut HistoryManager) -> Vec<MergeOutcome> {
        let mut outcomes = Vec::new();
        let mut arrived = 0;
        while let Ok(msg) = self.receiver.try_recv() {
            match msg {
                PipelineMessage::Generated(result) => {
                    self.queued.push_back(result);
                    arrived += 1;
                }
                PipelineMessage::Failed { request_id, message } => {
                    outcomes.push(self.backend_failed(request_id, message));
                }
            }
        }
        if history.is_recording() {
            outcomes.extend(std::iter::repeat_n(MergeOutcome::Queued, arrived));
            return outcomes;
        }
        while let Some(result) = self.queued.pop_front() {
            outcomes.push(self.merge(doc, history, &result));
        }
        outcomes
    }

    /// Merge a result delivered directly rather than through the inbox.
    pub fn apply_generation(
        &mut self,
        doc: &mut Document,
        history: &mut HistoryManager,
        result: GenerationResult,
    ) -> MergeOutcome {
        if history.is_recording() {
            self.queued.push_back(result);
            return MergeOutcome::Queued;
        }
        self.merge(doc, history, &result)
    }

    fn forget_cancelled(&mut self, request_id: Uuid) -> bool {
        match self.cancelled.iter().position(|id| *id == request_id) {
            Some(pos) => {
                self.cancelled.remove(pos);
                true
            }
            None => false,
        }
    }

    fn backend_failed(&mut self, request_id: Uuid, message: String) -> MergeOutcome {
        if self.pending.remove(&request_id).is_some() {
            log_warn!("Generation {} failed: {}", request_id, message);
            MergeOutcome::Failed(message)
        } else {
            self.forget_cancelled(request_id);
            MergeOutcome::Discarded
        }
    }

    fn merge(&mut self, doc: &mut Document, history: &mut HistoryManager, result: &GenerationResult) -> MergeOutcome {
        let id = result.source_request_id;
        if self.forget_cancelled(id) {
            log_info!("Generation {} arrived after cancellation; discarded", id);
            return MergeOutcome::Discarded;
        }
        let Some(request) = self.pending.remove(&id) else {
            log_warn!("Generation {} does not match any pending request; discarded", id);
            return MergeOutcome::Discarded;
        };
        match Self::apply_result(doc, history, &request, result) {
            Ok(rect) => {
                log_info!("Generation {} merged into {} at {:?}", id, request.target_layer, rect);
                MergeOutcome::Applied { request: id, rect }
            }
            Err(e) => {
                log_warn!("Generation {} dropped: {}", id, e);
                MergeOutcome::Rejected(e)
            }
        }
    }

    fn apply_result(
        doc: &mut Document,
        history: &mut HistoryManager,
        request: &GenerationRequest,
        result: &GenerationResult,
    ) -> EditResult<IRect> {
        validate_target(doc, request)?;
        let candidate = result.selected_candidate().ok_or(EditError::FormatMismatch {
            expected: result.candidates.len(),
            actual: result.selected,
        })?;
        let mask = EditMask::Coverage { rect: request.region, mask: &request.mask };
        doc.apply_masked_edit_with(history, request.target_layer, request.region, candidate, mask)
    }
}

/// Check that the document can still take a result for `request`.
pub fn validate_target(doc: &Document, request: &GenerationRequest) -> EditResult<()> {
    let stale = |reason: String| Err(EditError::StaleGenerationTarget(reason));
    let layer = match doc.node(request.target_layer) {
        Ok(node) => match node.as_leaf() {
            Some(layer) => layer,
            None => return stale(format!("layer {} is no longer a pixel layer", request.target_layer)),
        },
        Err(_) => return stale(format!("layer {} was deleted", request.target_layer)),
    };
    if (doc.width(), doc.height()) != request.canvas_size {
        return stale(format!(
            "canvas resized from {}x{} to {}x{}",
            request.canvas_size.0,
            request.canvas_size.1,
            doc.width(),
            doc.height()
        ));
    }
    // An empty live selection restricts nothing, so the request's own mask stays in force.
    let selection = doc.selection();
    if !selection.is_empty() && selection.crop(request.region) != request.mask {
        return stale("selection changed since the request was issued".to_string());
    }
    if doc.structure_revision() != request.structure_revision {
        let bounds = layer.canvas_bounds().unwrap_or(IRect::EMPTY);
        if !request.region.intersects(&bounds) {
            return stale(format!("layer {} no longer covers the requested region", request.target_layer));
        }
    }
    Ok(())
}
