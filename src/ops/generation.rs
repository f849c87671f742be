// ============================================================================
// GENERATION BOUNDARY: requests out to a backend, results back in
// ============================================================================
//
// Transport, authentication and model choice live outside the engine. The
// engine hands a `GenerationRequest` to a backend closure and expects a
// `PipelineMessage` back on the pipeline inbox; nothing here touches the
// document from a background thread.

use std::sync::mpsc::Sender;

use image::GrayImage;
use uuid::Uuid;

use crate::geometry::IRect;
use crate::layer::LayerId;
use crate::log_err;
use crate::pixels::PixelBuffer;

/// Backend parameters forwarded untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    /// How far the result may depart from the source pixels (0.0–1.0).
    pub strength: f32,
    pub seed: Option<u64>,
    pub steps: u32,
    /// Number of candidate images requested.
    pub candidates: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            strength: 0.75,
            seed: None,
            steps: 30,
            candidates: 1,
        }
    }
}

impl GenerationParams {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Self::default() }
    }
}

/// Everything a backend needs, captured from the last committed document state.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub target_layer: LayerId,
    /// Canvas-space rect the result will be merged into.
    pub region: IRect,
    /// Selection coverage over `region` at issue time (all 255 if nothing was selected).
    pub mask: GrayImage,
    /// Composite of `region` at issue time.
    pub source: PixelBuffer,
    pub params: GenerationParams,
    pub canvas_size: (u32, u32),
    pub structure_revision: u64,
}

/// Candidate bitmaps for one request; `selected` picks the one to merge.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    pub source_request_id: Uuid,
    pub candidates: Vec<PixelBuffer>,
    pub selected: usize,
}

impl GenerationResult {
    pub fn new(source_request_id: Uuid, candidates: Vec<PixelBuffer>) -> Self {
        Self { source_request_id, candidates, selected: 0 }
    }

    pub fn with_selected(mut self, index: usize) -> Self {
        self.selected = index;
        self
    }

    pub fn selected_candidate(&self) -> Option<&PixelBuffer> {
        self.candidates.get(self.selected)
    }
}

/// Messages posted into the pipeline inbox from any thread.
#[derive(Debug)]
pub enum PipelineMessage {
    Generated(GenerationResult),
    Failed { request_id: Uuid, message: String },
}

/// Run `backend` on the rayon pool and post its outcome to `inbox`.
///
/// A panicking backend is caught and reported as `Failed`, so the
/// mutation thread always hears back about every request it issued.
pub fn spawn_generation(
    request: GenerationRequest,
    inbox: Sender<PipelineMessage>,
    backend: impl FnOnce(&GenerationRequest) -> Result<Vec<PixelBuffer>, String> + Send + 'static,
) {
    rayon::spawn(move || {
        let request_id = request.id;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| backend(&request)));
        let msg = match outcome {
            Ok(Ok(candidates)) => PipelineMessage::Generated(GenerationResult::new(request_id, candidates)),
            Ok(Err(message)) => PipelineMessage::Failed { request_id, message },
            Err(panic_info) => {
                let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.to_string()
                } else {
                    "unknown panic payload".to_string()
                };
                log_err!("Generation backend panicked for {}: {}", request_id, message);
                PipelineMessage::Failed { request_id, message }
            }
        };
        // Receiver gone means the pipeline was dropped; nothing left to notify.
        let _ = inbox.send(msg);
    });
}
