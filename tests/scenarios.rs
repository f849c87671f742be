use paintcore::{
    BlendMode, Document, EditError, EditPipeline, GenerationParams, GenerationResult, HistoryManager, IRect,
    MergeOutcome, NewLayer, PixelBuffer, SelectionMode, SelectionShape, SelectionSource,
};

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

#[test]
fn multiply_layer_over_red_then_undo() {
    let mut doc = Document::new(100, 100).unwrap();
    let mut history = HistoryManager::default();
    doc.add_layer(&mut history, NewLayer::new("A", 100, 100).filled(RED)).unwrap();

    history.begin("Add B").unwrap();
    let b = doc.add_layer(&mut history, NewLayer::new("B", 50, 50).filled(BLUE).at(25, 25)).unwrap();
    doc.set_layer_blend_mode(&mut history, b, BlendMode::Multiply).unwrap();
    doc.set_layer_opacity(&mut history, b, 0.5).unwrap();
    history.commit(&doc).unwrap();

    let out = doc.composite_full().unwrap();
    // multiply(red, blue) = black; half of it over opaque red leaves half red.
    let expected_r = (255.0f32 * 0.5).round() as u8;
    assert_eq!(out.get_pixel(50, 50), [expected_r, 0, 0, 255]);
    assert_eq!(out.get_pixel(0, 0), RED);
    assert_eq!(out.get_pixel(24, 50), RED);

    history.undo(&mut doc).unwrap();
    assert!(!doc.tree().contains(b));
    let out = doc.composite_full().unwrap();
    assert!(out.data().chunks_exact(4).all(|px| px == RED));
}

#[test]
fn generation_for_deleted_layer_is_stale() {
    let mut doc = Document::with_background(64, 64, [255, 255, 255, 255]).unwrap();
    let mut history = HistoryManager::default();
    let mut pipeline = EditPipeline::new();
    let target = doc.add_layer(&mut history, NewLayer::new("paint", 64, 64)).unwrap();
    let region = SelectionSource::Shape(SelectionShape::Rectangle(IRect::new(10, 10, 20, 20)));
    doc.set_selection(&mut history, &region, SelectionMode::Replace).unwrap();

    let request = pipeline.issue_generation(&doc, target, GenerationParams::prompt("a cat")).unwrap();
    assert_eq!(request.region, IRect::new(10, 10, 20, 20));
    assert_eq!(request.mask.dimensions(), (20, 20));

    doc.remove_layer(&mut history, target).unwrap();
    let before = paintcore::io::to_bytes(&doc).unwrap();
    let entries = history.undo_count();

    let result = GenerationResult::new(request.id, vec![PixelBuffer::filled(20, 20, BLUE).unwrap()]);
    let outcome = pipeline.apply_generation(&mut doc, &mut history, result);
    assert!(matches!(outcome, MergeOutcome::Rejected(EditError::StaleGenerationTarget(_))));
    assert_eq!(paintcore::io::to_bytes(&doc).unwrap(), before);
    assert_eq!(history.undo_count(), entries);
}

#[test]
fn generation_after_canvas_resize_is_stale() {
    let mut doc = Document::with_background(32, 32, RED).unwrap();
    let mut history = HistoryManager::default();
    let mut pipeline = EditPipeline::new();
    let layer = doc.active_layer().unwrap();
    let request = pipeline.issue_generation(&doc, layer, GenerationParams::default()).unwrap();
    doc.resize_canvas(&mut history, 40, 40, paintcore::Anchor::TopLeft).unwrap();
    let result = GenerationResult::new(request.id, vec![PixelBuffer::filled(32, 32, BLUE).unwrap()]);
    let outcome = pipeline.apply_generation(&mut doc, &mut history, result);
    assert!(matches!(outcome, MergeOutcome::Rejected(EditError::StaleGenerationTarget(_))));
}

#[test]
fn generation_merges_through_soft_mask() {
    let mut doc = Document::with_background(8, 8, RED).unwrap();
    let mut history = HistoryManager::default();
    let mut pipeline = EditPipeline::new();
    let layer = doc.active_layer().unwrap();
    let mut soft = image::GrayImage::new(4, 1);
    soft.put_pixel(0, 0, image::Luma([255]));
    soft.put_pixel(1, 0, image::Luma([128]));
    let source = SelectionSource::Coverage { x: 2, y: 2, mask: soft };
    doc.set_selection(&mut history, &source, SelectionMode::Replace).unwrap();

    let request = pipeline.issue_generation(&doc, layer, GenerationParams::default()).unwrap();
    assert_eq!(request.region, IRect::new(2, 2, 2, 1));
    // The live selection changes before the result lands; the request's snapshot still governs.
    doc.clear_selection(&mut history).unwrap();

    let result = GenerationResult::new(request.id, vec![PixelBuffer::filled(2, 1, BLUE).unwrap()]);
    let outcome = pipeline.apply_generation(&mut doc, &mut history, result);
    assert_eq!(outcome, MergeOutcome::Applied { request: request.id, rect: IRect::new(2, 2, 2, 1) });
    let px = &doc.layer(layer).unwrap().pixels;
    assert_eq!(px.get_pixel(2, 2), BLUE);
    assert_eq!(px.get_pixel(3, 2), [127, 0, 128, 255]);
    assert_eq!(px.get_pixel(4, 2), RED);
    assert_eq!(history.undo_description().as_deref(), Some("Edit Pixels"));
}

#[test]
fn spawned_backend_result_arrives_through_inbox() {
    let mut doc = Document::with_background(8, 8, RED).unwrap();
    let mut history = HistoryManager::default();
    let mut pipeline = EditPipeline::new();
    let layer = doc.active_layer().unwrap();
    let request = pipeline.issue_generation(&doc, layer, GenerationParams::default()).unwrap();
    pipeline.spawn_generation(request.clone(), |req| {
        Ok(vec![PixelBuffer::filled(req.region.width(), req.region.height(), BLUE).map_err(|e| e.to_string())?])
    });

    let mut outcomes = Vec::new();
    for _ in 0..500 {
        outcomes = pipeline.pump(&mut doc, &mut history);
        if !outcomes.is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(outcomes, vec![MergeOutcome::Applied { request: request.id, rect: IRect::new(0, 0, 8, 8) }]);
    assert_eq!(doc.composite_full().unwrap().get_pixel(4, 4), BLUE);
}

#[test]
fn panicking_backend_reports_failure() {
    let mut doc = Document::with_background(4, 4, RED).unwrap();
    let mut history = HistoryManager::default();
    let mut pipeline = EditPipeline::new();
    let layer = doc.active_layer().unwrap();
    let request = pipeline.issue_generation(&doc, layer, GenerationParams::default()).unwrap();
    pipeline.spawn_generation(request, |_| panic!("backend exploded"));

    let mut outcomes = Vec::new();
    for _ in 0..500 {
        outcomes = pipeline.pump(&mut doc, &mut history);
        if !outcomes.is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(outcomes, vec![MergeOutcome::Failed("backend exploded".to_string())]);
    assert_eq!(history.undo_count(), 0);
}

#[test]
fn generation_after_selection_moved_is_stale() {
    let mut doc = Document::with_background(32, 32, RED).unwrap();
    let mut history = HistoryManager::default();
    let mut pipeline = EditPipeline::new();
    let layer = doc.active_layer().unwrap();
    let first = SelectionSource::Shape(SelectionShape::Rectangle(IRect::new(0, 0, 8, 8)));
    doc.set_selection(&mut history, &first, SelectionMode::Replace).unwrap();
    let request = pipeline.issue_generation(&doc, layer, GenerationParams::default()).unwrap();

    let moved = SelectionSource::Shape(SelectionShape::Rectangle(IRect::new(20, 20, 8, 8)));
    doc.set_selection(&mut history, &moved, SelectionMode::Replace).unwrap();
    let entries = history.undo_count();

    let result = GenerationResult::new(request.id, vec![PixelBuffer::filled(8, 8, BLUE).unwrap()]);
    let outcome = pipeline.apply_generation(&mut doc, &mut history, result);
    assert!(matches!(outcome, MergeOutcome::Rejected(EditError::StaleGenerationTarget(_))));
    assert_eq!(doc.layer(layer).unwrap().pixels.get_pixel(0, 0), RED);
    assert_eq!(history.undo_count(), entries);
}

#[test]
fn generation_with_unchanged_selection_still_merges() {
    let mut doc = Document::with_background(32, 32, RED).unwrap();
    let mut history = HistoryManager::default();
    let mut pipeline = EditPipeline::new();
    let layer = doc.active_layer().unwrap();
    let region = SelectionSource::Shape(SelectionShape::Rectangle(IRect::new(4, 4, 8, 8)));
    doc.set_selection(&mut history, &region, SelectionMode::Replace).unwrap();
    let request = pipeline.issue_generation(&doc, layer, GenerationParams::default()).unwrap();
    // Unrelated structural edit in between.
    doc.add_layer(&mut history, NewLayer::new("notes", 4, 4)).unwrap();

    let result = GenerationResult::new(request.id, vec![PixelBuffer::filled(8, 8, BLUE).unwrap()]);
    let outcome = pipeline.apply_generation(&mut doc, &mut history, result);
    assert_eq!(outcome, MergeOutcome::Applied { request: request.id, rect: IRect::new(4, 4, 8, 8) });
    let px = &doc.layer(layer).unwrap().pixels;
    assert_eq!(px.get_pixel(4, 4), BLUE);
    assert_eq!(px.get_pixel(3, 3), RED);
}
