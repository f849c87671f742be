use paintcore::io::{export_png, from_bytes, load_document, save_document, to_bytes};
use paintcore::{
    BlendMode, Document, HistoryManager, LayerTransform, NewLayer, PersistError, SelectionMode, SelectionShape,
    SelectionSource,
};
use tempfile::TempDir;

fn three_layer_document() -> Document {
    let mut doc = Document::with_background(40, 30, [250, 250, 250, 255]).unwrap();
    let mut history = HistoryManager::default();
    let group = doc.add_group(&mut history, "shapes", None, None).unwrap();
    let red = doc
        .add_layer(&mut history, NewLayer::new("red", 20, 10).filled([220, 20, 20, 255]).at(5, 5).inside(group))
        .unwrap();
    let blue = doc
        .add_layer(&mut history, NewLayer::new("blue", 12, 12).filled([20, 20, 220, 200]).at(15, 8))
        .unwrap();
    doc.set_layer_blend_mode(&mut history, blue, BlendMode::Screen).unwrap();
    doc.set_layer_opacity(&mut history, blue, 0.6).unwrap();
    doc.set_layer_transform(&mut history, red, LayerTransform::translation(3.0, -2.0)).unwrap();
    doc.set_layer_opacity(&mut history, group, 0.8).unwrap();
    doc.set_layer_locked(&mut history, red, true).unwrap();
    let ellipse = SelectionShape::Ellipse { cx: 20.0, cy: 15.0, rx: 8.0, ry: 5.0 };
    doc.set_selection(&mut history, &SelectionSource::Shape(ellipse), SelectionMode::Replace).unwrap();
    doc
}

#[test]
fn save_and_reload_preserves_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scene.pcd");
    let doc = three_layer_document();
    save_document(&doc, &path).unwrap();
    let loaded = load_document(&path).unwrap();

    assert_eq!((loaded.width(), loaded.height()), (40, 30));
    assert_eq!(loaded.composite_full().unwrap(), doc.composite_full().unwrap());
    assert_eq!(loaded.selection(), doc.selection());
    assert_eq!(loaded.active_layer(), doc.active_layer());
    assert_eq!(loaded.tree().walk(), doc.tree().walk());
    for id in doc.tree().walk() {
        let (a, b) = (doc.node(id).unwrap(), loaded.node(id).unwrap());
        assert_eq!(a.props(), b.props());
        assert_eq!(a.parent(), b.parent());
        if let (Some(la), Some(lb)) = (a.as_leaf(), b.as_leaf()) {
            assert_eq!(la.origin, lb.origin);
            assert_eq!(la.transform, lb.transform);
            assert_eq!(la.pixels, lb.pixels);
        }
    }
    // Saving the reloaded document is byte-identical.
    assert_eq!(to_bytes(&loaded).unwrap(), std::fs::read(&path).unwrap());
}

#[test]
fn reloaded_document_accepts_new_layers_without_id_reuse() {
    let doc = three_layer_document();
    let mut loaded = from_bytes(&to_bytes(&doc).unwrap()).unwrap();
    let mut history = HistoryManager::default();
    let fresh = loaded.add_layer(&mut history, NewLayer::new("fresh", 4, 4)).unwrap();
    assert!(!doc.tree().contains(fresh));
}

#[test]
fn truncated_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.pcd");
    let bytes = to_bytes(&three_layer_document()).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    assert!(load_document(&path).is_err());
}

#[test]
fn missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(load_document(&dir.path().join("nope.pcd")), Err(PersistError::Io(_))));
}

#[test]
fn png_export_matches_composite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flat.png");
    let doc = three_layer_document();
    export_png(&doc, &path).unwrap();
    let png = image::open(&path).unwrap().to_rgba8();
    assert_eq!(png.dimensions(), (40, 30));
    assert_eq!(png.as_raw().as_slice(), doc.composite_full().unwrap().data());
}
