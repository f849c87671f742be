use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::blend::BlendMode;
use crate::document::Document;
use crate::error::PersistError;
use crate::geometry::LayerTransform;
use crate::layer::{Layer, LayerGroup, LayerId, LayerNode, LayerProps, LayerTree};
use crate::log_warn;
use crate::pixels::{CHANNELS, PixelBuffer};
use crate::selection::SelectionMask;

// ============================================================================
// PCD DOCUMENT FILE FORMAT
// ============================================================================

/// Magic header for the layered document container (v1)
const PCD_MAGIC_V1: &str = "PCD1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted document files.
pub const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of nodes (layers + groups) in a document file.
pub const MAX_NODES: usize = 256;

/// Serializable document. Nodes are stored in document order (parents
/// before children, siblings back-to-front), so writing the same document
/// twice produces identical bytes.
#[derive(Serialize, Deserialize)]
pub(crate) struct DocumentFileV1 {
    magic: String,
    width: u32,
    height: u32,
    active: Option<u64>,
    next_id: u64,
    nodes: Vec<NodeData>,
    /// Canvas-sized coverage bytes, absent when nothing is selected.
    selection: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct NodeData {
    id: u64,
    parent: Option<u64>,
    name: String,
    visible: bool,
    locked: bool,
    opacity: f32,
    blend_mode: u8,
    kind: NodeKind,
}

#[derive(Serialize, Deserialize)]
enum NodeKind {
    Group,
    Leaf {
        width: u32,
        height: u32,
        origin_x: i32,
        origin_y: i32,
        transform: LayerTransform,
        pixels: Vec<u8>,
    },
}

/// Build the serializable file contents from a document.
pub(crate) fn build_document_file(doc: &Document) -> DocumentFileV1 {
    let tree = doc.tree();
    let nodes = tree
        .walk()
        .into_iter()
        .filter_map(|id| tree.get(id))
        .map(|node| {
            let props = node.props();
            let kind = match node {
                LayerNode::Group(_) => NodeKind::Group,
                LayerNode::Leaf(layer) => NodeKind::Leaf {
                    width: layer.pixels.width(),
                    height: layer.pixels.height(),
                    origin_x: layer.origin.0,
                    origin_y: layer.origin.1,
                    transform: layer.transform,
                    pixels: layer.pixels.data().to_vec(),
                },
            };
            NodeData {
                id: node.id().0,
                parent: node.parent().map(|p| p.0),
                name: props.name.clone(),
                visible: props.visible,
                locked: props.locked,
                opacity: props.opacity,
                blend_mode: props.blend_mode.to_u8(),
                kind,
            }
        })
        .collect();

    DocumentFileV1 {
        magic: PCD_MAGIC_V1.to_string(),
        width: doc.width(),
        height: doc.height(),
        active: doc.active_layer().map(|id| id.0),
        next_id: tree.next_id(),
        nodes,
        selection: doc.selection().to_raw(),
    }
}

/// Encode a document to bytes.
pub fn to_bytes(doc: &Document) -> Result<Vec<u8>, PersistError> {
    Ok(bincode::serialize(&build_document_file(doc))?)
}

/// Save a document as a `.pcd` file.
pub fn save_document(doc: &Document, path: &Path) -> Result<(), PersistError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, &build_document_file(doc))?;
    writer.flush()?;
    Ok(())
}

/// Load a `.pcd` file.
pub fn load_document(path: &Path) -> Result<Document, PersistError> {
    let raw = std::fs::read(path)?;
    from_bytes(&raw).inspect_err(|e| log_warn!("Rejected document {}: {}", path.display(), e))
}

/// Decode and validate a document.
pub fn from_bytes(raw: &[u8]) -> Result<Document, PersistError> {
    if raw.len() < 12 {
        return Err(PersistError::InvalidFormat("File too small".into()));
    }
    // bincode encodes a String as an 8-byte length prefix + UTF-8 data, so
    // bytes 8..12 hold the 4-char magic.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    match magic {
        "PCD1" => load_v1(bincode::deserialize(raw)?),
        _ => Err(PersistError::InvalidFormat(format!("Unknown magic '{}'", magic))),
    }
}

fn invalid(msg: String) -> PersistError {
    PersistError::InvalidFormat(msg)
}

fn load_v1(file: DocumentFileV1) -> Result<Document, PersistError> {
    if file.width == 0 || file.height == 0 {
        return Err(invalid("Canvas dimensions cannot be zero".into()));
    }
    if file.width > MAX_CANVAS_DIM || file.height > MAX_CANVAS_DIM {
        return Err(invalid(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            file.width, file.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if file.nodes.len() > MAX_NODES {
        return Err(invalid(format!(
            "Document contains {} layers, which exceeds the maximum of {}",
            file.nodes.len(),
            MAX_NODES
        )));
    }

    let mut tree = LayerTree::with_next_id(file.next_id);
    let mut seen = HashSet::new();
    for nd in file.nodes {
        if nd.id == 0 || nd.id >= file.next_id || !seen.insert(nd.id) {
            return Err(invalid(format!("Layer id {} is invalid or duplicated", nd.id)));
        }
        if !(0.0..=1.0).contains(&nd.opacity) {
            return Err(invalid(format!("Layer '{}' has opacity {}", nd.name, nd.opacity)));
        }
        let blend_mode = BlendMode::from_u8(nd.blend_mode)
            .ok_or_else(|| invalid(format!("Layer '{}' has unknown blend mode {}", nd.name, nd.blend_mode)))?;
        let id = LayerId(nd.id);
        let props = LayerProps { name: nd.name, visible: nd.visible, locked: nd.locked, opacity: nd.opacity, blend_mode };

        let node = match nd.kind {
            NodeKind::Group => {
                let mut group = LayerGroup::new(id, "");
                group.props = props;
                LayerNode::Group(group)
            }
            NodeKind::Leaf { width, height, origin_x, origin_y, transform, pixels } => {
                let expected = width as usize * height as usize * CHANNELS;
                if pixels.len() != expected {
                    return Err(invalid(format!(
                        "Layer '{}' has {} bytes of pixel data, expected {}",
                        props.name,
                        pixels.len(),
                        expected
                    )));
                }
                if !transform.is_invertible() {
                    return Err(invalid(format!("Layer '{}' has a degenerate transform", props.name)));
                }
                let mut layer = Layer::new(id, "", PixelBuffer::from_raw(width, height, pixels)?);
                layer.props = props;
                layer.origin = (origin_x, origin_y);
                layer.transform = transform;
                if layer.canvas_bounds().is_none() {
                    return Err(invalid(format!("Layer '{}' lies outside 32-bit coordinates", layer.props.name)));
                }
                LayerNode::Leaf(layer)
            }
        };
        let parent = nd.parent.map(LayerId);
        // Parents precede children, so appending rebuilds sibling order.
        let index = tree.children(parent)?.len();
        tree.insert(node, parent, index)?;
    }

    let selection = SelectionMask::from_raw(file.width, file.height, file.selection)?;
    let active = file.active.map(LayerId);
    if active.is_some_and(|id| !tree.contains(id)) {
        return Err(invalid("Active layer does not exist".into()));
    }
    Ok(Document::from_parts(file.width, file.height, tree, active, selection)?)
}

/// Flatten a document and write it as PNG.
pub fn export_png(doc: &Document, path: &Path) -> Result<(), PersistError> {
    let flat = doc.composite_full()?;
    flat.to_rgba_image()
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| PersistError::Serialize(e.to_string()))
}
