// ============================================================================
// PaintCore CLI: headless document inspection and flattening
// ============================================================================
//
// Usage examples:
//   PaintCore info poster.pcd
//   PaintCore flatten -i poster.pcd -o poster.png
//   PaintCore flatten -i "drafts/*.pcd" --output-dir out/
//   PaintCore new --width 1920 --height 1080 -o blank.pcd --background 255,255,255,255

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};

use paintcore::io::{export_png, load_document, save_document};
use paintcore::layer::LayerNode;
use paintcore::{Document, log_info};

/// PaintCore headless document tool.
#[derive(Parser, Debug)]
#[command(name = "PaintCore", about = "Inspect, flatten and create layered PaintCore documents")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Print per-file timing information.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print canvas size, selection and the layer tree of a document.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Composite documents to PNG.
    Flatten {
        /// Input file(s). Glob patterns accepted (e.g. "*.pcd").
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<String>,

        /// Output file path. Only valid for single-file input.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Output directory for batch processing.
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Write a new document with one background layer.
    New {
        #[arg(long, default_value_t = 800)]
        width: u32,
        #[arg(long, default_value_t = 600)]
        height: u32,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        /// Background colour as "r,g,b,a".
        #[arg(long, default_value = "255,255,255,255", value_name = "R,G,B,A")]
        background: String,
    },
}

/// Run the selected command and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let result = match args.command {
        CliCommand::Info { file } => info(&file),
        CliCommand::Flatten { input, output, output_dir } => {
            return flatten(&input, output.as_deref(), output_dir.as_deref(), args.verbose);
        }
        CliCommand::New { width, height, output, background } => new_document(width, height, &output, &background),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn info(path: &Path) -> Result<(), String> {
    let doc = load_document(path).map_err(|e| format!("load failed: {}", e))?;
    println!("{}", path.display());
    println!("  canvas:    {}x{}", doc.width(), doc.height());
    let sel = doc.selection();
    if sel.is_empty() {
        println!("  selection: none");
    } else {
        let bb = sel.bounding_box();
        println!("  selection: {}x{} at ({}, {})", bb.width(), bb.height(), bb.x0, bb.y0);
    }
    println!("  layers:");
    let tree = doc.tree();
    for id in tree.walk() {
        let Some(node) = tree.get(id) else { continue };
        let mut depth = 0;
        let mut cursor = node.parent();
        while let Some(p) = cursor {
            depth += 1;
            cursor = tree.get(p).and_then(|n| n.parent());
        }
        let props = node.props();
        let kind = match node {
            LayerNode::Group(g) => format!("group, {} children", g.children.len()),
            LayerNode::Leaf(l) => format!(
                "{}x{} at ({}, {})",
                l.pixels.width(),
                l.pixels.height(),
                l.origin.0,
                l.origin.1
            ),
        };
        let active = if doc.active_layer() == Some(id) { " *" } else { "" };
        println!(
            "    {}{} '{}' [{}] {} {:.0}%{}{}{}",
            "  ".repeat(depth),
            id,
            props.name,
            kind,
            props.blend_mode.name(),
            props.opacity * 100.0,
            if props.visible { "" } else { " hidden" },
            if props.locked { " locked" } else { "" },
            active,
        );
    }
    Ok(())
}

fn flatten(patterns: &[String], output: Option<&Path>, output_dir: Option<&Path>, verbose: bool) -> ExitCode {
    let inputs = resolve_inputs(patterns);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }
    if inputs.len() > 1 && output.is_some() && output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }
    if let Some(dir) = output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;
    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let start = Instant::now();
        let Some(output_path) = build_output_path(input_path, output, output_dir) else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };
        let result = load_document(input_path)
            .and_then(|doc| export_png(&doc, &output_path))
            .map_err(|e| e.to_string());
        match result {
            Ok(()) => {
                log_info!("CLI: flattened {} -> {}", input_path.display(), output_path.display());
                if verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }
    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn new_document(width: u32, height: u32, output: &Path, background: &str) -> Result<(), String> {
    let color = parse_color(background).ok_or_else(|| format!("invalid colour '{}'", background))?;
    let doc = Document::with_background(width, height, color).map_err(|e| e.to_string())?;
    save_document(&doc, output).map_err(|e| format!("save failed: {}", e))?;
    println!("{} ({}x{})", output.display(), width, height);
    Ok(())
}

/// Parse "r,g,b,a".
fn parse_color(s: &str) -> Option<[u8; 4]> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut out = [0u8; 4];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part.trim().parse().ok()?;
    }
    Some(out)
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let as_path = Path::new(pattern);
        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }
        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => eprintln!("warning: invalid glob '{}': {}", pattern, e),
        }
    }
    result
}

/// Output path priority: `--output`, then `--output-dir/<stem>.png`, then
/// `<stem>.png` next to the input.
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }
    let stem = input.file_stem()?.to_string_lossy().into_owned();
    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{}.png", stem)));
    }
    let parent = input.parent().unwrap_or(Path::new("."));
    Some(parent.join(format!("{}.png", stem)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_parsing() {
        assert_eq!(parse_color("1, 2,3,255"), Some([1, 2, 3, 255]));
        assert_eq!(parse_color("1,2,3"), None);
        assert_eq!(parse_color("1,2,3,300"), None);
    }

    #[test]
    fn output_path_priority() {
        let input = Path::new("art/poster.pcd");
        assert_eq!(build_output_path(input, Some(Path::new("x.png")), None), Some(PathBuf::from("x.png")));
        assert_eq!(build_output_path(input, None, Some(Path::new("out"))), Some(PathBuf::from("out/poster.png")));
        assert_eq!(build_output_path(input, None, None), Some(PathBuf::from("art/poster.png")));
    }

    #[test]
    fn args_parse() {
        let args = CliArgs::parse_from(["PaintCore", "flatten", "-i", "a.pcd", "b.pcd", "--output-dir", "out"]);
        match args.command {
            CliCommand::Flatten { input, output_dir, .. } => {
                assert_eq!(input, vec!["a.pcd", "b.pcd"]);
                assert_eq!(output_dir, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
