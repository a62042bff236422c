use crate::classify::{FrameClassifier, FrameRef};
use anyhow::{Context, Result};
use std::path::Path;

pub fn classify_frames(root: &str, format: &str) -> Result<()> {
    let root_path = Path::new(root);
    let classification = FrameClassifier::new()
        .classify(root_path)
        .with_context(|| format!("Failed to classify {}", root))?;

    match format.to_lowercase().as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
        _ => {
            println!("Classification of {}", root);
            println!("{:-<60}", "");
            print_group("Lights", &classification.lights, root_path);
            print_group("Darks", &classification.darks, root_path);

            if !classification.skipped.is_empty() {
                println!("\nSkipped ({}):", classification.skipped.len());
                for skip in &classification.skipped {
                    println!("  {} - {}", relative(&skip.path, root_path), skip.reason);
                }
            }
        }
    }

    Ok(())
}

fn print_group(title: &str, frames: &[FrameRef], root: &Path) {
    println!("\n{} ({}):", title, frames.len());
    println!("{:<8} {}", "Index", "File");
    for frame in frames {
        let index = frame
            .index
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<8} {}", index, relative(&frame.path, root));
    }
}

fn relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
