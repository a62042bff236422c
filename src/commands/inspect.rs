use crate::classify::skip_detail;
use crate::fits::{format_fits_metadata, read_fits_metadata, validate_image_file, FitsMetadata};
use anyhow::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub fn inspect(path: &str, verbose: bool, format: &str) -> Result<()> {
    let path = Path::new(path);

    if path.is_file() {
        inspect_single(path, verbose, format)?;
    } else if path.is_dir() {
        inspect_directory(path, verbose, format)?;
    } else {
        return Err(anyhow::anyhow!(
            "Path does not exist or is not accessible: {}",
            path.display()
        ));
    }

    Ok(())
}

/// Short summary of a frame, plus whether the stacker would accept it.
#[derive(Serialize)]
struct FrameSummary {
    filename: String,
    width: Option<usize>,
    height: Option<usize>,
    bit_depth: Option<i32>,
    bayer_pattern: Option<String>,
    image_type: Option<String>,
    date_obs: Option<String>,
    exposure: Option<String>,
    object: Option<String>,
    /// Why the stacker would skip this file, if it would
    unsupported: Option<String>,
}

fn summarize(path: &Path, metadata: &FitsMetadata) -> FrameSummary {
    let header = |keys: &[&str]| keys.iter().find_map(|k| metadata.get(k)).map(str::to_string);
    FrameSummary {
        filename: metadata.filename.clone(),
        width: metadata.image_info.as_ref().map(|i| i.width),
        height: metadata.image_info.as_ref().map(|i| i.height),
        bit_depth: metadata.image_info.as_ref().map(|i| i.bit_depth),
        bayer_pattern: header(&["BAYERPAT"]),
        image_type: header(&["IMAGETYP", "FRAME"]),
        date_obs: header(&["DATE-OBS"]),
        exposure: header(&["EXPTIME", "EXPOSURE"]),
        object: header(&["OBJECT", "OBJNAME"]),
        unsupported: validate_image_file(path).err().map(|e| skip_detail(&e)),
    }
}

fn inspect_single(path: &Path, verbose: bool, format: &str) -> Result<()> {
    let metadata = read_fits_metadata(path)?;

    match format.to_lowercase().as_str() {
        "json" => {
            let json = if verbose {
                serde_json::to_string_pretty(&metadata)?
            } else {
                serde_json::to_string_pretty(&summarize(path, &metadata))?
            };
            println!("{}", json);
        }
        _ => {
            println!("Reading FITS file: {}\n", path.display());
            println!("{}", format_fits_metadata(&metadata, verbose));
            if let Some(reason) = summarize(path, &metadata).unsupported {
                println!("Not stackable: {}", reason);
            }
        }
    }

    Ok(())
}

fn inspect_directory(dir: &Path, verbose: bool, format: &str) -> Result<()> {
    let mut fits_files = Vec::new();
    find_fits_files(dir, &mut fits_files)?;
    fits_files.sort();

    if fits_files.is_empty() {
        match format.to_lowercase().as_str() {
            "json" => println!("[]"),
            _ => println!("No FITS files found in directory."),
        }
        return Ok(());
    }

    let mut successful = Vec::new();
    let mut errors = Vec::new();
    for file_path in &fits_files {
        match read_fits_metadata(file_path) {
            Ok(metadata) => successful.push((file_path.clone(), metadata)),
            Err(e) => errors.push((file_path.clone(), skip_detail(&e))),
        }
    }

    match format.to_lowercase().as_str() {
        "json" => {
            let json = if verbose {
                let all: Vec<&FitsMetadata> = successful.iter().map(|(_, m)| m).collect();
                serde_json::to_string_pretty(&all)?
            } else {
                let summaries: Vec<FrameSummary> =
                    successful.iter().map(|(p, m)| summarize(p, m)).collect();
                serde_json::to_string_pretty(&summaries)?
            };
            println!("{}", json);
        }
        _ => {
            println!("Scanning directory: {}\n", dir.display());
            println!("Found {} FITS files\n", fits_files.len());

            if verbose {
                for (index, (_, metadata)) in successful.iter().enumerate() {
                    println!("File {}/{}:", index + 1, fits_files.len());
                    println!("{}", format_fits_metadata(metadata, verbose));
                    if index < successful.len() - 1 {
                        println!("{:-<60}", "");
                    }
                }
            } else {
                println!(
                    "{:<32} {:>6} {:>6} {:>6} {:<6} {:<10} {:>8}",
                    "File", "Width", "Height", "BITPIX", "CFA", "Type", "Exp (s)"
                );
                for (path, metadata) in &successful {
                    let s = summarize(path, metadata);
                    println!(
                        "{:<32} {:>6} {:>6} {:>6} {:<6} {:<10} {:>8}{}",
                        s.filename,
                        s.width.map(|v| v.to_string()).unwrap_or_default(),
                        s.height.map(|v| v.to_string()).unwrap_or_default(),
                        s.bit_depth.map(|v| v.to_string()).unwrap_or_default(),
                        s.bayer_pattern.unwrap_or_else(|| "-".to_string()),
                        s.image_type.unwrap_or_else(|| "-".to_string()),
                        s.exposure.unwrap_or_else(|| "-".to_string()),
                        s.unsupported
                            .map(|r| format!("  [not stackable: {}]", r))
                            .unwrap_or_default()
                    );
                }
            }

            println!("\nSummary:");
            println!("  Successfully read: {}", successful.len());
            if !errors.is_empty() {
                println!("  Errors: {}", errors.len());
                for (path, detail) in &errors {
                    println!("    {}: {}", path.display(), detail);
                }
            }
        }
    }

    Ok(())
}

fn find_fits_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            find_fits_files(&path, files)?;
        } else if is_fits_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_fits_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_lowercase().as_str(), "fits" | "fit" | "fts"))
        .unwrap_or(false)
}
