use crate::error::{FrameSkip, Result, SkipReason, Stage, StackError};
use crate::fits::validate_image_file;
use crate::frame::FrameKind;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const FITS_EXTENSIONS: &[&str] = &["fit", "fits", "fts"];
/// Raster files a smart telescope drops next to its FITS frames
const FOREIGN_RASTER_EXTENSIONS: &[&str] = &["tif", "tiff", "jpg", "jpeg", "png"];
/// Folders this tool writes into, plus the conventional home of RGB previews
const RESERVED_DIRS: &[&str] = &["process", "masters", "reference", "stacked"];

/// A discovered raster and what it was classified as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameRef {
    pub path: PathBuf,
    pub kind: FrameKind,
    /// Frame number embedded in the file name, if any
    pub index: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Classification {
    pub lights: Vec<FrameRef>,
    pub darks: Vec<FrameRef>,
    pub skipped: Vec<FrameSkip>,
}

/// Partitions the rasters under a root folder into lights and darks by
/// file-name tokens, whatever the folder layout.
pub struct FrameClassifier {
    dark_tokens: Vec<String>,
    excluded_dirs: Vec<PathBuf>,
    max_depth: usize,
    index_pattern: Regex,
}

impl Default for FrameClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClassifier {
    pub fn new() -> Self {
        Self {
            dark_tokens: vec!["dark".to_string()],
            excluded_dirs: Vec::new(),
            max_depth: 3,
            // Last run of digits in the stem
            index_pattern: Regex::new(r"(\d+)\D*$").expect("static regex"),
        }
    }

    /// Never descend into `dir` (used for the run's own output folder).
    pub fn excluding(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded_dirs.push(dir.into());
        self
    }

    pub fn with_dark_tokens(mut self, tokens: &[&str]) -> Self {
        self.dark_tokens = tokens.iter().map(|t| t.to_lowercase()).collect();
        self
    }

    pub fn classify(&self, root: &Path) -> Result<Classification> {
        if let Err(source) = fs::read_dir(root) {
            return Err(StackError::RootInaccessible {
                path: root.to_path_buf(),
                source,
            });
        }

        let mut files = Vec::new();
        self.collect_files(root, 0, &mut files)?;
        files.sort();

        let mut classification = Classification::default();
        for path in files {
            let ext = extension_of(&path).unwrap_or_default();
            if !FITS_EXTENSIONS.contains(&ext.as_str()) {
                let detail = if FOREIGN_RASTER_EXTENSIONS.contains(&ext.as_str()) {
                    format!(".{} is not a single-plane CFA container", ext)
                } else {
                    "not a FITS file".to_string()
                };
                classification.skipped.push(FrameSkip::new(
                    &path,
                    Stage::Classification,
                    SkipReason::UnsupportedFormat { detail },
                ));
                continue;
            }

            let metadata = match validate_image_file(&path) {
                Ok((metadata, _)) => metadata,
                Err(e) => {
                    classification.skipped.push(FrameSkip::new(
                        &path,
                        Stage::Classification,
                        SkipReason::UnsupportedFormat {
                            detail: skip_detail(&e),
                        },
                    ));
                    continue;
                }
            };

            let image_type = metadata.get("IMAGETYP").map(str::to_lowercase);
            let kind = if self.is_dark_name(root, &path)
                || image_type
                    .as_deref()
                    .is_some_and(|t| self.dark_tokens.iter().any(|tok| t.contains(tok.as_str())))
            {
                FrameKind::Dark
            } else {
                FrameKind::Light
            };

            let frame = FrameRef {
                index: self.frame_index(&path),
                path,
                kind,
            };
            match kind {
                FrameKind::Dark => classification.darks.push(frame),
                _ => classification.lights.push(frame),
            }
        }

        sort_frames(&mut classification.lights);
        sort_frames(&mut classification.darks);

        tracing::info!(
            "Classified {}: {} light(s), {} dark(s), {} skipped",
            root.display(),
            classification.lights.len(),
            classification.darks.len(),
            classification.skipped.len()
        );

        Ok(classification)
    }

    fn collect_files(&self, dir: &Path, depth: usize, files: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                if depth >= self.max_depth || self.is_excluded_dir(&path, &name) {
                    continue;
                }
                self.collect_files(&path, depth + 1, files)?;
            } else if path.is_file() {
                files.push(path);
            }
        }
        Ok(())
    }

    fn is_excluded_dir(&self, path: &Path, name: &str) -> bool {
        let lower = name.to_lowercase();
        RESERVED_DIRS.contains(&lower.as_str())
            || self.excluded_dirs.iter().any(|excluded| {
                excluded == path
                    || match (excluded.canonicalize(), path.canonicalize()) {
                        (Ok(a), Ok(b)) => a == b,
                        _ => false,
                    }
            })
    }

    /// Dark token in the file stem or in a containing folder below the root
    fn is_dark_name(&self, root: &Path, path: &Path) -> bool {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let parent = path
            .parent()
            .filter(|p| *p != root)
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_lowercase();
        self.dark_tokens
            .iter()
            .any(|tok| stem.contains(tok.as_str()) || parent.contains(tok.as_str()))
    }

    fn frame_index(&self, path: &Path) -> Option<u64> {
        let stem = path.file_stem()?.to_str()?;
        self.index_pattern
            .captures(stem)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn sort_frames(frames: &mut [FrameRef]) {
    frames.sort_by(|a, b| {
        a.index
            .unwrap_or(u64::MAX)
            .cmp(&b.index.unwrap_or(u64::MAX))
            .then_with(|| a.path.cmp(&b.path))
    });
}

/// The skip record carries the path already; keep only the message part.
pub(crate) fn skip_detail(err: &StackError) -> String {
    match err {
        StackError::Raster { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::write_f32_image;

    fn write_frame(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        write_f32_image(path, &[4, 4], vec![1.0; 16], &[]).unwrap();
    }

    #[test]
    fn test_flat_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for name in ["img-0010.fits", "img-0002.fits", "img-0001-dark.fits", "img-0001.fits"] {
            write_frame(&root.join(name));
        }
        fs::write(root.join("img-0001.tiff"), b"not a fits").unwrap();
        fs::write(root.join("notes.txt"), b"hello").unwrap();

        let result = FrameClassifier::new().classify(root).unwrap();
        let lights: Vec<_> = result
            .lights
            .iter()
            .map(|f| f.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(lights, vec!["img-0001.fits", "img-0002.fits", "img-0010.fits"]);
        assert_eq!(result.darks.len(), 1);
        assert_eq!(result.darks[0].index, Some(1));
        assert_eq!(result.skipped.len(), 2);
        assert!(result
            .skipped
            .iter()
            .all(|s| matches!(s.reason, SkipReason::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_custom_dark_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_frame(&root.join("img-0001-DarkFrame.fits"));
        write_frame(&root.join("img-0002-calib.fits"));
        write_frame(&root.join("img-0003.fits"));

        let result = FrameClassifier::new()
            .with_dark_tokens(&["CALIB"])
            .classify(root)
            .unwrap();
        assert_eq!(result.darks.len(), 1);
        assert_eq!(result.darks[0].index, Some(2));
        assert_eq!(result.lights.len(), 2);
    }

    #[test]
    fn test_organized_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_frame(&root.join("darks").join("0001.fit"));
        write_frame(&root.join("darks").join("0002.fit"));
        write_frame(&root.join("lights").join("light_0001.fit"));
        write_frame(&root.join("stacked").join("master_dark.fit"));

        let result = FrameClassifier::new().classify(root).unwrap();
        assert_eq!(result.darks.len(), 2);
        assert_eq!(result.lights.len(), 1);
    }

    #[test]
    fn test_native_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_frame(&root.join("img-0001-dark.fits"));
        write_frame(&root.join("01-images-initial").join("img-0001.fits"));
        write_frame(&root.join("01-images-initial").join("img-0002.fits"));

        let result = FrameClassifier::new().classify(root).unwrap();
        assert_eq!(result.darks.len(), 1);
        assert_eq!(result.lights.len(), 2);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for i in 0..6 {
            write_frame(&root.join(format!("Light_{:03}.fits", i)));
            write_frame(&root.join(format!("DARK_{:03}.fits", i)));
        }
        let classifier = FrameClassifier::new();
        let first = classifier.classify(root).unwrap();
        let second = classifier.classify(root).unwrap();
        assert_eq!(first.lights, second.lights);
        assert_eq!(first.darks, second.darks);
        assert_eq!(first.darks.len(), 6);
    }

    #[test]
    fn test_corrupt_fits_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_frame(&root.join("img-0001.fits"));
        fs::write(root.join("img-0002.fits"), vec![0u8; 3000]).unwrap();

        let result = FrameClassifier::new().classify(root).unwrap();
        assert_eq!(result.lights.len(), 1);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].stage, Stage::Classification);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let err = FrameClassifier::new()
            .classify(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, StackError::RootInaccessible { .. }));
    }

    #[test]
    fn test_excluded_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_frame(&root.join("img-0001.fits"));
        write_frame(&root.join("out").join("result_10s.fit"));

        let result = FrameClassifier::new()
            .excluding(root.join("out"))
            .classify(root)
            .unwrap();
        assert_eq!(result.lights.len(), 1);
    }
}
