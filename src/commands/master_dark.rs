use crate::classify::FrameClassifier;
use crate::config::{DefectParams, SkyQuality};
use crate::frame::FrameKind;
use crate::master::{CalibrationMaster, DefectKind};
use crate::output::OutputComposer;
use crate::store::{FitsStore, RasterStore};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub fn master_dark(root: &str, output: Option<&str>, sky: &str, verbose: bool) -> Result<()> {
    let root_path = Path::new(root);
    let sky = sky.parse::<SkyQuality>().map_err(anyhow::Error::msg)?;
    let output_dir = output
        .map(PathBuf::from)
        .unwrap_or_else(|| root_path.join("stacked"));

    let classification = FrameClassifier::new()
        .excluding(output_dir.clone())
        .classify(root_path)
        .with_context(|| format!("Failed to classify {}", root))?;
    if classification.darks.is_empty() {
        println!("No dark frames found under {}", root);
        return Ok(());
    }

    let store = FitsStore::default();
    let mut darks = Vec::with_capacity(classification.darks.len());
    for dark in &classification.darks {
        match store.load(&dark.path, FrameKind::Dark) {
            Ok(frame) => darks.push(frame),
            Err(e) => eprintln!("Skipping {}: {}", dark.path.display(), e),
        }
    }

    let master = CalibrationMaster::from_darks(&darks, sky.sigma(), &DefectParams::default())
        .context("Failed to combine dark frames")?;

    let composer = OutputComposer::new(&store, output_dir, false);
    composer.prepare()?;
    let artifact = composer.write_master(&master)?;

    println!("Master dark from {} frame(s)", master.frame_count);
    println!("  Geometry: {}x{} {}", master.geometry.width, master.geometry.height, master.geometry.cfa);
    println!(
        "  Defects: {} hot, {} cold",
        master.defects.hot_count(),
        master.defects.cold_count()
    );
    println!("  Written to: {}", artifact.path.display());

    if verbose && !master.defects.is_empty() {
        println!("\n{:<8} {:<8} {}", "X", "Y", "Kind");
        for (x, y) in master.defects.coordinates() {
            let kind = match master.defects.kind_at(x, y) {
                Some(DefectKind::Hot) => "hot",
                Some(DefectKind::Cold) => "cold",
                None => "-",
            };
            println!("{:<8} {:<8} {}", x, y, kind);
        }
    }

    Ok(())
}
