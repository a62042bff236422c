use crate::cli::StackOptions;
use crate::config::{DrizzleKernel, FilterMode, PipelineConfig, SkyQuality, StackingMethod};
use crate::output::ArtifactKind;
use crate::pipeline::{Pipeline, RunStatus};
use crate::store::FitsStore;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve the configuration: JSON file first, then command line flags.
pub fn build_config(options: &StackOptions) -> Result<PipelineConfig> {
    let mut config = match &options.config {
        Some(path) => PipelineConfig::from_json_file(Path::new(path))
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => PipelineConfig::default(),
    };

    if let Some(filter) = &options.filter {
        config.filter = filter.parse::<FilterMode>().map_err(anyhow::Error::msg)?;
    }
    if let Some(sky) = &options.sky {
        config.sky_quality = sky.parse::<SkyQuality>().map_err(anyhow::Error::msg)?;
    }
    if let Some(method) = &options.method {
        config.method = method.parse::<StackingMethod>().map_err(anyhow::Error::msg)?;
    }
    if let Some(kernel) = &options.kernel {
        config.kernel = Some(kernel.parse::<DrizzleKernel>().map_err(anyhow::Error::msg)?);
    }
    if options.scale.is_some() {
        config.scale = options.scale;
    }
    if options.pixfrac.is_some() {
        config.pixfrac = options.pixfrac;
    }
    if let Some(output) = &options.output {
        config.output_dir = Some(PathBuf::from(output));
    }
    if let Some(min_matches) = options.min_matches {
        config.registration.min_matches = min_matches;
    }
    if options.threads.is_some() {
        config.threads = options.threads;
    }
    config.keep_intermediates |= options.keep_intermediates;
    config.export_tiff |= options.tiff;
    if options.no_normalize {
        config.normalize_frames = false;
    }

    Ok(config)
}

pub fn stack(root: &str, options: &StackOptions, report_path: Option<&str>) -> Result<()> {
    let config = build_config(options)?;
    let store = FitsStore::new(config.sensor.clone());
    let pipeline = Pipeline::new(config, &store);

    let report = pipeline
        .run(Path::new(root))
        .with_context(|| format!("Stacking failed for {}", root))?;

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path))?;
    }

    println!("Stacking {}", root);
    println!("{:-<60}", "");
    println!(
        "Lights: {} found, {} stacked | Darks: {} found, {} used",
        report.lights_found, report.frames_stacked, report.darks_found, report.darks_used
    );
    if let Some(reference) = &report.reference {
        println!("Reference: {}", reference.display());
    }
    println!(
        "Drizzle: {} kernel, scale {}, pixfrac {} | Integration: {:.0}s",
        report.drizzle.kernel, report.drizzle.scale, report.drizzle.pixfrac, report.livetime
    );
    println!("Rejected contributions: {}", report.rejected_contributions);

    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  - {}", warning);
        }
    }
    if !report.skipped.is_empty() {
        println!("\nSkipped frames:");
        for skip in &report.skipped {
            println!("  - {} ({}): {}", skip.path.display(), skip.stage, skip.reason);
        }
    }

    println!("\nArtifacts:");
    for artifact in &report.artifacts {
        let label = match artifact.kind {
            ArtifactKind::Composite => "composite",
            ArtifactKind::MasterDark => "master dark",
            ArtifactKind::Intermediate => "intermediate",
            ArtifactKind::Tiff => "tiff",
            ArtifactKind::Report => "report",
        };
        println!("  {:<13} {}", label, artifact.path.display());
    }

    if report.status == RunStatus::Cancelled {
        println!("\nRun was cancelled; no composite was written.");
    }
    Ok(())
}
