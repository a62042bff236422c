use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bayer-drizzle")]
#[command(about = "Bayer drizzle stacking for one-shot-color smart telescope frames", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify, calibrate, register and drizzle a folder of frames
    Stack {
        /// Root folder holding lights and darks (flat or sorted into subfolders)
        root: String,

        #[command(flatten)]
        options: StackOptions,

        /// Also write the run report to this path
        #[arg(long)]
        report: Option<String>,
    },

    /// Show how the frames of a folder would be classified
    Classify {
        /// Root folder to scan
        root: String,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Build only the master dark and report its defect pixels
    MasterDark {
        /// Root folder holding the dark frames
        root: String,

        /// Output directory (defaults to <ROOT>/stacked)
        #[arg(short, long)]
        output: Option<String>,

        /// Sky quality preset used for the dark combination clip
        #[arg(long, default_value = "bortle3-4")]
        sky: String,

        /// List every defect pixel
        #[arg(short, long)]
        verbose: bool,
    },

    /// Display FITS headers and geometry of a file or directory
    Inspect {
        /// FITS file or directory
        path: String,

        /// Show every header card
        #[arg(short, long)]
        verbose: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct StackOptions {
    /// JSON file with a full pipeline configuration; flags below override it
    #[arg(long)]
    pub config: Option<String>,

    /// Filter mode (standard, dual-band, ha, oiii)
    #[arg(long)]
    pub filter: Option<String>,

    /// Sky quality preset (bortle1-2, bortle3-4, bortle5-6, bortle7-8)
    #[arg(long)]
    pub sky: Option<String>,

    /// Stacking method (bayer-drizzle, bayer-drizzle-square, bayer-drizzle-nearest, drizzle-2x)
    #[arg(long)]
    pub method: Option<String>,

    /// Drizzle kernel override (gaussian, square, nearest)
    #[arg(long)]
    pub kernel: Option<String>,

    /// Output scale override (1 or 2)
    #[arg(long)]
    pub scale: Option<f64>,

    /// Pixel footprint fraction override, in (0, 1]
    #[arg(long)]
    pub pixfrac: Option<f64>,

    /// Output directory (defaults to <ROOT>/stacked)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Keep per-plane value and weight maps in <OUTPUT>/process
    #[arg(long)]
    pub keep_intermediates: bool,

    /// Skip background/noise normalization of the lights
    #[arg(long)]
    pub no_normalize: bool,

    /// Also export the composite as 16-bit TIFF
    #[arg(long)]
    pub tiff: bool,

    /// Minimum matched stars for a frame to be accepted
    #[arg(long)]
    pub min_matches: Option<usize>,

    /// Worker threads (defaults to one per core)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,
}
