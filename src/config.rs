use clap::{ArgAction, Parser};
use image::ImageFormat;
use std::path::PathBuf;

use crate::provider::Provider;
use crate::segmentation::{PointLabel, SegPoint, MAX_REFINE_PASSES};

pub const THRESHOLD_RANGE: (f32, f32) = (0.3, 0.9);
pub const EDGE_REFINE_RANGE: (f32, f32) = (0.0, 0.5);
pub const MAX_MORPH_RADIUS: usize = 5;

/// Tunables for decoding and post-processing. Every value is clamped into its
/// legal range on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskSettings {
    threshold: f32,
    refine_passes: usize,
    morph_radius: usize,
    edge_refine: f32,
}

impl Default for MaskSettings {
    fn default() -> Self {
        Self::new(0.5, 2, 2, 0.0)
    }
}

impl MaskSettings {
    pub fn new(threshold: f32, refine_passes: usize, morph_radius: usize, edge_refine: f32) -> Self {
        Self {
            threshold: threshold.clamp(THRESHOLD_RANGE.0, THRESHOLD_RANGE.1),
            refine_passes: refine_passes.clamp(1, MAX_REFINE_PASSES),
            morph_radius: morph_radius.min(MAX_MORPH_RADIUS),
            edge_refine: edge_refine.clamp(EDGE_REFINE_RANGE.0, EDGE_REFINE_RANGE.1),
        }
    }

    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    pub const fn refine_passes(&self) -> usize {
        self.refine_passes
    }

    pub const fn morph_radius(&self) -> usize {
        self.morph_radius
    }

    pub const fn edge_refine(&self) -> f32 {
        self.edge_refine
    }
}

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Prompted mask extraction with SAM-style ONNX models", long_about = None)]
pub struct Config {
    /// Image to segment
    pub input: PathBuf,

    /// Where the 8-bit mask is written; defaults to `<input>_mask.<format>`
    pub output: Option<PathBuf>,

    /// Model id from the catalog; the first `mask` model when omitted
    #[arg(short, long)]
    pub model: Option<String>,

    /// `;`-separated directories holding model subdirectories
    #[arg(long, env = "SAM_SEG_MODEL_PATH")]
    pub model_path: Option<String>,

    /// Execution provider (auto, CPU, CUDA, CoreML, DirectML, MIGraphX, OpenVINO)
    #[arg(short, long, default_value = "auto", value_parser = parse_provider)]
    pub provider: Provider,

    /// Prompt point `x,y[,label]`; label 1 = foreground (default), 0 = background
    #[arg(long = "point", value_parser = parse_point)]
    pub points: Vec<SegPoint>,

    /// Box prompt `x0,y0,x1,y1`
    #[arg(long = "box", value_parser = parse_box)]
    pub bbox: Option<[f32; 4]>,

    #[arg(short, long, default_value_t = 0.5)]
    pub threshold: f32,

    #[arg(long, default_value_t = 2)]
    pub passes: usize,

    #[arg(long, default_value_t = 2)]
    pub morph: usize,

    #[arg(long, default_value_t = 0.0)]
    pub edge: f32,

    /// Seconds to wait for the image encoder
    #[arg(long, default_value_t = 300)]
    pub timeout_secs: u64,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn mask_settings(&self) -> MaskSettings {
        MaskSettings::new(self.threshold, self.passes, self.morph, self.edge)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let stem = self
                .input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            self.input
                .with_file_name(format!("{stem}_mask"))
                .with_extension(&self.format)
        })
    }

    pub const fn encode_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_provider(s: &str) -> Result<Provider, String> {
    Ok(Provider::from_config(s))
}

fn parse_floats(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .map_err(|e| format!("`{v}` is not a number: {e}"))
        })
        .collect()
}

fn parse_point(s: &str) -> Result<SegPoint, String> {
    match parse_floats(s)?.as_slice() {
        [x, y] => Ok(SegPoint::foreground(*x, *y)),
        [x, y, l] => {
            let label = PointLabel::try_from(*l as i32).map_err(|e| e.to_string())?;
            Ok(SegPoint::new(*x, *y, label))
        }
        _ => Err(format!("expected `x,y[,label]`, got `{s}`")),
    }
}

fn parse_box(s: &str) -> Result<[f32; 4], String> {
    parse_floats(s)?
        .try_into()
        .map_err(|_| format!("expected `x0,y0,x1,y1`, got `{s}`"))
}

fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
