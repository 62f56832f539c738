use std::{fs, sync::Arc, time::Duration};

use anyhow::{ensure, Context, Result};
use image::{imageops::FilterType, ImageFormat};
use indicatif::{ProgressBar, ProgressStyle};
use sam_seg_rs::{box_prompt, probe, Config, Environment, MaskSession, SegPoint};
use tracing::{info, warn, Level};

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let config = Config::new();
    init_logging(config.verbose);

    ensure!(
        config.input.is_file(),
        "Input image does not exist: {}",
        config.input.display()
    );
    let format = ImageFormat::from_extension(&config.format).context("Invalid format")?;

    let env = Environment::init(config.model_path.as_deref())?;
    env.set_provider(config.provider);
    if !probe(config.provider) {
        warn!(provider = %config.provider, "provider unavailable, models will load on CPU");
    }

    let model_id = match &config.model {
        Some(id) => id.clone(),
        None => env
            .models_for_task("mask")
            .first()
            .map(|m| m.id.clone())
            .context("No mask model found in the model catalog")?,
    };
    let info = env
        .model_info_by_id(&model_id)
        .with_context(|| format!("Unknown model id: {model_id}"))?;
    info!(id = %info.id, name = %info.name, dir = %info.dir.display(), "using model");

    let image = image::open(&config.input)
        .with_context(|| format!("Failed to open image: {}", config.input.display()))?
        .into_rgb8();
    let (orig_w, orig_h) = image.dimensions();

    let mut session = MaskSession::new(Arc::clone(&env), model_id);
    session.set_image(image)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")?);
    spinner.set_message("Encoding image");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let ready = session.wait_ready(config.encode_timeout());
    spinner.finish_and_clear();
    ready.context("Image encoding failed")?;

    let (enc_w, enc_h) = session
        .image()
        .map(|i| i.dimensions())
        .context("Encoded image missing")?;
    let sx = enc_w as f32 / orig_w as f32;
    let sy = enc_h as f32 / orig_h as f32;

    let mut points: Vec<SegPoint> = config
        .points
        .iter()
        .map(|p| SegPoint::new(p.x * sx, p.y * sy, p.label))
        .collect();
    if let Some([x0, y0, x1, y1]) = config.bbox {
        ensure!(
            session.supports_box(),
            "This model does not accept box prompts"
        );
        points.extend(box_prompt(x0 * sx, y0 * sy, x1 * sx, y1 * sy));
    }
    if points.is_empty() {
        points.push(SegPoint::foreground(enc_w as f32 / 2.0, enc_h as f32 / 2.0));
    }

    let settings = config.mask_settings();
    let mask = session.decode(&points, &settings)?;

    let mut output = mask.to_luma8();
    if (enc_w, enc_h) != (orig_w, orig_h) {
        output = image::imageops::resize(&output, orig_w, orig_h, FilterType::Triangle);
    }

    let output_path = config.output_path();
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    output
        .save_with_format(&output_path, format)
        .with_context(|| format!("Failed to save mask: {}", output_path.display()))?;

    let provider = session
        .context()
        .map(|ctx| ctx.encoder().provider())
        .unwrap_or_else(|| env.provider());
    info!(
        provider = %provider,
        output = %output_path.display(),
        prompts = points.len(),
        "mask written"
    );
    Ok(())
}
