//! Encoder/decoder orchestration for promptable segmentation models.
//!
//! Two model families are recognised from the decoder's output count:
//! SAM-style multi-mask decoders (masks, IoU scores, low-res masks) and
//! single-mask decoders that refine from a full-resolution previous mask.

use std::time::Instant;

use image::{GrayImage, Luma, RgbImage};
use ndarray::Array4;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{Context, DimOverride, OptLevel},
    errors::{Result, SegError},
    provider::Provider,
    tensor::{element_count, TensorMut, TensorView},
    traits::{InferenceSession, ModelLoader},
};

/// Side length of the square encoder input.
pub const ENCODER_INPUT_SIZE: usize = 1024;
pub const MAX_ENCODER_OUTPUTS: usize = 4;
pub const MAX_NUM_MASKS: usize = 8;
pub const MAX_REFINE_PASSES: usize = 5;

pub const ENCODER_FILE: &str = "encoder.onnx";
pub const DECODER_FILE: &str = "decoder.onnx";

const IMAGE_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const IMAGE_STD: [f32; 3] = [58.395, 57.12, 57.375];
const DEFAULT_LOW_RES_DIM: usize = 256;
/// Label of the padding point multi-mask exports expect after the prompts.
const PADDING_LABEL: f32 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Several candidate masks with IoU scores, refined from a low-res mask.
    MultiMask,
    /// One mask per call, refined from the full-resolution previous mask.
    SingleMask,
}

impl ModelFamily {
    pub fn from_decoder_outputs(outputs: usize) -> Result<Self> {
        match outputs {
            1 => Ok(Self::SingleMask),
            n if n >= 3 => Ok(Self::MultiMask),
            n => Err(SegError::ModelFamily { outputs: n }),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::MultiMask => "multi-mask",
            Self::SingleMask => "single-mask",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PointLabel {
    Background = 0,
    Foreground = 1,
    BoxTopLeft = 2,
    BoxBottomRight = 3,
}

impl PointLabel {
    pub fn value(self) -> f32 {
        self as i32 as f32
    }
}

impl TryFrom<i32> for PointLabel {
    type Error = SegError;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Self::Background),
            1 => Ok(Self::Foreground),
            2 => Ok(Self::BoxTopLeft),
            3 => Ok(Self::BoxBottomRight),
            _ => Err(SegError::Validation {
                field: "point label".to_string(),
                reason: format!("{v} is not one of 0..=3"),
            }),
        }
    }
}

/// Prompt in original-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegPoint {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

impl SegPoint {
    pub const fn new(x: f32, y: f32, label: PointLabel) -> Self {
        Self { x, y, label }
    }

    pub const fn foreground(x: f32, y: f32) -> Self {
        Self::new(x, y, PointLabel::Foreground)
    }

    pub const fn background(x: f32, y: f32) -> Self {
        Self::new(x, y, PointLabel::Background)
    }
}

/// Row-major probability mask at encoded-image resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub data: Vec<f32>,
    pub width: usize,
    pub height: usize,
}

impl Mask {
    pub fn to_luma8(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let v = self.data[y as usize * self.width + x as usize];
            Luma([(v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8])
        })
    }
}

/// Load-time knobs.
#[derive(Debug, Clone)]
pub struct SegmentationOptions {
    /// Applied when the decoder's mask dimensions are symbolic.
    pub decoder_overrides: Vec<DimOverride>,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            decoder_overrides: vec![DimOverride::new("num_labels", 1)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Encoding {
    width: usize,
    height: usize,
    scale: f32,
}

#[derive(Debug, Clone, Copy)]
struct DecodeLayout {
    multi: bool,
    num_masks: usize,
    mask_h: usize,
    mask_w: usize,
    prev_mask_dim: usize,
}

struct DecodeOutput {
    masks: Vec<f32>,
    mask_shape: Vec<i64>,
    iou: Vec<f32>,
    low_res: Vec<f32>,
}

/// Encoder and decoder sessions plus per-image state.
pub struct SegmentationContext<S = Context> {
    encoder: S,
    decoder: S,
    family: ModelFamily,
    normalize: bool,
    enc_shapes: Vec<Vec<i64>>,
    /// Decoder input `i` consumes encoder output `reorder[i]`.
    reorder: Vec<usize>,
    num_masks: usize,
    dec_mask_h: usize,
    dec_mask_w: usize,
    enc_data: Vec<Vec<f32>>,
    prev_mask: Vec<f32>,
    prev_mask_dim: usize,
    has_prev_mask: bool,
    /// Set once a prompt list has been decoded since the last reset.
    prompting: bool,
    encoding: Option<Encoding>,
}

impl<S> std::fmt::Debug for SegmentationContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationContext")
            .field("family", &self.family)
            .field("reorder", &self.reorder)
            .field("num_masks", &self.num_masks)
            .field("mask_dims", &(self.dec_mask_h, self.dec_mask_w))
            .field("prev_mask_dim", &self.prev_mask_dim)
            .field("encoded", &self.encoding.is_some())
            .finish()
    }
}

/// Match encoder outputs to decoder inputs by name.
///
/// Exact matches win, otherwise the first unused encoder output whose name
/// contains (or is contained in) the decoder input name. Each encoder output is
/// used at most once; unmatched inputs keep the identity mapping.
pub fn build_reorder_map(encoder_outputs: &[&str], decoder_inputs: &[Option<&str>]) -> Vec<usize> {
    let n = encoder_outputs.len();
    let mut order: Vec<usize> = (0..n).collect();
    let mut used = vec![false; n];

    for (di, dec_name) in decoder_inputs.iter().take(n).enumerate() {
        let Some(dec_name) = dec_name else { continue };
        let mut best = None;
        for (ei, enc_name) in encoder_outputs.iter().enumerate() {
            if used[ei] {
                continue;
            }
            if enc_name == dec_name {
                best = Some(ei);
                break;
            }
            if best.is_none() && (enc_name.contains(dec_name) || dec_name.contains(enc_name)) {
                best = Some(ei);
            }
        }
        if let Some(ei) = best {
            order[di] = ei;
            used[ei] = true;
        }
    }
    order
}

/// Positive size of `axis` when `shape` has at least `rank` dimensions.
fn dim(shape: Option<&[i64]>, rank: usize, axis: usize) -> Option<usize> {
    shape
        .filter(|s| s.len() >= rank)
        .and_then(|s| s.get(axis))
        .copied()
        .filter(|&d| d > 0)
        .map(|d| d as usize)
}

/// Resize so the longest side is [`ENCODER_INPUT_SIZE`], zero-pad, and lay out as
/// planar `[1, 3, S, S]`.
///
/// Returns the tensor and the applied scale.
pub fn preprocess(rgb: &[u8], width: usize, height: usize, normalize: bool) -> (Array4<f32>, f32) {
    let target = ENCODER_INPUT_SIZE;
    let scale = target as f32 / width.max(height) as f32;
    let new_w = ((width as f32 * scale + 0.5) as usize).min(target);
    let new_h = ((height as f32 * scale + 0.5) as usize).min(target);

    let mut planes = vec![0.0f32; 3 * target * target];
    planes
        .chunks_mut(target * target)
        .enumerate()
        .for_each(|(c, plane)| {
            plane
                .par_chunks_mut(target)
                .take(new_h)
                .enumerate()
                .for_each(|(y, row)| {
                    let src_y = y as f32 / scale;
                    let y0 = (src_y as usize).min(height - 1);
                    let y1 = if y0 + 1 < height { y0 + 1 } else { y0 };
                    let fy = src_y - y0 as f32;

                    for (x, out) in row.iter_mut().take(new_w).enumerate() {
                        let src_x = x as f32 / scale;
                        let x0 = (src_x as usize).min(width - 1);
                        let x1 = if x0 + 1 < width { x0 + 1 } else { x0 };
                        let fx = src_x - x0 as f32;

                        let px = |xx: usize, yy: usize| rgb[(yy * width + xx) * 3 + c] as f32;
                        let val = px(x0, y0) * (1.0 - fx) * (1.0 - fy)
                            + px(x1, y0) * fx * (1.0 - fy)
                            + px(x0, y1) * (1.0 - fx) * fy
                            + px(x1, y1) * fx * fy;

                        *out = if normalize {
                            (val - IMAGE_MEAN[c]) / IMAGE_STD[c]
                        } else {
                            val / 255.0
                        };
                    }
                });
        });

    // the buffer length always matches the shape
    let tensor = Array4::from_shape_vec((1, 3, target, target), planes)
        .unwrap_or_else(|_| Array4::zeros((1, 3, target, target)));
    (tensor, scale)
}

/// Crop the non-padded region of a decoder mask and bilinearly resize it to
/// `dst_w x dst_h`, optionally squashing logits through a sigmoid.
///
/// `scale` maps destination pixels into source pixels.
pub fn crop_resize_mask(
    src: &[f32],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
    scale: f32,
    apply_sigmoid: bool,
) -> Vec<f32> {
    let mut dst = vec![0.0f32; dst_w * dst_h];
    if src_w == 0 || src_h == 0 || dst_w == 0 {
        return dst;
    }
    let valid_w = ((dst_w as f32 * scale + 0.5) as usize).clamp(1, src_w);
    let valid_h = ((dst_h as f32 * scale + 0.5) as usize).clamp(1, src_h);

    dst.par_chunks_mut(dst_w).enumerate().for_each(|(y, row)| {
        let sy = if dst_h > 1 {
            y as f32 * (valid_h - 1) as f32 / (dst_h - 1) as f32
        } else {
            0.0
        };
        let y0 = (sy as usize).min(valid_h - 1);
        let y1 = (y0 + 1).min(valid_h - 1);
        let fy = sy - y0 as f32;

        for (x, out) in row.iter_mut().enumerate() {
            let sx = if dst_w > 1 {
                x as f32 * (valid_w - 1) as f32 / (dst_w - 1) as f32
            } else {
                0.0
            };
            let x0 = (sx as usize).min(valid_w - 1);
            let x1 = (x0 + 1).min(valid_w - 1);
            let fx = sx - x0 as f32;

            let v = src[y0 * src_w + x0] * (1.0 - fx) * (1.0 - fy)
                + src[y0 * src_w + x1] * fx * (1.0 - fy)
                + src[y1 * src_w + x0] * (1.0 - fx) * fy
                + src[y1 * src_w + x1] * fx * fy;

            *out = if apply_sigmoid {
                1.0 / (1.0 + (-v).exp())
            } else {
                v
            };
        }
    });
    dst
}

/// Index of the highest score; ties keep the first.
fn best_mask(scores: &[f32]) -> usize {
    let mut best = 0;
    for (m, s) in scores.iter().enumerate().skip(1) {
        if *s > scores[best] {
            best = m;
        }
    }
    best
}

fn embedding_views<'a>(
    data: &'a [Vec<f32>],
    shapes: &[Vec<i64>],
    reorder: &[usize],
) -> Vec<TensorView<'a>> {
    reorder
        .iter()
        .map(|&ei| TensorView::f32(&data[ei], shapes[ei].clone()))
        .collect()
}

/// One decoder invocation. Inputs are the reordered embeddings followed by
/// coordinates, labels, previous mask and, for multi-mask decoders, the
/// has-mask flag.
fn decode_once<'a, S: InferenceSession>(
    decoder: &mut S,
    mut inputs: Vec<TensorView<'a>>,
    coords: &'a [f32],
    labels: &'a [f32],
    prev_mask: &'a [f32],
    has_mask: &'a [f32; 1],
    layout: DecodeLayout,
) -> Result<DecodeOutput> {
    let total = labels.len() as i64;
    let pm = layout.prev_mask_dim as i64;

    inputs.push(TensorView::f32(coords, [1, total, 2]));
    inputs.push(TensorView::f32(labels, [1, total]));
    inputs.push(TensorView::f32(prev_mask, [1, 1, pm, pm]));
    if layout.multi {
        inputs.push(TensorView::f32(has_mask, [1]));
    }

    let nm = layout.num_masks;
    let (h, w) = (layout.mask_h, layout.mask_w);
    let mut masks = vec![0.0f32; nm * h * w];
    let mut iou = vec![0.0f32; nm];
    let mut low_res = if layout.multi {
        vec![0.0f32; nm * layout.prev_mask_dim * layout.prev_mask_dim]
    } else {
        Vec::new()
    };

    let mask_shape = {
        let mut outputs = vec![TensorMut::f32(
            &mut masks,
            [1, nm as i64, h as i64, w as i64],
        )];
        if layout.multi {
            outputs.push(TensorMut::f32(&mut iou, [1, nm as i64]));
            outputs.push(TensorMut::f32(&mut low_res, [1, nm as i64, pm, pm]));
        }
        decoder.run(&inputs, &mut outputs)?;
        outputs.swap_remove(0).shape
    };

    Ok(DecodeOutput {
        masks,
        mask_shape,
        iou,
        low_res,
    })
}

impl<S: InferenceSession> SegmentationContext<S> {
    pub fn load<L>(loader: &L, model_id: &str) -> Result<Self>
    where
        L: ModelLoader<Session = S>,
    {
        Self::load_with(loader, model_id, &SegmentationOptions::default())
    }

    /// Load `encoder.onnx` with the loader's provider and `decoder.onnx` on CPU
    /// without graph optimization, then derive the decoder geometry.
    pub fn load_with<L>(loader: &L, model_id: &str, options: &SegmentationOptions) -> Result<Self>
    where
        L: ModelLoader<Session = S>,
    {
        let encoder = loader
            .load_session(model_id, ENCODER_FILE, Provider::Auto, OptLevel::All, &[])
            .inspect_err(|e| error!(model_id, error = %e, "failed to load encoder"))?;
        let mut decoder = loader
            .load_session(model_id, DECODER_FILE, Provider::Cpu, OptLevel::Disabled, &[])
            .inspect_err(|e| error!(model_id, error = %e, "failed to load decoder"))?;

        let n_enc = encoder.output_count();
        if n_enc == 0 || n_enc > MAX_ENCODER_OUTPUTS {
            return Err(SegError::Validation {
                field: "encoder outputs".to_string(),
                reason: format!("unsupported count {n_enc}"),
            });
        }
        let enc_shapes = (0..n_enc)
            .map(|i| {
                encoder
                    .output_shape(i)
                    .filter(|s| !s.is_empty())
                    .map(<[i64]>::to_vec)
                    .ok_or_else(|| SegError::Validation {
                        field: format!("encoder output {i}"),
                        reason: "shape unavailable".to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let reorder = {
            let enc_names: Vec<&str> = (0..n_enc)
                .map(|i| encoder.output_name(i).unwrap_or(""))
                .collect();
            let dec_names: Vec<Option<&str>> = (0..n_enc).map(|i| decoder.input_name(i)).collect();
            build_reorder_map(&enc_names, &dec_names)
        };
        debug!(?reorder, n_enc, "encoder-decoder reorder map");

        let family = ModelFamily::from_decoder_outputs(decoder.output_count())
            .inspect_err(|e| error!(model_id, error = %e, "unsupported decoder"))?;

        let (num_masks, dec_mask_h, dec_mask_w, prev_mask_dim) = match family {
            ModelFamily::MultiMask => {
                let out0 = decoder.output_shape(0);
                let mut num_masks = dim(out0, 4, 1)
                    .filter(|&n| n > 1)
                    .or_else(|| dim(decoder.output_shape(1), 2, 1))
                    .unwrap_or(1);
                if num_masks > MAX_NUM_MASKS {
                    debug!(num_masks, "clamping mask count to {MAX_NUM_MASKS}");
                    num_masks = MAX_NUM_MASKS;
                }
                let mut mask_hw = dim(out0, 4, 2).zip(dim(out0, 4, 3));

                if mask_hw.is_none() && !options.decoder_overrides.is_empty() {
                    info!(
                        overrides = ?options.decoder_overrides,
                        "decoder has symbolic mask dims, reloading with overrides"
                    );
                    drop(decoder);
                    decoder = loader
                        .load_session(
                            model_id,
                            DECODER_FILE,
                            Provider::Cpu,
                            OptLevel::Basic,
                            &options.decoder_overrides,
                        )
                        .inspect_err(|e| error!(model_id, error = %e, "decoder reload failed"))?;

                    let out0 = decoder.output_shape(0);
                    mask_hw = dim(out0, 4, 2).zip(dim(out0, 4, 3));
                    if let Some(n) = dim(out0, 4, 1).filter(|&n| n > 1) {
                        num_masks = n.min(MAX_NUM_MASKS);
                    }
                    if num_masks <= 1 {
                        if let Some(n) = dim(decoder.output_shape(1), 2, 1) {
                            num_masks = n.min(MAX_NUM_MASKS);
                        }
                    }
                    debug!(?mask_hw, num_masks, "decoder geometry after reload");
                }

                let (h, w) = mask_hw.unwrap_or_else(|| {
                    warn!(
                        overrides = ?options.decoder_overrides,
                        "decoder mask dims unresolved, assuming {ENCODER_INPUT_SIZE}x{ENCODER_INPUT_SIZE} and reading real dims at run time"
                    );
                    (ENCODER_INPUT_SIZE, ENCODER_INPUT_SIZE)
                });

                let out2 = decoder.output_shape(2);
                let prev_dim = dim(out2, 4, 2)
                    .filter(|_| dim(out2, 4, 3).is_some())
                    .unwrap_or(DEFAULT_LOW_RES_DIM);
                (num_masks, h, w, prev_dim)
            }
            ModelFamily::SingleMask => {
                let out0 = decoder.output_shape(0);
                let h = dim(out0, 4, 2).unwrap_or(ENCODER_INPUT_SIZE);
                let w = dim(out0, 4, 3).unwrap_or(ENCODER_INPUT_SIZE);
                (1, h, w, h)
            }
        };

        info!(
            model_id,
            family = family.name(),
            encoder_outputs = n_enc,
            num_masks,
            mask_dims = ?(dec_mask_h, dec_mask_w),
            prev_mask_dim,
            "segmentation model loaded"
        );

        Ok(Self {
            encoder,
            decoder,
            family,
            normalize: family == ModelFamily::MultiMask,
            enc_shapes,
            reorder,
            num_masks,
            dec_mask_h,
            dec_mask_w,
            enc_data: Vec::new(),
            prev_mask: vec![0.0; prev_mask_dim * prev_mask_dim],
            prev_mask_dim,
            has_prev_mask: false,
            prompting: false,
            encoding: None,
        })
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn encoder(&self) -> &S {
        &self.encoder
    }

    /// Box prompts are only understood by multi-mask decoders.
    pub fn supports_box(&self) -> bool {
        self.family == ModelFamily::MultiMask
    }

    pub fn is_encoded(&self) -> bool {
        self.encoding.is_some()
    }

    /// Width and height of the encoded image.
    pub fn encoded_size(&self) -> Option<(usize, usize)> {
        self.encoding.map(|e| (e.width, e.height))
    }

    pub fn reorder_map(&self) -> &[usize] {
        &self.reorder
    }

    pub fn num_masks(&self) -> usize {
        self.num_masks
    }

    pub fn decoder_mask_dims(&self) -> (usize, usize) {
        (self.dec_mask_h, self.dec_mask_w)
    }

    pub fn prev_mask_dim(&self) -> usize {
        self.prev_mask_dim
    }

    pub fn has_prev_mask(&self) -> bool {
        self.has_prev_mask
    }

    fn layout(&self) -> DecodeLayout {
        DecodeLayout {
            multi: self.family == ModelFamily::MultiMask,
            num_masks: self.num_masks,
            mask_h: self.dec_mask_h,
            mask_w: self.dec_mask_w,
            prev_mask_dim: self.prev_mask_dim,
        }
    }

    pub fn encode(&mut self, image: &RgbImage) -> Result<()> {
        self.encode_image(
            image.as_raw(),
            image.width() as usize,
            image.height() as usize,
        )
    }

    /// Run the encoder on interleaved RGB8 pixels and cache its outputs.
    ///
    /// A no-op when an image is already encoded; call [`Self::reset_encoding`]
    /// before encoding a different one.
    pub fn encode_image(&mut self, rgb: &[u8], width: usize, height: usize) -> Result<()> {
        if width == 0 || height == 0 || rgb.len() < width * height * 3 {
            return Err(SegError::Validation {
                field: "image".to_string(),
                reason: format!("{width}x{height} RGB needs {} bytes, got {}", width * height * 3, rgb.len()),
            });
        }
        if self.encoding.is_some() {
            debug!("image already encoded");
            return Ok(());
        }

        let (tensor, scale) = preprocess(rgb, width, height, self.normalize);
        let input = tensor.as_slice().ok_or_else(|| SegError::Validation {
            field: "encoder input".to_string(),
            reason: "tensor not contiguous".to_string(),
        })?;

        let mut bufs = self
            .enc_shapes
            .iter()
            .enumerate()
            .map(|(i, s)| {
                element_count(s).map(|n| vec![0.0f32; n]).ok_or_else(|| {
                    debug!(index = i, shape = ?s, "encoder output has non-positive dimension");
                    SegError::Validation {
                        field: format!("encoder output {i}"),
                        reason: format!("non-positive dimension in {s:?}"),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(width, height, scale, "encoding image");
        let start = Instant::now();
        {
            let size = ENCODER_INPUT_SIZE as i64;
            let inputs = [TensorView::f32(input, [1, 3, size, size])];
            let mut outputs: Vec<TensorMut<'_>> = bufs
                .iter_mut()
                .zip(&self.enc_shapes)
                .map(|(b, s)| TensorMut::f32(b, s.clone()))
                .collect();
            self.encoder.run(&inputs, &mut outputs).map_err(|e| {
                error!(error = %e, elapsed = ?start.elapsed(), "encoder failed");
                e
            })?;
        }

        self.enc_data = bufs;
        self.encoding = Some(Encoding {
            width,
            height,
            scale,
        });
        self.clear_prev_mask();
        self.prompting = false;
        info!(elapsed = ?start.elapsed(), "image encoded");
        Ok(())
    }

    /// Decode one mask for `points`.
    ///
    /// Updates the previous-mask feedback buffer with the chosen mask.
    pub fn compute_mask(&mut self, points: &[SegPoint]) -> Result<Mask> {
        let enc = self.encoding.ok_or_else(|| SegError::Validation {
            field: "image".to_string(),
            reason: "not encoded".to_string(),
        })?;
        if points.is_empty() {
            return Err(SegError::Validation {
                field: "points".to_string(),
                reason: "at least one prompt required".to_string(),
            });
        }

        let layout = self.layout();
        let total = points.len() + usize::from(layout.multi);
        let mut coords = Vec::with_capacity(total * 2);
        let mut labels = Vec::with_capacity(total);
        for p in points {
            coords.push(p.x * enc.scale);
            coords.push(p.y * enc.scale);
            labels.push(p.label.value());
        }
        if layout.multi {
            coords.extend([0.0, 0.0]);
            labels.push(PADDING_LABEL);
        }

        if self.has_prev_mask {
            let (lo, hi) = self
                .prev_mask
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            debug!(n_points = points.len(), lo, hi, "decoding with previous mask");
        } else {
            debug!(n_points = points.len(), "decoding without previous mask");
        }

        let has_mask = [if self.has_prev_mask { 1.0 } else { 0.0 }];
        let start = Instant::now();
        let embeddings = embedding_views(&self.enc_data, &self.enc_shapes, &self.reorder);
        let out = decode_once(
            &mut self.decoder,
            embeddings,
            &coords,
            &labels,
            &self.prev_mask,
            &has_mask,
            layout,
        )
        .inspect_err(|e| error!(error = %e, elapsed = ?start.elapsed(), "decoder failed"))?;

        let (mut dec_h, mut dec_w) = (layout.mask_h, layout.mask_w);
        if let Some((h, w)) = dim(Some(&out.mask_shape), 4, 2).zip(dim(Some(&out.mask_shape), 4, 3)) {
            if (h, w) != (dec_h, dec_w) {
                debug!(actual = ?(h, w), allocated = ?(dec_h, dec_w), "decoder produced different mask dims");
                dec_h = h;
                dec_w = w;
            }
        }
        let per_mask = dec_h * dec_w;

        let best = if layout.multi {
            let scores = &out.iou[..layout.num_masks.min(out.iou.len())];
            let best = best_mask(scores);
            debug!(elapsed = ?start.elapsed(), best, num_masks = layout.num_masks, iou = scores.get(best).copied().unwrap_or_default(), "mask computed");
            best
        } else {
            debug!(elapsed = ?start.elapsed(), "mask computed");
            0
        };

        let chosen = out
            .masks
            .get(best * per_mask..(best + 1) * per_mask)
            .ok_or_else(|| SegError::Validation {
                field: "decoder output".to_string(),
                reason: format!("mask {best} of {dec_w}x{dec_h} exceeds buffer"),
            })?;

        if layout.multi {
            let lr = self.prev_mask_dim * self.prev_mask_dim;
            if let Some(src) = out.low_res.get(best * lr..(best + 1) * lr) {
                self.prev_mask.copy_from_slice(src);
            }
        } else {
            let n = per_mask.min(self.prev_mask.len());
            self.prev_mask[..n].copy_from_slice(&chosen[..n]);
        }
        self.has_prev_mask = true;

        let mask_scale = enc.scale * dec_h as f32 / ENCODER_INPUT_SIZE as f32;
        let data = crop_resize_mask(
            chosen,
            dec_w,
            dec_h,
            enc.width,
            enc.height,
            mask_scale,
            layout.multi,
        );
        debug!(from = ?(dec_w, dec_h), to = ?(enc.width, enc.height), mask_scale, "mask resized");

        Ok(Mask {
            data,
            width: enc.width,
            height: enc.height,
        })
    }

    /// Run the decoder `passes` times (clamped to 1..=5), feeding each pass's mask
    /// back as the next pass's previous mask. Only the last result is kept.
    ///
    /// A failing later pass falls back to the last good mask.
    pub fn compute_mask_refined(&mut self, points: &[SegPoint], passes: usize) -> Result<Mask> {
        let passes = passes.clamp(1, MAX_REFINE_PASSES);
        let mut last = None;
        for pass in 0..passes {
            match self.compute_mask(points) {
                Ok(mask) => last = Some(mask),
                Err(e) => match last {
                    Some(_) => {
                        warn!(pass, error = %e, "refinement pass failed, keeping previous result");
                        break;
                    }
                    None => return Err(e),
                },
            }
        }
        last.ok_or_else(|| SegError::Validation {
            field: "refine passes".to_string(),
            reason: "no pass ran".to_string(),
        })
    }

    /// Decode for an interactive prompt list.
    ///
    /// The first decode after an encode or [`reset_prev_mask`](Self::reset_prev_mask)
    /// starts a fresh mask, whatever the prompt kind. A single-point list also
    /// starts over. Later prompts keep accumulating the previous mask.
    pub fn segment(&mut self, points: &[SegPoint], passes: usize) -> Result<Mask> {
        if !self.prompting || points.len() <= 1 {
            self.clear_prev_mask();
        }
        let mask = self.compute_mask_refined(points, passes)?;
        self.prompting = true;
        Ok(mask)
    }

    /// One throwaway decode so the runtime's lazy initialisation happens now.
    ///
    /// Uses the cached embeddings when an image is encoded, zeros otherwise. No
    /// state is modified.
    pub fn warmup(&mut self) -> Result<()> {
        let layout = self.layout();
        let real = self.encoding.is_some();
        let start = Instant::now();

        let dummy = if real {
            Vec::new()
        } else {
            self.enc_shapes
                .iter()
                .map(|s| {
                    element_count(s)
                        .map(|n| vec![0.0f32; n])
                        .ok_or_else(|| SegError::Validation {
                            field: "encoder output".to_string(),
                            reason: format!("non-positive dimension in {s:?}"),
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };
        let source = if real { &self.enc_data } else { &dummy };
        let embeddings = embedding_views(source, &self.enc_shapes, &self.reorder);

        let (coords, labels): (&[f32], &[f32]) = if layout.multi {
            (&[0.0; 4], &[1.0, PADDING_LABEL])
        } else {
            (&[0.0; 2], &[1.0])
        };

        let result = decode_once(
            &mut self.decoder,
            embeddings,
            coords,
            labels,
            &self.prev_mask,
            &[0.0],
            layout,
        );
        info!(
            elapsed = ?start.elapsed(),
            real_embeddings = real,
            ok = result.is_ok(),
            "decoder warm-up done"
        );
        result.map(|_| ())
    }

    /// Forget the previous mask and start a new prompt session.
    pub fn reset_prev_mask(&mut self) {
        self.clear_prev_mask();
        self.prompting = false;
    }

    fn clear_prev_mask(&mut self) {
        self.has_prev_mask = false;
        self.prev_mask.fill(0.0);
    }

    /// Drop cached embeddings so a new image can be encoded.
    pub fn reset_encoding(&mut self) {
        self.enc_data.clear();
        self.encoding = None;
        self.reset_prev_mask();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_output_count() {
        assert_eq!(
            ModelFamily::from_decoder_outputs(3).ok(),
            Some(ModelFamily::MultiMask)
        );
        assert_eq!(
            ModelFamily::from_decoder_outputs(4).ok(),
            Some(ModelFamily::MultiMask)
        );
        assert_eq!(
            ModelFamily::from_decoder_outputs(1).ok(),
            Some(ModelFamily::SingleMask)
        );
        assert!(matches!(
            ModelFamily::from_decoder_outputs(2),
            Err(SegError::ModelFamily { outputs: 2 })
        ));
        assert!(ModelFamily::from_decoder_outputs(0).is_err());
    }

    #[test]
    fn reorder_exact_then_substring() {
        let enc = ["high_res_feats_0", "high_res_feats_1", "image_embeddings"];
        let dec = [
            Some("image_embed"),
            Some("high_res_feats_0"),
            Some("high_res_feats_1"),
        ];
        assert_eq!(build_reorder_map(&enc, &dec), vec![2, 0, 1]);
    }

    #[test]
    fn reorder_prefers_later_exact_match() {
        let enc = ["embed_extra", "embed"];
        let dec = [Some("embed"), Some("embed_extra")];
        assert_eq!(build_reorder_map(&enc, &dec), vec![1, 0]);
    }

    #[test]
    fn reorder_defaults_to_identity() {
        let enc = ["a", "b"];
        let dec = [Some("x"), None];
        assert_eq!(build_reorder_map(&enc, &dec), vec![0, 1]);
    }

    #[test]
    fn preprocess_scales_longest_side() {
        let (w, h) = (4usize, 2usize);
        let rgb = vec![255u8; w * h * 3];
        let (t, scale) = preprocess(&rgb, w, h, false);
        assert_eq!(t.shape(), &[1, 3, 1024, 1024]);
        assert_eq!(scale, 256.0);
        assert!((t[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 511, 1023]] - 1.0).abs() < 1e-6);
        // padding below the resized rows
        assert_eq!(t[[0, 1, 512, 0]], 0.0);
    }

    #[test]
    fn preprocess_imagenet_normalization() {
        let rgb = vec![0u8; 3];
        let (t, _) = preprocess(&rgb, 1, 1, true);
        for c in 0..3 {
            let expected = -IMAGE_MEAN[c] / IMAGE_STD[c];
            assert!((t[[0, c, 0, 0]] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn crop_resize_identity_and_sigmoid() {
        let src = vec![0.0, 1.0, 2.0, 3.0];
        let out = crop_resize_mask(&src, 2, 2, 2, 2, 1.0, false);
        assert_eq!(out, src);

        let out = crop_resize_mask(&[0.0; 4], 2, 2, 2, 2, 1.0, true);
        assert!(out.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn crop_resize_ignores_padding() {
        // left half valid (1.0), right half padding (9.0)
        let src = vec![1.0, 1.0, 9.0, 9.0, 1.0, 1.0, 9.0, 9.0];
        let out = crop_resize_mask(&src, 4, 2, 4, 2, 0.5, false);
        assert!(out.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn best_mask_first_maximum_wins() {
        assert_eq!(best_mask(&[0.1, 0.9, 0.9, 0.3]), 1);
        assert_eq!(best_mask(&[0.5]), 0);
    }

    #[test]
    fn point_labels() -> Result<()> {
        assert_eq!(PointLabel::try_from(3)?, PointLabel::BoxBottomRight);
        assert!(PointLabel::try_from(7).is_err());
        assert_eq!(PointLabel::BoxTopLeft.value(), 2.0);
        Ok(())
    }

    #[test]
    fn mask_to_luma() {
        let m = Mask {
            data: vec![0.0, 1.0, 0.5, 2.0],
            width: 2,
            height: 2,
        };
        let img = m.to_luma8();
        assert_eq!(img.get_pixel(0, 0).0, [0]);
        assert_eq!(img.get_pixel(1, 0).0, [255]);
        assert_eq!(img.get_pixel(0, 1).0, [128]);
        assert_eq!(img.get_pixel(1, 1).0, [255]);
    }
}
