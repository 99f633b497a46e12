//! Per-camera image transform pipeline.
//!
//! Stage order is fixed: crop, resize, colour adjustment, colour filter.
//! Within the colour adjustment the order is brightness, contrast,
//! saturation, gamma, hue. Every stage is best-effort: out-of-bounds crops
//! clamp, degenerate sizes are skipped, and nothing here returns an error.

use image::imageops::{self, FilterType};
use image::RgbImage;
use kinedit_episode_model::transform::{
    ColorAdjustment, ColorFilter, CropRect, ImageTransform, ResizeTarget, TransformSettings,
};

/// Rec. 601 luma weights.
const LUMA: [f64; 3] = [0.299, 0.587, 0.114];

/// Transform that applies to `camera_id`.
///
/// A per-camera entry wins as a whole, even if it is a no-op; otherwise the
/// global transform applies; otherwise source pixels pass through.
pub fn resolve_transform<'a>(
    camera_id: &str,
    settings: &'a TransformSettings,
) -> Option<&'a ImageTransform> {
    settings
        .per_camera
        .get(camera_id)
        .or(settings.global.as_ref())
}

/// Run every stage of `transform` over `image`.
pub fn apply_transform(image: &RgbImage, transform: Option<&ImageTransform>) -> RgbImage {
    let Some(transform) = transform else {
        return image.clone();
    };

    let mut out = match transform.crop {
        Some(rect) => crop(image, rect),
        None => image.clone(),
    };
    if let Some(target) = transform.resize {
        out = resize(out, target);
    }
    if let Some(adjustment) = &transform.color_adjustment {
        adjust_color(&mut out, adjustment);
    }
    if let Some(filter) = transform.color_filter {
        apply_filter(&mut out, filter);
    }
    out
}

/// Crop to `rect`, clamped to the image bounds.
///
/// A rectangle that clamps to nothing leaves the image unchanged.
pub fn crop(image: &RgbImage, rect: CropRect) -> RgbImage {
    let (w, h) = image.dimensions();
    let x = rect.x.min(w);
    let y = rect.y.min(h);
    let width = rect.width.min(w - x);
    let height = rect.height.min(h - y);

    if width == 0 || height == 0 {
        tracing::debug!(?rect, w, h, "Crop outside image bounds, skipping");
        return image.clone();
    }
    if (x, y, width, height) == (0, 0, w, h) {
        return image.clone();
    }
    imageops::crop_imm(image, x, y, width, height).to_image()
}

/// Scale to the target size. Zero dimensions are ignored.
pub fn resize(image: RgbImage, target: ResizeTarget) -> RgbImage {
    if target.width == 0 || target.height == 0 {
        return image;
    }
    if image.dimensions() == (target.width, target.height) {
        return image;
    }
    imageops::resize(&image, target.width, target.height, FilterType::Triangle)
}

/// Apply brightness, contrast, saturation, gamma and hue, in that order.
pub fn adjust_color(image: &mut RgbImage, adjustment: &ColorAdjustment) {
    if adjustment.is_identity() {
        return;
    }
    let hue = hue_matrix(adjustment.hue.clamp(-180.0, 180.0));
    for pixel in image.pixels_mut() {
        let rgb = adjust_pixel(to_unit(pixel.0), adjustment, hue.as_ref());
        pixel.0 = from_unit(rgb);
    }
}

/// Apply a preset filter.
pub fn apply_filter(image: &mut RgbImage, filter: ColorFilter) {
    if filter == ColorFilter::None {
        return;
    }
    for pixel in image.pixels_mut() {
        let rgb = filter_pixel(to_unit(pixel.0), filter);
        pixel.0 = from_unit(rgb);
    }
}

fn adjust_pixel(
    mut rgb: [f64; 3],
    adjustment: &ColorAdjustment,
    hue: Option<&[[f64; 3]; 3]>,
) -> [f64; 3] {
    let brightness = adjustment.brightness.clamp(-1.0, 1.0);
    if brightness != 0.0 {
        rgb = rgb.map(|c| clamp_unit(c + brightness));
    }

    let contrast = adjustment.contrast.clamp(-1.0, 1.0);
    if contrast != 0.0 {
        rgb = rgb.map(|c| clamp_unit((c - 0.5) * (1.0 + contrast) + 0.5));
    }

    let saturation = adjustment.saturation.clamp(-1.0, 1.0);
    if saturation != 0.0 {
        let luma = luma(rgb);
        rgb = rgb.map(|c| clamp_unit(luma + (c - luma) * (1.0 + saturation)));
    }

    let gamma = adjustment.gamma;
    if gamma.is_finite() && gamma > 0.0 && gamma != 1.0 {
        rgb = rgb.map(|c| c.powf(1.0 / gamma));
    }

    if let Some(m) = hue {
        rgb = mul3(m, rgb).map(clamp_unit);
    }

    rgb
}

fn filter_pixel(rgb: [f64; 3], filter: ColorFilter) -> [f64; 3] {
    let [r, g, b] = rgb;
    let out = match filter {
        ColorFilter::None => rgb,
        ColorFilter::Grayscale => {
            let l = luma(rgb);
            [l, l, l]
        }
        ColorFilter::Sepia => [
            0.393 * r + 0.769 * g + 0.189 * b,
            0.349 * r + 0.686 * g + 0.168 * b,
            0.272 * r + 0.534 * g + 0.131 * b,
        ],
        ColorFilter::Invert => [1.0 - r, 1.0 - g, 1.0 - b],
        ColorFilter::Warm => [r * 1.1, g, b * 0.9],
        ColorFilter::Cool => [r * 0.9, g, b * 1.1],
    };
    out.map(clamp_unit)
}

/// Luminance-preserving hue rotation matrix, `None` for a zero angle.
fn hue_matrix(degrees: f64) -> Option<[[f64; 3]; 3]> {
    if degrees == 0.0 {
        return None;
    }
    let (sin, cos) = degrees.to_radians().sin_cos();
    Some([
        [
            0.213 + cos * 0.787 - sin * 0.213,
            0.715 - cos * 0.715 - sin * 0.715,
            0.072 - cos * 0.072 + sin * 0.928,
        ],
        [
            0.213 - cos * 0.213 + sin * 0.143,
            0.715 + cos * 0.285 + sin * 0.140,
            0.072 - cos * 0.072 - sin * 0.283,
        ],
        [
            0.213 - cos * 0.213 - sin * 0.787,
            0.715 - cos * 0.715 + sin * 0.715,
            0.072 + cos * 0.928 + sin * 0.072,
        ],
    ])
}

fn mul3(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    m.map(|row| row[0] * v[0] + row[1] * v[1] + row[2] * v[2])
}

fn luma(rgb: [f64; 3]) -> f64 {
    LUMA[0] * rgb[0] + LUMA[1] * rgb[1] + LUMA[2] * rgb[2]
}

fn clamp_unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn to_unit(px: [u8; 3]) -> [f64; 3] {
    px.map(|c| c as f64 / 255.0)
}

fn from_unit(rgb: [f64; 3]) -> [u8; 3] {
    rgb.map(|c| (clamp_unit(c) * 255.0).round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb(rgb))
    }

    fn quadrants() -> RgbImage {
        // 4x4: left half red, right half blue.
        RgbImage::from_fn(4, 4, |x, _| {
            if x < 2 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        })
    }

    fn with_filter(filter: ColorFilter) -> ImageTransform {
        ImageTransform {
            color_filter: Some(filter),
            ..Default::default()
        }
    }

    #[test]
    fn test_camera_override_replaces_global_wholesale() {
        let mut settings = TransformSettings {
            global: Some(ImageTransform {
                resize: Some(ResizeTarget {
                    width: 8,
                    height: 8,
                }),
                color_filter: Some(ColorFilter::Sepia),
                ..Default::default()
            }),
            ..Default::default()
        };
        settings
            .per_camera
            .insert("top".to_string(), with_filter(ColorFilter::Invert));

        let top = resolve_transform("top", &settings).unwrap();
        assert_eq!(top.resize, None);
        assert_eq!(top.color_filter, Some(ColorFilter::Invert));

        let wrist = resolve_transform("wrist", &settings).unwrap();
        assert_eq!(wrist.color_filter, Some(ColorFilter::Sepia));
    }

    #[test]
    fn test_noop_override_still_wins() {
        let mut settings = TransformSettings {
            global: Some(with_filter(ColorFilter::Grayscale)),
            ..Default::default()
        };
        settings
            .per_camera
            .insert("top".to_string(), ImageTransform::default());

        let resolved = resolve_transform("top", &settings).unwrap();
        assert!(resolved.is_noop());
        let image = solid(2, 2, [200, 10, 10]);
        assert_eq!(apply_transform(&image, Some(resolved)), image);
    }

    #[test]
    fn test_no_settings_passes_through() {
        let settings = TransformSettings::default();
        assert!(resolve_transform("top", &settings).is_none());
        let image = quadrants();
        assert_eq!(apply_transform(&image, None), image);
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let image = quadrants();
        let cropped = crop(
            &image,
            CropRect {
                x: 2,
                y: 1,
                width: 100,
                height: 100,
            },
        );
        assert_eq!(cropped.dimensions(), (2, 3));
        assert!(cropped.pixels().all(|p| p.0 == [0, 0, 255]));
    }

    #[test]
    fn test_crop_fully_outside_is_noop() {
        let image = quadrants();
        let cropped = crop(
            &image,
            CropRect {
                x: 10,
                y: 10,
                width: 4,
                height: 4,
            },
        );
        assert_eq!(cropped, image);
    }

    #[test]
    fn test_crop_runs_before_resize() {
        let transform = ImageTransform {
            crop: Some(CropRect {
                x: 0,
                y: 0,
                width: 2,
                height: 4,
            }),
            resize: Some(ResizeTarget {
                width: 6,
                height: 6,
            }),
            ..Default::default()
        };
        let out = apply_transform(&quadrants(), Some(&transform));
        assert_eq!(out.dimensions(), (6, 6));
        // Only the red half survives the crop, so scaling cannot blend in blue.
        assert!(out.pixels().all(|p| p.0 == [255, 0, 0]));
    }

    #[test]
    fn test_zero_resize_is_noop() {
        let image = quadrants();
        let out = resize(
            image.clone(),
            ResizeTarget {
                width: 0,
                height: 3,
            },
        );
        assert_eq!(out, image);
    }

    #[test]
    fn test_brightness_offset() {
        let mut image = solid(1, 1, [0, 0, 0]);
        adjust_color(
            &mut image,
            &ColorAdjustment {
                brightness: 0.5,
                ..Default::default()
            },
        );
        assert_eq!(image.get_pixel(0, 0).0, [128, 128, 128]);
    }

    #[test]
    fn test_adjustment_runs_before_filter() {
        let transform = ImageTransform {
            color_adjustment: Some(ColorAdjustment {
                brightness: 0.2,
                ..Default::default()
            }),
            color_filter: Some(ColorFilter::Invert),
            ..Default::default()
        };
        let out = apply_transform(&solid(1, 1, [0, 0, 0]), Some(&transform));
        // brighten to 0.2, then invert to 0.8; the reverse order would give 1.0.
        assert_eq!(out.get_pixel(0, 0).0, [204, 204, 204]);
    }

    #[test]
    fn test_brightness_runs_before_contrast() {
        let mut image = solid(1, 1, [0, 0, 0]);
        adjust_color(
            &mut image,
            &ColorAdjustment {
                brightness: 0.2,
                contrast: 0.5,
                ..Default::default()
            },
        );
        // 0 -> 0.2 -> (0.2 - 0.5) * 1.5 + 0.5 = 0.05; reversed would clamp to 0 then give 0.2.
        assert_eq!(image.get_pixel(0, 0).0, [13, 13, 13]);
    }

    #[test]
    fn test_full_desaturation_matches_luma() {
        let mut image = solid(1, 1, [255, 0, 0]);
        adjust_color(
            &mut image,
            &ColorAdjustment {
                saturation: -1.0,
                ..Default::default()
            },
        );
        let expected = (0.299f64 * 255.0).round() as u8;
        assert_eq!(image.get_pixel(0, 0).0, [expected, expected, expected]);
    }

    #[test]
    fn test_gamma_one_and_hue_zero_are_noops() {
        let image = quadrants();
        let mut out = image.clone();
        adjust_color(&mut out, &ColorAdjustment::default());
        assert_eq!(out, image);
    }

    #[test]
    fn test_gamma_brightens_midtones() {
        let mut image = solid(1, 1, [64, 64, 64]);
        adjust_color(
            &mut image,
            &ColorAdjustment {
                gamma: 2.0,
                ..Default::default()
            },
        );
        assert!(image.get_pixel(0, 0).0[0] > 64);
    }

    #[test]
    fn test_hue_rotation_preserves_grey() {
        let mut image = solid(1, 1, [100, 100, 100]);
        adjust_color(
            &mut image,
            &ColorAdjustment {
                hue: 90.0,
                ..Default::default()
            },
        );
        assert_eq!(image.get_pixel(0, 0).0, [100, 100, 100]);
    }

    #[test]
    fn test_filters() {
        let mut grey = solid(1, 1, [255, 0, 0]);
        apply_filter(&mut grey, ColorFilter::Grayscale);
        let p = grey.get_pixel(0, 0).0;
        assert!(p[0] == p[1] && p[1] == p[2]);

        let mut inverted = solid(1, 1, [255, 0, 10]);
        apply_filter(&mut inverted, ColorFilter::Invert);
        assert_eq!(inverted.get_pixel(0, 0).0, [0, 255, 245]);

        let mut warm = solid(1, 1, [100, 100, 100]);
        apply_filter(&mut warm, ColorFilter::Warm);
        let p = warm.get_pixel(0, 0).0;
        assert!(p[0] > p[1] && p[1] > p[2]);

        let mut cool = solid(1, 1, [100, 100, 100]);
        apply_filter(&mut cool, ColorFilter::Cool);
        let p = cool.get_pixel(0, 0).0;
        assert!(p[2] > p[1] && p[1] > p[0]);

        let mut sepia = solid(1, 1, [255, 255, 255]);
        apply_filter(&mut sepia, ColorFilter::Sepia);
        let p = sepia.get_pixel(0, 0).0;
        assert!(p[0] >= p[1] && p[1] >= p[2]);
    }
}
