use std::path::Path;

use anyhow::{Context, Result};
use fontdue::Font;
use image::{imageops, Rgba, RgbaImage};

use crate::bubble::TextPainter;

pub const AVATAR_SIZE: u32 = 256;
pub const INITIALS_FONT_SIZE: f32 = 100.0;
const GRADIENT_FROM: u32 = 50;
const GRADIENT_SPAN: u32 = 55;
const MASK_ALPHA: u8 = 150;
const INITIALS_LIFT: f32 = 10.0;

/// Up to two uppercase initials from the first two words of `name`.
pub fn initials(name: &str) -> String {
    let letters = name
        .split_whitespace()
        .take(2)
        .filter_map(|part| part.chars().next())
        .flat_map(char::to_uppercase)
        .collect::<String>();
    if letters.is_empty() {
        "?".to_owned()
    } else {
        letters
    }
}

/// Initials on a dark vertical gradient, cut to a translucent circle.
pub fn initials_avatar(name: &str, font: Font) -> RgbaImage {
    let size = AVATAR_SIZE;
    let mut image = RgbaImage::new(size, size);
    for y in 0..size {
        let shade = (GRADIENT_FROM + GRADIENT_SPAN * y / size) as u8;
        for x in 0..size {
            image.put_pixel(x, y, Rgba([shade, shade, shade, 255]));
        }
    }

    let mut painter = TextPainter::new(font);
    let text = initials(name);
    if let Some(bounds) = painter.bounds(&text, INITIALS_FONT_SIZE) {
        let x = (size as f32 - bounds.width) / 2.0 - bounds.min_x;
        let y = (size as f32 - bounds.height) / 2.0 - bounds.min_y - INITIALS_LIFT;
        let (width, height) = image.dimensions();
        painter.draw_line(
            &mut image,
            width,
            height,
            x.floor(),
            y.floor(),
            &text,
            INITIALS_FONT_SIZE,
            [255, 255, 255, 255],
        );
    }

    apply_circle_mask(&mut image, MASK_ALPHA);
    image
}

/// Loads a user-supplied profile picture and center-crops it to a square.
pub fn load_profile_image(path: &Path) -> Result<RgbaImage> {
    let image = image::open(path)
        .with_context(|| format!("failed to load profile image {}", path.display()))?
        .to_rgba8();
    Ok(fit_square(&image))
}

pub fn fit_square(image: &RgbaImage) -> RgbaImage {
    let (width, height) = image.dimensions();
    let side = width.min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    imageops::crop_imm(image, x, y, side, side).to_image()
}

fn apply_circle_mask(image: &mut RgbaImage, alpha: u8) {
    let (width, height) = image.dimensions();
    let radius = width.min(height) as f32 / 2.0;
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        pixel[3] = if dx * dx + dy * dy <= radius * radius {
            alpha
        } else {
            0
        };
    }
}
