use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use fontdue::layout::{
    CoordinateSystem, GlyphRasterConfig, Layout, LayoutSettings as GlyphLayoutSettings, TextStyle,
};
use fontdue::Font;
use image::RgbaImage;
use tiny_skia::{
    Color, FillRule, FilterQuality, Paint, PathBuilder, Pattern, Pixmap, Rect, SpreadMode,
    Transform,
};

use crate::config::LayoutSettings;
use crate::conversation::Side;
use crate::layout::line_advance;
use crate::reveal::{BubbleRenderer, FrameScene, SceneBubble};

const AVATAR_TOP: u32 = 10;
const NAME_GAP: u32 = 5;

/// Dark messaging palette.
#[derive(Debug, Clone)]
pub struct Theme {
    pub background: [u8; 4],
    pub header_background: [u8; 4],
    pub own_bubble: [u8; 4],
    pub other_bubble: [u8; 4],
    pub own_text: [u8; 4],
    pub other_text: [u8; 4],
    pub header_text: [u8; 4],
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            background: [0x12, 0x12, 0x12, 255],
            header_background: [0x1E, 0x1E, 0x1E, 255],
            own_bubble: [0x0A, 0x84, 0xFF, 255],
            other_bubble: [0x2C, 0x2C, 0x2E, 255],
            own_text: [255, 255, 255, 255],
            other_text: [255, 255, 255, 255],
            header_text: [255, 255, 255, 255],
        }
    }
}

#[derive(Debug, Clone)]
struct GlyphBitmap {
    width: usize,
    height: usize,
    bitmap: Vec<u8>,
}

/// Extent of laid-out text relative to the layout origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextBounds {
    pub min_x: f32,
    pub min_y: f32,
    pub width: f32,
    pub height: f32,
}

/// Rasterizes single lines of text into RGBA buffers with a glyph cache.
pub struct TextPainter {
    font: Font,
    glyph_cache: HashMap<GlyphRasterConfig, GlyphBitmap>,
}

impl TextPainter {
    pub fn new(font: Font) -> Self {
        Self {
            font,
            glyph_cache: HashMap::new(),
        }
    }

    /// Advance width of `text` at `font_size`, including kerning.
    pub fn measure(&self, text: &str, font_size: f32) -> f32 {
        let mut width = 0.0;
        let mut previous = None;
        for ch in text.chars() {
            if let Some(prev) = previous {
                width += self
                    .font
                    .horizontal_kern(prev, ch, font_size)
                    .unwrap_or(0.0);
            }
            width += self.font.metrics(ch, font_size).advance_width;
            previous = Some(ch);
        }
        width
    }

    /// Ink bounds of `text` laid out at the origin.
    pub fn bounds(&self, text: &str, font_size: f32) -> Option<TextBounds> {
        let layout = self.layout(0.0, 0.0, text, font_size);
        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = f32::MIN;
        let mut max_y = f32::MIN;
        for glyph in layout.glyphs() {
            if glyph.width == 0 || glyph.height == 0 {
                continue;
            }
            min_x = min_x.min(glyph.x);
            min_y = min_y.min(glyph.y);
            max_x = max_x.max(glyph.x + glyph.width as f32);
            max_y = max_y.max(glyph.y + glyph.height as f32);
        }
        (min_x <= max_x).then(|| TextBounds {
            min_x,
            min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }

    fn layout(&self, x: f32, y: f32, text: &str, font_size: f32) -> Layout {
        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&GlyphLayoutSettings {
            x,
            y,
            max_width: None,
            max_height: None,
            horizontal_align: fontdue::layout::HorizontalAlign::Left,
            vertical_align: fontdue::layout::VerticalAlign::Top,
            line_height: 1.0,
            wrap_style: fontdue::layout::WrapStyle::Letter,
            wrap_hard_breaks: true,
        });
        layout.append(&[&self.font], &TextStyle::new(text, font_size, 0));
        layout
    }

    pub fn draw_line(
        &mut self,
        frame: &mut [u8],
        width: u32,
        height: u32,
        x: f32,
        y: f32,
        text: &str,
        font_size: f32,
        color: [u8; 4],
    ) {
        let layout = self.layout(x, y, text, font_size);
        for glyph in layout.glyphs() {
            if glyph.width == 0 || glyph.height == 0 {
                continue;
            }
            let font = &self.font;
            let glyph_bitmap = self.glyph_cache.entry(glyph.key).or_insert_with(|| {
                let (_, bitmap) = font.rasterize_config(glyph.key);
                GlyphBitmap {
                    width: glyph.width,
                    height: glyph.height,
                    bitmap,
                }
            });

            blend_glyph(
                frame,
                width,
                height,
                glyph.x.round() as i32,
                glyph.y.round() as i32,
                glyph_bitmap,
                color,
            );
        }
    }
}

/// Paints phone-style chat frames: a static header with the contact's
/// avatar and name, and stacked rounded bubbles below it.
pub struct ChatPainter {
    layout: LayoutSettings,
    theme: Theme,
    text: TextPainter,
    base: Pixmap,
}

impl ChatPainter {
    pub fn new(
        layout: &LayoutSettings,
        theme: Theme,
        font: Font,
        contact_name: &str,
        avatar: &RgbaImage,
    ) -> Result<Self> {
        let mut text = TextPainter::new(font);
        let base = draw_static_frame(layout, &theme, &mut text, contact_name, avatar)?;
        Ok(Self {
            layout: layout.clone(),
            theme,
            text,
            base,
        })
    }

    fn bubble_width(&self, lines: &[String]) -> u32 {
        let widest = lines
            .iter()
            .map(|line| self.text.measure(line, self.layout.font_size))
            .fold(0.0_f32, f32::max);
        widest.ceil() as u32 + 2 * self.layout.bubble_padding
    }

    fn draw_bubble(&mut self, pixmap: &mut Pixmap, bubble: &SceneBubble) -> Result<()> {
        let width = self.layout.width;
        let height = self.layout.height;
        if bubble.top >= height {
            return Ok(());
        }

        let bubble_width = self.bubble_width(&bubble.lines).min(width);
        let (fill, text_color) = match bubble.side {
            Side::Own => (self.theme.own_bubble, self.theme.own_text),
            Side::Other => (self.theme.other_bubble, self.theme.other_text),
        };
        let x0 = match bubble.side {
            Side::Own => width.saturating_sub(bubble_width + self.layout.padding),
            Side::Other => self.layout.padding,
        };

        let radius = self
            .layout
            .bubble_radius
            .min(bubble.height as f32 / 2.0)
            .min(bubble_width as f32 / 2.0);
        fill_rounded_rect(
            pixmap,
            x0 as f32,
            bubble.top as f32,
            bubble_width as f32,
            bubble.height as f32,
            radius,
            fill,
        )?;

        let advance = line_advance(&self.layout);
        let mut text_y = bubble.top + self.layout.bubble_padding / 2;
        for line in &bubble.lines {
            self.text.draw_line(
                pixmap.data_mut(),
                width,
                height,
                (x0 + self.layout.bubble_padding) as f32,
                text_y as f32,
                line,
                self.layout.font_size,
                text_color,
            );
            text_y = text_y.saturating_add(advance);
        }
        Ok(())
    }
}

impl BubbleRenderer for ChatPainter {
    fn frame_size(&self) -> (u32, u32) {
        (self.layout.width, self.layout.height)
    }

    fn render(&mut self, scene: &FrameScene) -> Result<RgbaImage> {
        let mut pixmap = self.base.clone();
        for bubble in &scene.bubbles {
            self.draw_bubble(&mut pixmap, bubble).with_context(|| {
                format!("failed to draw bubble for turn {}", bubble.turn_index)
            })?;
        }
        let (width, height) = (pixmap.width(), pixmap.height());
        RgbaImage::from_raw(width, height, pixmap.take())
            .ok_or_else(|| anyhow!("rendered frame buffer has the wrong size"))
    }
}

fn draw_static_frame(
    layout: &LayoutSettings,
    theme: &Theme,
    text: &mut TextPainter,
    contact_name: &str,
    avatar: &RgbaImage,
) -> Result<Pixmap> {
    let mut pixmap = Pixmap::new(layout.width, layout.height)
        .ok_or_else(|| anyhow!("invalid frame size {}x{}", layout.width, layout.height))?;
    pixmap.fill(color(theme.background));

    let header = Rect::from_xywh(0.0, 0.0, layout.width as f32, layout.header_height as f32)
        .ok_or_else(|| anyhow!("invalid header height {}", layout.header_height))?;
    pixmap.fill_rect(header, &solid_paint(theme.header_background), Transform::identity(), None);

    draw_avatar_circle(&mut pixmap, layout, avatar)?;

    let name_width = text.measure(contact_name, layout.header_font_size);
    let name_x = (layout.width as f32 - name_width) / 2.0;
    let name_y = (AVATAR_TOP + layout.avatar_size + NAME_GAP) as f32;
    text.draw_line(
        pixmap.data_mut(),
        layout.width,
        layout.height,
        name_x,
        name_y,
        contact_name,
        layout.header_font_size,
        theme.header_text,
    );

    Ok(pixmap)
}

fn draw_avatar_circle(pixmap: &mut Pixmap, layout: &LayoutSettings, avatar: &RgbaImage) -> Result<()> {
    let size = layout.avatar_size;
    if size == 0 {
        return Ok(());
    }
    let scaled = image::imageops::resize(avatar, size, size, image::imageops::FilterType::Lanczos3);
    // Pasted opaque; the circular clip supplies the shape.
    let mut data = scaled.into_raw();
    for pixel in data.chunks_exact_mut(4) {
        pixel[3] = 255;
    }
    let avatar_pixmap = tiny_skia::IntSize::from_wh(size, size)
        .and_then(|dims| Pixmap::from_vec(data, dims))
        .ok_or_else(|| anyhow!("invalid avatar size {size}"))?;

    let left = (layout.width.saturating_sub(size) / 2) as f32;
    let top = AVATAR_TOP as f32;
    let radius = size as f32 / 2.0;
    let circle = PathBuilder::from_circle(left + radius, top + radius, radius)
        .ok_or_else(|| anyhow!("invalid avatar circle"))?;

    let paint = Paint {
        shader: Pattern::new(
            avatar_pixmap.as_ref(),
            SpreadMode::Pad,
            FilterQuality::Bilinear,
            1.0,
            Transform::from_translate(left, top),
        ),
        anti_alias: true,
        ..Paint::default()
    };
    pixmap.fill_path(&circle, &paint, FillRule::Winding, Transform::identity(), None);
    Ok(())
}

/// Rounded rectangle built from four cubic quarter arcs.
fn fill_rounded_rect(
    pixmap: &mut Pixmap,
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    radius: f32,
    fill: [u8; 4],
) -> Result<()> {
    const KAPPA: f32 = 0.552_284_8;
    let r = radius.max(0.0);
    let k = r * KAPPA;
    let (x1, y1) = (x + w, y + h);

    let mut builder = PathBuilder::new();
    builder.move_to(x + r, y);
    builder.line_to(x1 - r, y);
    builder.cubic_to(x1 - r + k, y, x1, y + r - k, x1, y + r);
    builder.line_to(x1, y1 - r);
    builder.cubic_to(x1, y1 - r + k, x1 - r + k, y1, x1 - r, y1);
    builder.line_to(x + r, y1);
    builder.cubic_to(x + r - k, y1, x, y1 - r + k, x, y1 - r);
    builder.line_to(x, y + r);
    builder.cubic_to(x, y + r - k, x + r - k, y, x + r, y);
    builder.close();
    let path = builder
        .finish()
        .ok_or_else(|| anyhow!("degenerate bubble {w}x{h} at ({x}, {y})"))?;

    pixmap.fill_path(&path, &solid_paint(fill), FillRule::Winding, Transform::identity(), None);
    Ok(())
}

fn color(rgba: [u8; 4]) -> Color {
    Color::from_rgba8(rgba[0], rgba[1], rgba[2], rgba[3])
}

fn solid_paint(rgba: [u8; 4]) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(rgba[0], rgba[1], rgba[2], rgba[3]);
    paint.anti_alias = true;
    paint
}

fn blend_glyph(
    frame: &mut [u8],
    frame_width: u32,
    frame_height: u32,
    x: i32,
    y: i32,
    glyph: &GlyphBitmap,
    color: [u8; 4],
) {
    for row in 0..glyph.height {
        let py = y + row as i32;
        if py < 0 || py >= frame_height as i32 {
            continue;
        }

        for col in 0..glyph.width {
            let px = x + col as i32;
            if px < 0 || px >= frame_width as i32 {
                continue;
            }

            let mask = glyph.bitmap[row * glyph.width + col];
            if mask == 0 {
                continue;
            }

            let alpha = ((u16::from(mask) * u16::from(color[3])) / 255) as u8;
            let idx = ((py as u32 * frame_width + px as u32) * 4) as usize;
            blend_pixel(frame, idx, [color[0], color[1], color[2], alpha]);
        }
    }
}

/// Source-over onto an opaque destination.
fn blend_pixel(frame: &mut [u8], idx: usize, src: [u8; 4]) {
    let alpha = u16::from(src[3]);
    if alpha == 0 {
        return;
    }

    let inv_alpha = 255_u16.saturating_sub(alpha);

    for channel in 0..3 {
        let dst = u16::from(frame[idx + channel]);
        let src_c = u16::from(src[channel]);
        frame[idx + channel] = ((src_c * alpha + dst * inv_alpha + 127) / 255) as u8;
    }
    frame[idx + 3] = 255;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_pixel_mixes_toward_source() {
        let mut frame = vec![0_u8, 0, 0, 255];
        blend_pixel(&mut frame, 0, [255, 255, 255, 128]);
        assert_eq!(frame, vec![128, 128, 128, 255]);

        blend_pixel(&mut frame, 0, [10, 20, 30, 0]);
        assert_eq!(frame, vec![128, 128, 128, 255]);
    }

    #[test]
    fn glyphs_are_clipped_to_the_frame() {
        let glyph = GlyphBitmap {
            width: 2,
            height: 2,
            bitmap: vec![255; 4],
        };
        let mut frame = vec![0_u8; 2 * 2 * 4];
        blend_glyph(&mut frame, 2, 2, 1, 1, &glyph, [200, 0, 0, 255]);
        assert_eq!(&frame[12..16], &[200, 0, 0, 255]);
        assert_eq!(&frame[0..4], &[0, 0, 0, 0]);

        blend_glyph(&mut frame, 2, 2, -5, 40, &glyph, [200, 0, 0, 255]);
    }

    #[test]
    fn rounded_rect_fills_center_not_corner() {
        let mut pixmap = Pixmap::new(40, 40).unwrap();
        pixmap.fill(Color::from_rgba8(0, 0, 0, 255));
        fill_rounded_rect(&mut pixmap, 0.0, 0.0, 40.0, 40.0, 15.0, [255, 0, 0, 255]).unwrap();
        let center = pixmap.pixel(20, 20).unwrap();
        assert_eq!((center.red(), center.green()), (255, 0));
        let corner = pixmap.pixel(0, 0).unwrap();
        assert_eq!(corner.red(), 0);
    }
}
