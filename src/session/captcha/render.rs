//! PNG rendering for classic challenges.

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use rand::Rng;
use std::io::Cursor;

pub const WIDTH: u32 = 280;
pub const HEIGHT: u32 = 90;
const MARGIN: u32 = 14;
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

// 5x7 bitmaps, one byte per row, bit 4 is the leftmost column.
const DIGITS: [[u8; 7]; 10] = [
    [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
    [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
    [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
    [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
    [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
    [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
    [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
    [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
    [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
];

const LETTERS: [[u8; 7]; 26] = [
    [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11],
    [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
    [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
    [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
    [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
    [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
    [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
    [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
    [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
    [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
    [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
    [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
    [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
    [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
    [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
    [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
    [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
    [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
    [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
    [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
    [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
];

fn glyph(c: char) -> Option<&'static [u8; 7]> {
    match c.to_ascii_uppercase() {
        d @ '0'..='9' => DIGITS.get(d as usize - '0' as usize),
        l @ 'A'..='Z' => LETTERS.get(l as usize - 'A' as usize),
        _ => None,
    }
}

fn put(img: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    if x < img.width() && y < img.height() {
        img.put_pixel(x, y, color);
    }
}

fn ink<R: Rng>(rng: &mut R) -> Rgb<u8> {
    Rgb([rng.gen_range(10..110), rng.gen_range(10..110), rng.gen_range(10..110)])
}

fn noise<R: Rng>(rng: &mut R) -> Rgb<u8> {
    Rgb([
        rng.gen_range(120..220),
        rng.gen_range(120..220),
        rng.gen_range(120..220),
    ])
}

/// Draw `value` on a 280x90 canvas with dot and line noise and encode it as PNG.
///
/// # Errors
/// Returns an error if PNG encoding fails.
pub fn render_png(value: &str) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([245, 245, 240]));

    for _ in 0..(WIDTH * HEIGHT / 12) {
        let color = noise(&mut rng);
        put(
            &mut img,
            rng.gen_range(0..WIDTH),
            rng.gen_range(0..HEIGHT),
            color,
        );
    }

    let count = u32::try_from(value.chars().count()).unwrap_or(u32::MAX).max(1);
    let cell = (WIDTH - 2 * MARGIN) / count;
    let scale = (cell / (GLYPH_WIDTH + 1)).clamp(1, 8);
    let glyph_height = GLYPH_HEIGHT * scale;

    for (index, c) in (0u32..).zip(value.chars()) {
        let Some(rows) = glyph(c) else {
            continue;
        };
        let color = ink(&mut rng);
        let spread = (HEIGHT - glyph_height).min(2 * MARGIN);
        let top = (HEIGHT - glyph_height) / 2 - spread / 2 + rng.gen_range(0..=spread);
        let left =
            MARGIN + index * cell + rng.gen_range(0..=cell.saturating_sub(GLYPH_WIDTH * scale).min(6));

        for (row, bits) in (0u32..).zip(rows.iter()) {
            for column in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - column)) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        put(
                            &mut img,
                            left + column * scale + dx,
                            top + row * scale + dy,
                            color,
                        );
                    }
                }
            }
        }
    }

    for _ in 0..4 {
        let color = ink(&mut rng);
        let (x0, y0) = (rng.gen_range(0..WIDTH / 3), rng.gen_range(0..HEIGHT));
        let (x1, y1) = (rng.gen_range(2 * WIDTH / 3..WIDTH), rng.gen_range(0..HEIGHT));
        draw_line(&mut img, (x0, y0), (x1, y1), color);
    }

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("failed to encode captcha image")?;
    Ok(png)
}

fn draw_line(img: &mut RgbImage, from: (u32, u32), to: (u32, u32), color: Rgb<u8>) {
    let (x0, y0) = (i64::from(from.0), i64::from(from.1));
    let (x1, y1) = (i64::from(to.0), i64::from(to.1));
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1);
    for step in 0..=steps {
        let x = x0 + (x1 - x0) * step / steps;
        let y = y0 + (y1 - y0) * step / steps;
        if let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) {
            put(img, x, y, color);
        }
    }
}
