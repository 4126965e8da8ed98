use std::path::Path;

use image::{Rgb, RgbImage};
use log::debug;
use ndarray::Array2;
use textplots::{Chart, Plot, Shape};

use crate::error::GateError;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const FRAME: Rgb<u8> = Rgb([0x2c, 0x3e, 0x50]);
const TRACE: Rgb<u8> = Rgb([0, 0, 255]);

/// Heat map colour stops, low to high
const COLORMAP: [[u8; 3]; 3] = [[0x02, 0x50, 0x7d], [0xed, 0xe8, 0xe5], [0xb5, 0x28, 0x3b]];

const IMAGE_WIDTH: u32 = 800;
const IMAGE_HEIGHT: u32 = 600;
const MARGIN: u32 = 50;
const COLORBAR_WIDTH: u32 = 30;
const COLORBAR_GAP: u32 = 20;

/// Closed interval of an axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    fn span(&self) -> f64 {
        self.max - self.min
    }
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Y limits: a quarter of the span above and below the data.
///
/// A flat trace is widened by ±0.001 first.
fn current_limits(ys: &[f64]) -> Option<AxisRange> {
    let (mut lo, mut hi) = min_max(ys)?;
    if lo == hi {
        lo -= 0.001;
        hi += 0.001;
    }
    let pad = (hi - lo) / 4.0;
    Some(AxisRange {
        min: lo - pad,
        max: hi + pad,
    })
}

/// Limits for a voltage trace: x padded by one step on either side.
pub fn sweep_limits(xs: &[f64], ys: &[f64], step: f64) -> Option<(AxisRange, AxisRange)> {
    let (lo, hi) = min_max(xs)?;
    let x = AxisRange {
        min: lo - step,
        max: hi + step,
    };
    Some((x, current_limits(ys)?))
}

/// Limits for a time trace: x from zero to one step past the last sample.
pub fn time_limits(ts: &[f64], ys: &[f64], step: f64) -> Option<(AxisRange, AxisRange)> {
    let last = ts.iter().copied().filter(|t| t.is_finite()).last()?;
    let x = AxisRange {
        min: 0.0,
        max: last + step,
    };
    Some((x, current_limits(ys)?))
}

/// Terminal chart redrawn after every point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivePlot {
    enabled: bool,
    width: u32,
    height: u32,
}

impl Default for LivePlot {
    fn default() -> Self {
        Self::new(true, 120, 40)
    }
}

impl LivePlot {
    /// textplots needs at least 32 columns and 3 rows.
    pub fn new(enabled: bool, width: u32, height: u32) -> Self {
        Self {
            enabled,
            width: width.max(32),
            height: height.max(3),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 32, 3)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Draw a trace with precomputed axis limits.
    pub fn line(&self, title: &str, xs: &[f64], ys: &[f64], limits: (AxisRange, AxisRange)) {
        if !self.enabled || xs.is_empty() {
            return;
        }
        let (x, y) = limits;
        let frame: Vec<(f32, f32)> = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| (x as f32, y as f32))
            .collect();

        println!("{title}");
        Chart::new_with_y_range(
            self.width,
            self.height,
            x.min as f32,
            x.max as f32,
            y.min as f32,
            y.max as f32,
        )
        .lineplot(&Shape::Lines(&frame))
        .nice();
    }

    /// Shade a partially filled map, lowest row at the bottom.
    pub fn heat_map(&self, title: &str, data: &Array2<f64>) {
        if !self.enabled {
            return;
        }
        println!("{title}");
        print!("{}", render_heat_map(data, self.width as usize));
    }
}

/// Text rendering of `data` with one character per sampled cell.
fn render_heat_map(data: &Array2<f64>, max_columns: usize) -> String {
    const SHADES: &[u8] = b".:-=+*#%@";
    let (rows, cols) = data.dim();
    let values: Vec<f64> = data.iter().copied().collect();
    let Some((lo, hi)) = min_max(&values) else {
        return String::new();
    };
    let shown = cols.min(max_columns.max(1));
    let mut out = String::with_capacity((shown + 1) * rows);
    for row in (0..rows).rev() {
        for c in 0..shown {
            let col = c * cols / shown;
            let value = data[[row, col]];
            let ch = if value.is_nan() {
                ' '
            } else {
                let t = normalize(value, lo, hi);
                SHADES[((t * (SHADES.len() - 1) as f64).round() as usize).min(SHADES.len() - 1)]
                    as char
            };
            out.push(ch);
        }
        out.push('\n');
    }
    out
}

fn normalize(value: f64, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else {
        0.5
    }
}

/// Linear interpolation through the three colour stops, `t` in [0, 1].
pub fn colormap(t: f64) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0) * (COLORMAP.len() - 1) as f64;
    let i = (t.floor() as usize).min(COLORMAP.len() - 2);
    let frac = t - i as f64;
    let (a, b) = (COLORMAP[i], COLORMAP[i + 1]);
    let mix = |k: usize| (a[k] as f64 + (b[k] as f64 - a[k] as f64) * frac).round() as u8;
    Rgb([mix(0), mix(1), mix(2)])
}

fn draw_frame(img: &mut RgbImage, left: u32, top: u32, right: u32, bottom: u32) {
    for x in left..=right {
        img.put_pixel(x, top, FRAME);
        img.put_pixel(x, bottom, FRAME);
    }
    for y in top..=bottom {
        img.put_pixel(left, y, FRAME);
        img.put_pixel(right, y, FRAME);
    }
}

/// Bresenham line, two pixels thick.
fn draw_line(img: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x0, mut y0) = from;
    let (x1, y1) = to;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (w, h) = (img.width() as i64, img.height() as i64);
    loop {
        for (px, py) in [(x0, y0), (x0 + 1, y0), (x0, y0 + 1)] {
            if (0..w).contains(&px) && (0..h).contains(&py) {
                img.put_pixel(px as u32, py as u32, color);
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Render a trace as a PNG line plot.
pub fn line_plot_image(xs: &[f64], ys: &[f64], limits: (AxisRange, AxisRange)) -> RgbImage {
    let mut img = RgbImage::from_pixel(IMAGE_WIDTH, IMAGE_HEIGHT, WHITE);
    let (left, top) = (MARGIN, MARGIN);
    let (right, bottom) = (IMAGE_WIDTH - MARGIN, IMAGE_HEIGHT - MARGIN);
    draw_frame(&mut img, left, top, right, bottom);

    let (xr, yr) = limits;
    let to_pixel = |x: f64, y: f64| -> (i64, i64) {
        let px = left as f64 + (x - xr.min) / xr.span() * (right - left) as f64;
        let py = bottom as f64 - (y - yr.min) / yr.span() * (bottom - top) as f64;
        (px.round() as i64, py.round() as i64)
    };

    let points: Vec<(i64, i64)> = xs
        .iter()
        .zip(ys)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| to_pixel(x, y))
        .collect();
    match points.as_slice() {
        [] => {}
        [single] => draw_line(&mut img, *single, *single, TRACE),
        _ => {
            for pair in points.windows(2) {
                draw_line(&mut img, pair[0], pair[1], TRACE);
            }
        }
    }
    img
}

/// Render a map with the lowest row at the bottom and a colorbar on the right.
pub fn heat_map_image(data: &Array2<f64>) -> RgbImage {
    let mut img = RgbImage::from_pixel(IMAGE_WIDTH, IMAGE_HEIGHT, WHITE);
    let (rows, cols) = data.dim();
    let bar_right = IMAGE_WIDTH - MARGIN;
    let bar_left = bar_right - COLORBAR_WIDTH;
    let (left, top) = (MARGIN, MARGIN);
    let (right, bottom) = (bar_left - COLORBAR_GAP, IMAGE_HEIGHT - MARGIN);

    let finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    let (lo, hi) = min_max(&finite).unwrap_or((0.0, 0.0));

    if rows > 0 && cols > 0 {
        let (plot_w, plot_h) = ((right - left - 1) as usize, (bottom - top - 1) as usize);
        for py in 0..plot_h {
            let row = ((plot_h - 1 - py) * rows / plot_h).min(rows - 1);
            for px in 0..plot_w {
                let col = (px * cols / plot_w).min(cols - 1);
                let value = data[[row, col]];
                if value.is_finite() {
                    let color = colormap(normalize(value, lo, hi));
                    img.put_pixel(left + 1 + px as u32, top + 1 + py as u32, color);
                }
            }
        }
    }
    draw_frame(&mut img, left, top, right, bottom);

    let bar_h = bottom - top;
    for y in top..=bottom {
        let t = (bottom - y) as f64 / bar_h as f64;
        let color = colormap(t);
        for x in bar_left..=bar_right {
            img.put_pixel(x, y, color);
        }
    }
    draw_frame(&mut img, bar_left, top, bar_right, bottom);
    img
}

pub fn save_line_plot(path: &Path, xs: &[f64], ys: &[f64], step: f64) -> Result<(), GateError> {
    let limits = sweep_limits(xs, ys, step).unwrap_or((
        AxisRange { min: -1.0, max: 1.0 },
        AxisRange { min: -1.0, max: 1.0 },
    ));
    line_plot_image(xs, ys, limits).save(path)?;
    debug!("Saved line plot to {}", path.display());
    Ok(())
}

pub fn save_time_plot(path: &Path, ts: &[f64], ys: &[f64], step: f64) -> Result<(), GateError> {
    let limits = time_limits(ts, ys, step).unwrap_or((
        AxisRange { min: 0.0, max: 1.0 },
        AxisRange { min: -1.0, max: 1.0 },
    ));
    line_plot_image(ts, ys, limits).save(path)?;
    debug!("Saved time plot to {}", path.display());
    Ok(())
}

pub fn save_heat_map(path: &Path, data: &Array2<f64>) -> Result<(), GateError> {
    heat_map_image(data).save(path)?;
    debug!("Saved heat map to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sweep_limits_pad_by_step() {
        let (x, y) = sweep_limits(&[0.0, 0.1, 0.2], &[1.0, 2.0, 3.0], 0.1).unwrap();
        assert!((x.min + 0.1).abs() < 1e-12);
        assert!((x.max - 0.3).abs() < 1e-12);
        assert!((y.min - 0.5).abs() < 1e-12);
        assert!((y.max - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_flat_trace_is_widened() {
        let (_, y) = sweep_limits(&[0.0, 1.0], &[2.0, 2.0], 1.0).unwrap();
        assert!((y.min - (2.0 - 0.001 - 0.0005)).abs() < 1e-12);
        assert!((y.max - (2.0 + 0.001 + 0.0005)).abs() < 1e-12);
    }

    #[test]
    fn test_time_limits_start_at_zero() {
        let (x, _) = time_limits(&[0.0, 0.5, 1.0], &[1.0, 2.0, 1.5], 0.5).unwrap();
        assert_eq!(x.min, 0.0);
        assert_eq!(x.max, 1.5);
        assert!(time_limits(&[], &[], 0.5).is_none());
    }

    #[test]
    fn test_colormap_stops() {
        assert_eq!(colormap(0.0), Rgb([0x02, 0x50, 0x7d]));
        assert_eq!(colormap(0.5), Rgb([0xed, 0xe8, 0xe5]));
        assert_eq!(colormap(1.0), Rgb([0xb5, 0x28, 0x3b]));
        assert_eq!(colormap(2.0), colormap(1.0));
    }

    #[test]
    fn test_heat_map_leaves_nan_white() {
        let mut data = Array2::from_elem((2, 2), f64::NAN);
        data[[0, 0]] = 1.0;
        data[[0, 1]] = 2.0;
        let img = heat_map_image(&data);
        // Lower-left quarter of the plot area holds row 0, col 0 (the minimum).
        assert_eq!(*img.get_pixel(MARGIN + 10, IMAGE_HEIGHT - MARGIN - 10), colormap(0.0));
        // Upper rows are still NaN.
        assert_eq!(*img.get_pixel(MARGIN + 10, MARGIN + 10), WHITE);
    }

    #[test]
    fn test_render_heat_map_origin_lower() {
        let mut data = Array2::from_elem((2, 3), f64::NAN);
        data[[0, 0]] = 0.0;
        data[[0, 2]] = 1.0;
        let text = render_heat_map(&data, 80);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["   ", ". @"]);
    }

    #[test]
    fn test_save_pngs() {
        let dir = tempdir().unwrap();
        let line = dir.path().join("line.png");
        save_line_plot(&line, &[0.0, 0.1, 0.2], &[0.0, 1.0, 4.0], 0.1).unwrap();
        assert!(line.exists());

        let map = dir.path().join("map.png");
        save_heat_map(&map, &Array2::from_shape_fn((3, 4), |(r, c)| (r * c) as f64)).unwrap();
        let img = image::open(&map).unwrap();
        assert_eq!(img.width(), IMAGE_WIDTH);
    }

    #[test]
    fn test_disabled_live_plot_is_silent() {
        let plot = LivePlot::disabled();
        assert!(!plot.is_enabled());
        plot.line("t", &[0.0], &[0.0], sweep_limits(&[0.0], &[0.0], 1.0).unwrap());
        plot.heat_map("t", &Array2::zeros((1, 1)));
    }
}
