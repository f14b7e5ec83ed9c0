//! Inline SVG charts
//!
//! A [`Chart`] is a single panel with axes, ticks and any number of layers
//! (lines, points, shaded bands, lollipop bars, horizontal reference lines).
//! A [`Grid`] lays several charts out in one `<svg>` element.

use std::fmt::Write;

pub const BLUE: &str = "#1f77b4";
pub const ORANGE: &str = "#ff7f0e";
pub const GREEN: &str = "#2ca02c";
pub const RED: &str = "#d62728";
pub const GREY: &str = "#7f7f7f";
pub const BAND: &str = "#aec7e8";

const MARGIN_LEFT: f64 = 60.0;
const MARGIN_RIGHT: f64 = 15.0;
const MARGIN_TOP: f64 = 30.0;
const MARGIN_BOTTOM: f64 = 45.0;

/// Escape text for XML/HTML content and attribute values
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone)]
enum Layer {
    Line { points: Vec<(f64, f64)>, color: String, dashed: bool },
    Points { points: Vec<(f64, f64)>, color: String, radius: f64 },
    Band { x: Vec<f64>, lower: Vec<f64>, upper: Vec<f64>, color: String },
    Bars { bars: Vec<(f64, f64)>, color: String },
    HLine { y: f64, color: String, dashed: bool },
}

/// A single plot panel
#[derive(Debug, Clone)]
pub struct Chart {
    title: String,
    x_label: String,
    y_label: String,
    width: f64,
    height: f64,
    layers: Vec<Layer>,
}

/// "Nice" tick positions covering `[lo, hi]`
fn ticks(lo: f64, hi: f64, target: usize) -> Vec<f64> {
    let span = hi - lo;
    if !(span > 0.0) || !span.is_finite() {
        return vec![lo];
    }
    let raw = span / target.max(1) as f64;
    let magnitude = 10f64.powf(raw.log10().floor());
    let step = [1.0, 2.0, 2.5, 5.0, 10.0]
        .iter()
        .map(|m| m * magnitude)
        .find(|&s| s >= raw)
        .unwrap_or(10.0 * magnitude);
    let first = (lo / step).ceil() * step;
    let mut out = Vec::new();
    let mut t = first;
    while t <= hi + step * 1e-9 {
        out.push(if t.abs() < step * 1e-9 { 0.0 } else { t });
        t += step;
    }
    out
}

fn tick_label(value: f64, step: f64) -> String {
    let decimals = (0..6)
        .find(|&d| {
            let scaled = step * 10f64.powi(d as i32);
            (scaled - scaled.round()).abs() < 1e-6 * scaled.max(1.0)
        })
        .unwrap_or(6);
    format!("{:.*}", decimals, value)
}

impl Chart {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            x_label: String::new(),
            y_label: String::new(),
            width: 480.0,
            height: 320.0,
            layers: Vec::new(),
        }
    }

    pub fn x_label(mut self, label: &str) -> Self {
        self.x_label = label.to_string();
        self
    }

    pub fn y_label(mut self, label: &str) -> Self {
        self.y_label = label.to_string();
        self
    }

    pub fn size(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    /// Polyline through the points in the order given
    pub fn line(mut self, points: Vec<(f64, f64)>, color: &str) -> Self {
        self.layers.push(Layer::Line { points, color: color.to_string(), dashed: false });
        self
    }

    pub fn dashed_line(mut self, points: Vec<(f64, f64)>, color: &str) -> Self {
        self.layers.push(Layer::Line { points, color: color.to_string(), dashed: true });
        self
    }

    pub fn points(mut self, points: Vec<(f64, f64)>, color: &str) -> Self {
        self.layers.push(Layer::Points { points, color: color.to_string(), radius: 2.0 });
        self
    }

    /// Shaded region between `lower` and `upper` along `x`
    pub fn band(mut self, x: Vec<f64>, lower: Vec<f64>, upper: Vec<f64>, color: &str) -> Self {
        self.layers.push(Layer::Band { x, lower, upper, color: color.to_string() });
        self
    }

    /// Vertical bars from zero (ACF style)
    pub fn bars(mut self, bars: Vec<(f64, f64)>, color: &str) -> Self {
        self.layers.push(Layer::Bars { bars, color: color.to_string() });
        self
    }

    pub fn hline(mut self, y: f64, color: &str, dashed: bool) -> Self {
        self.layers.push(Layer::HLine { y, color: color.to_string(), dashed });
        self
    }

    fn data_range(&self) -> ((f64, f64), (f64, f64)) {
        let mut xs: Vec<f64> = Vec::new();
        let mut ys: Vec<f64> = Vec::new();
        for layer in &self.layers {
            match layer {
                Layer::Line { points, .. } | Layer::Points { points, .. } => {
                    xs.extend(points.iter().map(|p| p.0));
                    ys.extend(points.iter().map(|p| p.1));
                }
                Layer::Band { x, lower, upper, .. } => {
                    xs.extend(x.iter().copied());
                    ys.extend(lower.iter().copied());
                    ys.extend(upper.iter().copied());
                }
                Layer::Bars { bars, .. } => {
                    xs.extend(bars.iter().map(|b| b.0));
                    ys.extend(bars.iter().map(|b| b.1));
                    ys.push(0.0);
                }
                Layer::HLine { y, .. } => ys.push(*y),
            }
        }
        (finite_range(&xs), finite_range(&ys))
    }

    /// Render as a standalone `<svg>` element
    pub fn render(&self) -> String {
        format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">{body}</svg>",
            w = self.width,
            h = self.height,
            body = self.render_body()
        )
    }

    /// The chart's elements without the enclosing `<svg>`, in local coordinates
    pub fn render_body(&self) -> String {
        let ((x0, x1), (y0, y1)) = self.data_range();
        let (x0, x1) = pad(x0, x1);
        let (y0, y1) = pad(y0, y1);

        let plot_w = self.width - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_h = self.height - MARGIN_TOP - MARGIN_BOTTOM;
        let sx = |x: f64| MARGIN_LEFT + (x - x0) / (x1 - x0) * plot_w;
        let sy = |y: f64| MARGIN_TOP + (y1 - y) / (y1 - y0) * plot_h;

        let mut out = String::new();
        let _ = write!(
            out,
            "<rect x=\"0\" y=\"0\" width=\"{}\" height=\"{}\" fill=\"white\"/>",
            self.width, self.height
        );
        let _ = write!(
            out,
            "<text x=\"{:.1}\" y=\"18\" text-anchor=\"middle\" font-size=\"13\" font-family=\"sans-serif\">{}</text>",
            self.width / 2.0,
            escape_xml(&self.title)
        );

        // axes frame
        let _ = write!(
            out,
            "<rect x=\"{:.1}\" y=\"{:.1}\" width=\"{:.1}\" height=\"{:.1}\" fill=\"none\" stroke=\"#333\"/>",
            MARGIN_LEFT, MARGIN_TOP, plot_w, plot_h
        );

        let x_ticks = ticks(x0, x1, 6);
        let x_step = if x_ticks.len() > 1 { x_ticks[1] - x_ticks[0] } else { 1.0 };
        for t in &x_ticks {
            let px = sx(*t);
            let base = MARGIN_TOP + plot_h;
            let _ = write!(
                out,
                "<line x1=\"{px:.1}\" y1=\"{base:.1}\" x2=\"{px:.1}\" y2=\"{:.1}\" stroke=\"#333\"/>\
                 <text x=\"{px:.1}\" y=\"{:.1}\" text-anchor=\"middle\" font-size=\"10\" font-family=\"sans-serif\">{}</text>",
                base + 4.0,
                base + 15.0,
                tick_label(*t, x_step)
            );
        }
        let y_ticks = ticks(y0, y1, 5);
        let y_step = if y_ticks.len() > 1 { y_ticks[1] - y_ticks[0] } else { 1.0 };
        for t in &y_ticks {
            let py = sy(*t);
            let _ = write!(
                out,
                "<line x1=\"{:.1}\" y1=\"{py:.1}\" x2=\"{:.1}\" y2=\"{py:.1}\" stroke=\"#333\"/>\
                 <text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"end\" font-size=\"10\" font-family=\"sans-serif\">{}</text>",
                MARGIN_LEFT - 4.0,
                MARGIN_LEFT,
                MARGIN_LEFT - 6.0,
                py + 3.5,
                tick_label(*t, y_step)
            );
        }

        let _ = write!(
            out,
            "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"middle\" font-size=\"11\" font-family=\"sans-serif\">{}</text>",
            MARGIN_LEFT + plot_w / 2.0,
            self.height - 8.0,
            escape_xml(&self.x_label)
        );
        let _ = write!(
            out,
            "<text transform=\"translate(14,{:.1}) rotate(-90)\" text-anchor=\"middle\" font-size=\"11\" font-family=\"sans-serif\">{}</text>",
            MARGIN_TOP + plot_h / 2.0,
            escape_xml(&self.y_label)
        );

        for layer in &self.layers {
            match layer {
                Layer::Band { x, lower, upper, color } => {
                    let mut path = String::new();
                    for (i, (xi, yi)) in x.iter().zip(upper.iter()).enumerate() {
                        let cmd = if i == 0 { 'M' } else { 'L' };
                        let _ = write!(path, "{}{:.2},{:.2} ", cmd, sx(*xi), sy(*yi));
                    }
                    for (xi, yi) in x.iter().zip(lower.iter()).rev() {
                        let _ = write!(path, "L{:.2},{:.2} ", sx(*xi), sy(*yi));
                    }
                    let _ = write!(
                        out,
                        "<path d=\"{}Z\" fill=\"{}\" fill-opacity=\"0.5\" stroke=\"none\"/>",
                        path, color
                    );
                }
                Layer::Line { points, color, dashed } => {
                    let coords: Vec<String> = points
                        .iter()
                        .filter(|p| p.0.is_finite() && p.1.is_finite())
                        .map(|(x, y)| format!("{:.2},{:.2}", sx(*x), sy(*y)))
                        .collect();
                    let dash = if *dashed { " stroke-dasharray=\"5,4\"" } else { "" };
                    let _ = write!(
                        out,
                        "<polyline points=\"{}\" fill=\"none\" stroke=\"{}\" stroke-width=\"1.5\"{}/>",
                        coords.join(" "),
                        color,
                        dash
                    );
                }
                Layer::Points { points, color, radius } => {
                    for (x, y) in points.iter().filter(|p| p.0.is_finite() && p.1.is_finite()) {
                        let _ = write!(
                            out,
                            "<circle cx=\"{:.2}\" cy=\"{:.2}\" r=\"{}\" fill=\"{}\" fill-opacity=\"0.7\"/>",
                            sx(*x),
                            sy(*y),
                            radius,
                            color
                        );
                    }
                }
                Layer::Bars { bars, color } => {
                    for (x, h) in bars {
                        let _ = write!(
                            out,
                            "<line x1=\"{x:.2}\" y1=\"{:.2}\" x2=\"{x:.2}\" y2=\"{:.2}\" stroke=\"{}\" stroke-width=\"2\"/>",
                            sy(0.0),
                            sy(*h),
                            color,
                            x = sx(*x)
                        );
                    }
                }
                Layer::HLine { y, color, dashed } => {
                    let dash = if *dashed { " stroke-dasharray=\"4,3\"" } else { "" };
                    let _ = write!(
                        out,
                        "<line x1=\"{:.1}\" y1=\"{py:.2}\" x2=\"{:.1}\" y2=\"{py:.2}\" stroke=\"{}\"{}/>",
                        MARGIN_LEFT,
                        MARGIN_LEFT + plot_w,
                        color,
                        dash,
                        py = sy(*y)
                    );
                }
            }
        }
        out
    }
}

fn finite_range(values: &[f64]) -> (f64, f64) {
    let (lo, hi) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if lo > hi {
        (0.0, 1.0)
    } else {
        (lo, hi)
    }
}

fn pad(lo: f64, hi: f64) -> (f64, f64) {
    if hi > lo {
        let margin = 0.04 * (hi - lo);
        (lo - margin, hi + margin)
    } else {
        (lo - 0.5, hi + 0.5)
    }
}

/// Several charts laid out row-major in one `<svg>`
#[derive(Debug, Clone)]
pub struct Grid {
    columns: usize,
    charts: Vec<Chart>,
}

impl Grid {
    pub fn new(columns: usize) -> Self {
        Self {
            columns: columns.max(1),
            charts: Vec::new(),
        }
    }

    pub fn push(mut self, chart: Chart) -> Self {
        self.charts.push(chart);
        self
    }

    pub fn len(&self) -> usize {
        self.charts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charts.is_empty()
    }

    pub fn render(&self) -> String {
        let cell_w = self.charts.iter().map(Chart::width).fold(0.0, f64::max);
        let cell_h = self.charts.iter().map(Chart::height).fold(0.0, f64::max);
        let rows = (self.charts.len() + self.columns - 1) / self.columns;
        let cols = self.columns.min(self.charts.len()).max(1);
        let width = cell_w * cols as f64;
        let height = cell_h * rows as f64;

        let mut out = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">",
            w = width,
            h = height
        );
        for (i, chart) in self.charts.iter().enumerate() {
            let x = (i % self.columns) as f64 * cell_w;
            let y = (i / self.columns) as f64 * cell_h;
            let _ = write!(
                out,
                "<g transform=\"translate({},{})\">{}</g>",
                x,
                y,
                chart.render_body()
            );
        }
        out.push_str("</svg>");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_are_nice() {
        assert_eq!(ticks(0.0, 10.0, 5), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        let t = ticks(-0.33, 0.71, 5);
        assert!(t.iter().all(|v| *v >= -0.33 && *v <= 0.71));
        assert!(t.contains(&0.0));
        assert_eq!(tick_label(0.25, 0.25), "0.25");
        assert_eq!(tick_label(12.0, 2.0), "12");
    }

    #[test]
    fn test_chart_render() {
        let chart = Chart::new("Flow <raw> & log")
            .x_label("time")
            .y_label("flow")
            .line(vec![(0.0, 1.0), (1.0, 2.0), (2.0, 1.5)], BLUE)
            .points(vec![(0.5, 1.2)], RED)
            .band(vec![0.0, 2.0], vec![0.5, 1.0], vec![1.5, 2.0], BAND)
            .hline(0.0, GREY, true);
        let svg = chart.render();
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("Flow &lt;raw&gt; &amp; log"));
        assert!(svg.contains("<polyline"));
        assert!(svg.contains("<circle"));
        assert!(svg.contains("<path"));
        assert!(svg.contains("stroke-dasharray"));
    }

    #[test]
    fn test_grid_is_one_svg() {
        let grid = Grid::new(2)
            .push(Chart::new("a").bars(vec![(1.0, 0.5), (2.0, -0.2)], BLUE))
            .push(Chart::new("b").line(vec![(0.0, 0.0), (1.0, 1.0)], GREEN))
            .push(Chart::new("c"));
        let svg = grid.render();
        assert_eq!(svg.matches("<svg").count(), 1);
        assert_eq!(svg.matches("<g transform").count(), 3);
        assert!(svg.contains("height=\"640\""));
    }
}
