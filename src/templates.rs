//! Built-in deck templates.
//!
//! The catalog is fixed at compile time. Some entries are deliberately
//! stylised with low text contrast; [`TemplateRegistry::readable`] filters
//! those out using the WCAG 2.x contrast ratio (≥ 4.5, the AA threshold for
//! body text).

use rand::seq::SliceRandom;
use rand::Rng;

use crate::models::Template;

/// WCAG AA minimum contrast for normal text.
pub const MIN_READABLE_CONTRAST: f64 = 4.5;

const fn template(
    name: &'static str,
    theme: &'static str,
    background_color: &'static str,
    text_color: &'static str,
    accent_color: &'static str,
    heading_font: &'static str,
    body_font: &'static str,
) -> Template {
    Template {
        name,
        theme,
        background_color,
        text_color,
        accent_color,
        heading_font,
        body_font,
    }
}

static CATALOG: [Template; 12] = [
    template("classic", "default", "#ffffff", "#222222", "#0055aa", "Georgia, serif", "Helvetica, Arial, sans-serif"),
    template("midnight", "default", "#0f172a", "#e2e8f0", "#38bdf8", "Inter, sans-serif", "Inter, sans-serif"),
    template("paper", "default", "#fdf6e3", "#3b3b3b", "#b58900", "Palatino, serif", "Georgia, serif"),
    template("forest", "gaia", "#1b3a2b", "#f1f5ef", "#9ccc65", "Merriweather, serif", "Source Sans Pro, sans-serif"),
    template("corporate", "default", "#f8fafc", "#1e293b", "#2563eb", "Helvetica Neue, sans-serif", "Helvetica Neue, sans-serif"),
    template("terminal", "uncover", "#000000", "#33ff66", "#ffcc00", "Fira Code, monospace", "Fira Code, monospace"),
    template("academic", "default", "#ffffff", "#111827", "#7c2d12", "Times New Roman, serif", "Times New Roman, serif"),
    template("ocean", "gaia", "#023e8a", "#caf0f8", "#90e0ef", "Montserrat, sans-serif", "Open Sans, sans-serif"),
    template("sunset", "gaia", "#ff7e5f", "#feb47b", "#ffffff", "Poppins, sans-serif", "Poppins, sans-serif"),
    template("pastel", "uncover", "#fce4ec", "#f8bbd0", "#ce93d8", "Quicksand, sans-serif", "Quicksand, sans-serif"),
    template("fog", "uncover", "#9e9e9e", "#bdbdbd", "#eeeeee", "Lato, sans-serif", "Lato, sans-serif"),
    template("slate", "default", "#334155", "#f1f5f9", "#fbbf24", "Roboto Slab, serif", "Roboto, sans-serif"),
];

/// Read-only view over the template catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRegistry {
    templates: &'static [Template],
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        Self {
            templates: &CATALOG,
        }
    }

    pub fn all(&self) -> &'static [Template] {
        self.templates
    }

    /// Templates whose text/background contrast is at least 4.5:1.
    pub fn readable(&self) -> Vec<&'static Template> {
        self.templates.iter().filter(|t| is_readable(t)).collect()
    }

    pub fn find(&self, name: &str) -> Option<&'static Template> {
        self.templates
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// `count` distinct templates in random order. Asking for more than the
    /// catalog holds returns every template once.
    pub fn random_sample(&self, count: usize) -> Vec<&'static Template> {
        self.random_sample_with(count, &mut rand::thread_rng())
    }

    pub fn random_sample_with<R: Rng + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
    ) -> Vec<&'static Template> {
        let n = count.min(self.templates.len());
        self.templates.choose_multiple(rng, n).collect()
    }
}

pub fn is_readable(template: &Template) -> bool {
    match (
        parse_hex_color(template.text_color),
        parse_hex_color(template.background_color),
    ) {
        (Some(fg), Some(bg)) => contrast_ratio(fg, bg) >= MIN_READABLE_CONTRAST,
        _ => false,
    }
}

// ============ Colour math ============

/// Parse `#rgb` or `#rrggbb` (leading `#` optional).
pub fn parse_hex_color(s: &str) -> Option<[u8; 3]> {
    let hex = s.trim().trim_start_matches('#');
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    match hex.len() {
        3 => {
            let mut rgb = [0u8; 3];
            for (i, c) in hex.chars().enumerate() {
                let v = c.to_digit(16)? as u8;
                rgb[i] = v * 17;
            }
            Some(rgb)
        }
        6 => {
            let bytes = hex::decode(hex).ok()?;
            Some([bytes[0], bytes[1], bytes[2]])
        }
        _ => None,
    }
}

fn linearize(channel: u8) -> f64 {
    let c = channel as f64 / 255.0;
    if c <= 0.03928 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// WCAG relative luminance in `[0, 1]`.
pub fn relative_luminance(rgb: [u8; 3]) -> f64 {
    0.2126 * linearize(rgb[0]) + 0.7152 * linearize(rgb[1]) + 0.0722 * linearize(rgb[2])
}

/// WCAG contrast ratio in `[1, 21]`, symmetric in its arguments.
pub fn contrast_ratio(a: [u8; 3], b: [u8; 3]) -> f64 {
    let la = relative_luminance(a);
    let lb = relative_luminance(b);
    let (hi, lo) = if la >= lb { (la, lb) } else { (lb, la) };
    (hi + 0.05) / (lo + 0.05)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ffffff"), Some([255, 255, 255]));
        assert_eq!(parse_hex_color("#0f0"), Some([0, 255, 0]));
        assert_eq!(parse_hex_color("0055aa"), Some([0, 0x55, 0xaa]));
        assert_eq!(parse_hex_color("#ggg"), None);
        assert_eq!(parse_hex_color("#ffff"), None);
    }

    #[test]
    fn test_black_on_white_is_21() {
        let r = contrast_ratio([0, 0, 0], [255, 255, 255]);
        assert!((r - 21.0).abs() < 1e-9);
        assert!((contrast_ratio([255, 255, 255], [0, 0, 0]) - r).abs() < 1e-12);
        assert!((contrast_ratio([10, 20, 30], [10, 20, 30]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_readable_filter() {
        let reg = TemplateRegistry::builtin();
        let readable = reg.readable();
        assert!(!readable.is_empty());
        assert!(readable.len() < reg.all().len());
        for t in &readable {
            let fg = parse_hex_color(t.text_color).unwrap();
            let bg = parse_hex_color(t.background_color).unwrap();
            assert!(contrast_ratio(fg, bg) >= 4.5, "{} not readable", t.name);
        }
        let names: Vec<_> = readable.iter().map(|t| t.name).collect();
        assert!(names.contains(&"classic"));
        assert!(!names.contains(&"fog"));
        assert!(!names.contains(&"pastel"));
    }

    #[test]
    fn test_catalog_names_unique_and_colors_parse() {
        let reg = TemplateRegistry::builtin();
        let names: HashSet<_> = reg.all().iter().map(|t| t.name).collect();
        assert_eq!(names.len(), reg.all().len());
        for t in reg.all() {
            assert!(parse_hex_color(t.background_color).is_some());
            assert!(parse_hex_color(t.text_color).is_some());
            assert!(parse_hex_color(t.accent_color).is_some());
        }
    }

    #[test]
    fn test_random_sample_distinct() {
        let reg = TemplateRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(7);
        let sample = reg.random_sample_with(5, &mut rng);
        assert_eq!(sample.len(), 5);
        let names: HashSet<_> = sample.iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_random_sample_bounds() {
        let reg = TemplateRegistry::builtin();
        assert!(reg.random_sample(0).is_empty());
        let all = reg.random_sample(100);
        assert_eq!(all.len(), reg.all().len());
        let names: HashSet<_> = all.iter().map(|t| t.name).collect();
        assert_eq!(names.len(), reg.all().len());
    }

    #[test]
    fn test_find_case_insensitive() {
        let reg = TemplateRegistry::builtin();
        assert_eq!(reg.find("Midnight").unwrap().name, "midnight");
        assert!(reg.find("nope").is_none());
    }
}
