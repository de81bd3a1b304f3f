use std::collections::{BTreeMap, BTreeSet};

use palette::{Hsl, IntoColor, Srgb};
use serde::Serialize;

use crate::data::filter::GroupingAttr;

/// Colour used for labels the map has never seen.
pub const FALLBACK_COLOR: &str = "#808080";

// ---------------------------------------------------------------------------
// Color palette generator
// ---------------------------------------------------------------------------

/// Generates `n` visually distinct `#rrggbb` colours using evenly spaced hues.
pub fn generate_palette(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let hue = (i as f32 / n as f32) * 360.0;
            let hsl = Hsl::new(hue, 0.75, 0.55);
            let rgb: Srgb = hsl.into_color();
            let rgb: Srgb<u8> = rgb.into_format();
            format!("#{:02x}{:02x}{:02x}", rgb.red, rgb.green, rgb.blue)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Color mapping: grouping label → hex colour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegendEntry {
    pub label: String,
    pub color: String,
}

/// Maps the distinct labels of a grouping field to distinct colours.
#[derive(Debug, Clone)]
pub struct ColorMap {
    pub field: String,
    mapping: BTreeMap<String, String>,
}

impl ColorMap {
    /// Build a colour map for the given field from its labels. Labels are
    /// deduplicated and coloured in sorted order, so the same label set always
    /// gets the same colours.
    pub fn new<'a>(field: &str, labels: impl IntoIterator<Item = &'a str>) -> Self {
        let unique: BTreeSet<&str> = labels.into_iter().collect();
        let palette = generate_palette(unique.len());
        let mapping = unique
            .into_iter()
            .zip(palette)
            .map(|(label, color)| (label.to_string(), color))
            .collect();

        ColorMap {
            field: field.to_string(),
            mapping,
        }
    }

    pub fn from_attr(attr: &GroupingAttr) -> Self {
        ColorMap::new(&attr.field, attr.labels.iter().map(String::as_str))
    }

    pub fn color_for(&self, label: &str) -> &str {
        self.mapping
            .get(label)
            .map(String::as_str)
            .unwrap_or(FALLBACK_COLOR)
    }

    /// Legend entries (label → colour) in label order.
    pub fn legend_entries(&self) -> Vec<LegendEntry> {
        self.mapping
            .iter()
            .map(|(label, color)| LegendEntry {
                label: label.clone(),
                color: color.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_colours_are_distinct_hex() {
        let palette = generate_palette(6);
        assert_eq!(palette.len(), 6);
        assert!(palette.iter().all(|c| c.len() == 7 && c.starts_with('#')));
        assert_eq!(palette.iter().collect::<BTreeSet<_>>().len(), 6);
        assert!(generate_palette(0).is_empty());
    }

    #[test]
    fn map_is_independent_of_label_order() {
        let a = ColorMap::new("cell_type", ["T", "B", "T", "Mono"]);
        let b = ColorMap::new("cell_type", ["Mono", "B", "T"]);

        assert_eq!(a.legend_entries(), b.legend_entries());
        let labels: Vec<_> = a.legend_entries().into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["B", "Mono", "T"]);
        assert_ne!(a.color_for("B"), a.color_for("T"));
        assert_eq!(a.color_for("NK"), FALLBACK_COLOR);
    }

    #[test]
    fn built_from_grouping_attr() {
        let attr = GroupingAttr {
            field: "sample".to_string(),
            labels: vec!["S1".to_string(), "S2".to_string(), "S1".to_string()],
        };
        let map = ColorMap::from_attr(&attr);
        assert_eq!(map.field, "sample");
        assert_eq!(map.legend_entries().len(), 2);
    }
}
