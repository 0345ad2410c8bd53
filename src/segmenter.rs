//! Splits the free-form text returned by the generation backend into the
//! three fields the tool returns: the written solution, the C simulator and
//! the Manim visualization script.

/// Marks the start of the C simulator program.
pub const C_CODE_MARKER: &str = "### C Code ###";
/// Marks the start of the Manim scene script.
pub const MANIM_CODE_MARKER: &str = "### Manim Code ###";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segments {
    pub solution: String,
    pub c_code: String,
    pub manim_code: String,
}

/// Strategy for turning raw model text into [`Segments`].
///
/// Implementations must be total: any input yields three strings.
pub trait Segmenter: Send + Sync {
    fn segment(&self, text: &str) -> Segments;
}

/// Marker-based segmentation. Only the first occurrence of each marker is a
/// delimiter, and the C marker is expected before the Manim marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerSegmenter;

impl Segmenter for MarkerSegmenter {
    fn segment(&self, text: &str) -> Segments {
        segment(text)
    }
}

pub fn segment(text: &str) -> Segments {
    if let Some((before, after)) = text.split_once(C_CODE_MARKER) {
        let (c_code, manim_code) = match after.split_once(MANIM_CODE_MARKER) {
            Some((c_part, manim_part)) => (c_part.trim(), manim_part.trim()),
            None => (after.trim(), ""),
        };
        return Segments {
            solution: before.trim().to_string(),
            c_code: c_code.to_string(),
            manim_code: manim_code.to_string(),
        };
    }

    if let Some((before, after)) = text.split_once(MANIM_CODE_MARKER) {
        return Segments {
            solution: before.trim().to_string(),
            c_code: String::new(),
            manim_code: after.trim().to_string(),
        };
    }

    Segments {
        solution: text.trim().to_string(),
        c_code: String::new(),
        manim_code: String::new(),
    }
}
