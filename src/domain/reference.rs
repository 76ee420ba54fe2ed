//! Design references and their normalization.
//!
//! Callers submit either design-payload references (`foo.bfd`) or the names of
//! previously rendered thumbnails (`foo.bfd_thumb.png`). Thumbnail names are
//! rewritten to the design they were rendered from, and the thumbnail's format
//! becomes a [`RenderHint`]: a `.png` thumbnail implies the design was expected
//! to render with transparency, a `.jpg` one that it was not.

use serde::{Deserialize, Serialize};

/// Hint attached to a reference that was derived from a thumbnail name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderHint {
    /// Whether the previous render of this design carried an alpha channel.
    pub expected_transparency: bool,
}

/// A normalized design-payload reference.
///
/// Immutable once created; uniqueness is enforced by the admission gate on
/// [`Reference::id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Normalized identifier of the design payload (URL-like).
    pub id: String,
    /// Present when the reference was rewritten from a thumbnail name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<RenderHint>,
}

impl Reference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hint: None,
        }
    }

    pub fn with_hint(id: impl Into<String>, hint: RenderHint) -> Self {
        Self {
            id: id.into(),
            hint: Some(hint),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Rewrites raw submitted strings into [`Reference`]s.
#[derive(Debug, Clone)]
pub struct ReferenceNormalizer {
    /// `.bfd`
    design_suffix: String,
    /// `(".bfd_thumb.jpg", false)`, `(".bfd_thumb.png", true)`
    thumbnail_suffixes: [(String, bool); 2],
}

impl ReferenceNormalizer {
    /// Build a normalizer for designs with `design_extension` whose thumbnails
    /// are named `<design><thumbnail_marker>.<jpg|png>`.
    pub fn new(design_extension: &str, thumbnail_marker: &str) -> Self {
        let extension = design_extension.trim_start_matches('.').to_ascii_lowercase();
        let marker = thumbnail_marker.to_ascii_lowercase();
        let design_suffix = format!(".{extension}");
        let thumbnail_suffixes = [
            (format!("{design_suffix}{marker}.jpg"), false),
            (format!("{design_suffix}{marker}.png"), true),
        ];
        Self {
            design_suffix,
            thumbnail_suffixes,
        }
    }

    /// Normalize one raw reference.
    ///
    /// Returns `None` for entries that are neither a design payload nor a
    /// recognised thumbnail name. Such entries are dropped silently by the
    /// admission gate, they are not an error.
    pub fn normalize(&self, raw: &str) -> Option<Reference> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        // ASCII lowercasing keeps byte offsets aligned with `raw`.
        let lower = raw.to_ascii_lowercase();

        if lower.ends_with(&self.design_suffix) && raw.len() > self.design_suffix.len() {
            return Some(Reference::new(raw));
        }

        for (suffix, transparent) in &self.thumbnail_suffixes {
            if lower.ends_with(suffix.as_str()) && raw.len() > suffix.len() {
                let design_end = raw.len() - suffix.len() + self.design_suffix.len();
                return Some(Reference::with_hint(
                    &raw[..design_end],
                    RenderHint {
                        expected_transparency: *transparent,
                    },
                ));
            }
        }

        None
    }
}

impl Default for ReferenceNormalizer {
    fn default() -> Self {
        Self::new("bfd", "_thumb")
    }
}
