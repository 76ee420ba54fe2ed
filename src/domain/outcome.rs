//! Terminal classifications for work items.
//!
//! Every admitted reference that is processed before the deadline lands in
//! exactly one of four buckets: opened, font swap, missing, or unopened.

use serde::{Deserialize, Serialize};

/// A completed render as reported by the render host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Where the host stored the rendered preview
    pub thumbnail_ref: String,
    pub width: u32,
    pub height: u32,
    /// Text extracted from the design's layers
    #[serde(default)]
    pub extracted_text: String,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub source_template_id: Option<String>,
    /// The render's alpha channel disagreed with the reference's `RenderHint`.
    /// Internal signal: it feeds the mismatch log and is never shown to callers.
    #[serde(default)]
    pub transparency_mismatch: bool,
}

/// What `open_and_render` produced when it did not raise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RenderReply {
    /// The design rendered
    Rendered(RenderResult),
    /// The design uses fonts the host cannot substitute on its own
    FontSwap { fonts: Vec<String> },
}

/// A design that opened and rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedDesign {
    pub reference: String,
    #[serde(flatten)]
    pub render: RenderResult,
}

/// A design that needs fonts swapped before it can render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FontSwapDesign {
    pub reference: String,
    pub fonts_to_swap: Vec<String>,
}

/// A design that could not be fetched or could not be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDesign {
    pub reference: String,
    pub error: String,
}

/// Terminal outcome of one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Opened(RenderedDesign),
    FontSwap(FontSwapDesign),
    /// Fetch failed on every attempt
    Missing(FailedDesign),
    /// Fetched, but the host raised while rendering
    Unopened(FailedDesign),
}

impl Outcome {
    /// Label used for metrics and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Opened(_) => "opened",
            Outcome::FontSwap(_) => "font_swap",
            Outcome::Missing(_) => "missing",
            Outcome::Unopened(_) => "unopened",
        }
    }
}

/// The four outcome buckets of one shard (or of a merged batch).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardOutcomes {
    pub opened: Vec<RenderedDesign>,
    pub font_swap: Vec<FontSwapDesign>,
    pub missing: Vec<FailedDesign>,
    pub unopened: Vec<FailedDesign>,
}

impl ShardOutcomes {
    /// Fold one outcome into its bucket.
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Opened(d) => self.opened.push(d),
            Outcome::FontSwap(d) => self.font_swap.push(d),
            Outcome::Missing(d) => self.missing.push(d),
            Outcome::Unopened(d) => self.unopened.push(d),
        }
    }

    /// Append another shard's buckets after this one's.
    pub fn append(&mut self, other: ShardOutcomes) {
        self.opened.extend(other.opened);
        self.font_swap.extend(other.font_swap);
        self.missing.extend(other.missing);
        self.unopened.extend(other.unopened);
    }

    /// Total number of settled items across all buckets.
    pub fn len(&self) -> usize {
        self.opened.len() + self.font_swap.len() + self.missing.len() + self.unopened.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
