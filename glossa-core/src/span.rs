//! Half-open character spans `[start, end)` and the interval math used by
//! the transform engine and the conflict detector.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Span construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpanError {
    #[error("span start {start} must be less than end {end}")]
    Inverted { start: u64, end: u64 },
}

/// A half-open character range `[start, end)` over the annotated document.
///
/// Invariant: `start < end`, enforced at construction and at
/// deserialization, so spans arriving over the wire are checked too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSpan")]
pub struct Span {
    start: u64,
    end: u64,
}

#[derive(Deserialize)]
struct RawSpan {
    start: u64,
    end: u64,
}

impl TryFrom<RawSpan> for Span {
    type Error = SpanError;

    fn try_from(raw: RawSpan) -> Result<Self, Self::Error> {
        Span::new(raw.start, raw.end)
    }
}

impl Span {
    /// Create a span, rejecting inverted or empty ranges.
    pub fn new(start: u64, end: u64) -> Result<Self, SpanError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(SpanError::Inverted { start, end })
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of characters covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        false // by construction: start < end
    }

    /// Whether `pos` falls inside the span.
    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.end
    }

    /// Whether the two spans share at least one character.
    pub fn intersects(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The shared region, if any.
    pub fn intersection(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        Span::new(start, end).ok()
    }

    /// The smallest span covering both inputs.
    pub fn union(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Overlap ratio relative to the shorter of the two spans.
    ///
    /// Returns 0.0 for disjoint spans, 1.0 when the shorter span is fully
    /// contained in the longer one.
    pub fn overlap_ratio(&self, other: &Span) -> f64 {
        match self.intersection(other) {
            Some(shared) => {
                let shorter = self.len().min(other.len());
                shared.len() as f64 / shorter as f64
            }
            None => 0.0,
        }
    }

    /// Whether both boundaries of the two spans differ by strictly less
    /// than `tolerance` characters.
    pub fn within_tolerance(&self, other: &Span, tolerance: u64) -> bool {
        self.start.abs_diff(other.start) < tolerance && self.end.abs_diff(other.end) < tolerance
    }

    /// Midpoint of the shared region, used for boundary-adjustment splits.
    pub fn overlap_midpoint(&self, other: &Span) -> Option<u64> {
        self.intersection(other)
            .map(|shared| shared.start + shared.len() / 2)
    }

    /// Remap through an insertion of `len` characters at `at`.
    ///
    /// Insertions at or before the start shift the whole span; insertions
    /// strictly inside grow it; insertions at or past the end leave it alone.
    pub fn map_insert(&self, at: u64, len: u64) -> Span {
        if at <= self.start {
            Span {
                start: self.start + len,
                end: self.end + len,
            }
        } else if at < self.end {
            Span {
                start: self.start,
                end: self.end + len,
            }
        } else {
            *self
        }
    }

    /// Remap through a deletion of `deleted`.
    ///
    /// Returns `None` when the span is fully swallowed by the deletion.
    pub fn map_delete(&self, deleted: &Span) -> Option<Span> {
        let start = map_pos_delete(self.start, deleted);
        let end = map_pos_delete(self.end, deleted);
        Span::new(start, end).ok()
    }

    /// Remap through a deletion, collapsing a fully swallowed span to a
    /// one-character remnant at the deletion point.
    ///
    /// Annotation spans use this (rather than vanishing) so that concurrent
    /// operations on the same annotation converge regardless of order.
    pub fn map_delete_clamped(&self, deleted: &Span) -> Span {
        let start = map_pos_delete(self.start, deleted);
        let end = map_pos_delete(self.end, deleted);
        Span::new(start, end).unwrap_or(Span {
            start,
            end: start + 1,
        })
    }
}

/// Map a single position through a deletion: positions past the deleted
/// range shift left, positions inside collapse onto its start.
pub(crate) fn map_pos_delete(pos: u64, deleted: &Span) -> u64 {
    if pos <= deleted.start() {
        pos
    } else if pos >= deleted.end() {
        pos - deleted.len()
    } else {
        deleted.start()
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: u64, end: u64) -> Span {
        Span::new(start, end).unwrap()
    }

    #[test]
    fn test_rejects_inverted_and_empty() {
        assert!(Span::new(5, 5).is_err());
        assert!(Span::new(10, 3).is_err());
        assert!(Span::new(0, 1).is_ok());
    }

    #[test]
    fn test_intersection_and_union() {
        let a = span(10, 20);
        let b = span(15, 25);
        assert_eq!(a.intersection(&b), Some(span(15, 20)));
        assert_eq!(a.union(&b), span(10, 25));

        let c = span(30, 40);
        assert!(a.intersection(&c).is_none());
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_adjacent_spans_do_not_intersect() {
        let a = span(0, 10);
        let b = span(10, 20);
        assert!(!a.intersects(&b));
        assert_eq!(a.overlap_ratio(&b), 0.0);
    }

    #[test]
    fn test_overlap_ratio_uses_shorter_span() {
        // [10,20) vs [15,25): 5 shared chars over a 10-char shorter span
        let a = span(10, 20);
        let b = span(15, 25);
        assert!((a.overlap_ratio(&b) - 0.5).abs() < f64::EPSILON);

        // Containment: shorter span fully covered
        let outer = span(0, 100);
        let inner = span(40, 50);
        assert!((outer.overlap_ratio(&inner) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_within_tolerance() {
        let a = span(100, 200);
        assert!(a.within_tolerance(&span(103, 198), 5));
        assert!(!a.within_tolerance(&span(106, 200), 5));
        assert!(!a.within_tolerance(&span(100, 206), 5));
        // A boundary shifted by exactly the tolerance is no longer "near"
        assert!(!a.within_tolerance(&span(105, 200), 5));
    }

    #[test]
    fn test_overlap_midpoint() {
        let a = span(10, 20);
        let b = span(15, 25);
        // Shared region [15,20), midpoint 17
        assert_eq!(a.overlap_midpoint(&b), Some(17));
        assert_eq!(a.overlap_midpoint(&span(50, 60)), None);
    }

    #[test]
    fn test_map_insert_before_inside_after() {
        let a = span(10, 20);
        assert_eq!(a.map_insert(5, 3), span(13, 23));
        assert_eq!(a.map_insert(10, 3), span(13, 23));
        assert_eq!(a.map_insert(15, 3), span(10, 23));
        assert_eq!(a.map_insert(20, 3), span(10, 20));
        assert_eq!(a.map_insert(25, 3), span(10, 20));
    }

    #[test]
    fn test_map_delete_shifts_and_truncates() {
        let a = span(10, 20);
        // Deletion entirely before: shift left
        assert_eq!(a.map_delete(&span(0, 5)), Some(span(5, 15)));
        // Deletion entirely after: unchanged
        assert_eq!(a.map_delete(&span(25, 30)), Some(span(10, 20)));
        // Deletion overlapping the head
        assert_eq!(a.map_delete(&span(5, 15)), Some(span(5, 10)));
        // Deletion overlapping the tail
        assert_eq!(a.map_delete(&span(15, 25)), Some(span(10, 15)));
        // Deletion strictly inside: span shrinks
        assert_eq!(a.map_delete(&span(12, 18)), Some(span(10, 14)));
    }

    #[test]
    fn test_map_delete_swallowed() {
        let a = span(10, 20);
        assert_eq!(a.map_delete(&span(5, 25)), None);
        assert_eq!(a.map_delete(&span(10, 20)), None);
    }

    #[test]
    fn test_deserialization_enforces_invariant() {
        let valid: Span = serde_json::from_str(r#"{"start":10,"end":20}"#).unwrap();
        assert_eq!(valid, span(10, 20));

        assert!(serde_json::from_str::<Span>(r#"{"start":20,"end":10}"#).is_err());
        assert!(serde_json::from_str::<Span>(r#"{"start":5,"end":5}"#).is_err());
    }

    #[test]
    fn test_map_delete_clamped_leaves_remnant() {
        let a = span(10, 20);
        assert_eq!(a.map_delete_clamped(&span(5, 25)), span(5, 6));
        assert_eq!(a.map_delete_clamped(&span(10, 20)), span(10, 11));
        // Partial overlap behaves like the plain mapping
        assert_eq!(a.map_delete_clamped(&span(15, 25)), span(10, 15));
    }
}
