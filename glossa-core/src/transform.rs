//! Operational transform for concurrent span operations.
//!
//! `transform(a, &b)` rewrites `a` under the assumption that `b` has already
//! been applied, so that both arrival orders converge:
//!
//! ```text
//!        S ── a ──► Sa ── transform(b, a) ──► S'
//!        S ── b ──► Sb ── transform(a, b) ──► S'   (same S')
//! ```
//!
//! Rules:
//! - Text inserts and deletes shift positions with the usual inclusion
//!   transforms. Two inserts at the identical offset are ordered by
//!   `(issued_at_ms, author)` ascending — deterministic and total.
//! - An insert landing strictly inside a concurrent deletion is absorbed by
//!   it: the delete grows to cover the inserted text and the insert itself
//!   becomes a no-op. A single-span delete cannot be split around surviving
//!   text, so absorption is the one symmetric choice.
//! - Concurrent moves of the same annotation resolve last-writer-wins in the
//!   tie-break order; the earlier move is dropped.
//! - A move's destination span is remapped through concurrent text edits,
//!   collapsing to the deletion-point remnant when fully swallowed.
//! - Relabel passes through untransformed; staleness is the version check's
//!   job.
//!
//! `None` means the operation was fully absorbed and must be skipped.

use crate::op::{OpKind, Operation};
use crate::span::{map_pos_delete, Span};

/// Transform `a` against an already-applied concurrent `b`.
pub fn transform(a: Operation, b: &Operation) -> Option<Operation> {
    let kind = match (a.kind.clone(), &b.kind) {
        // ── insert vs insert ─────────────────────────────────────────
        (OpKind::InsertText { at, len }, OpKind::InsertText { at: b_at, len: b_len }) => {
            let shifted = *b_at < at || (*b_at == at && b.precedes(&a));
            Some(OpKind::InsertText {
                at: if shifted { at + b_len } else { at },
                len,
            })
        }

        // ── insert vs delete ─────────────────────────────────────────
        (OpKind::InsertText { at, len }, OpKind::DeleteText { span: d }) => {
            if at <= d.start() {
                Some(OpKind::InsertText { at, len })
            } else if at > d.end() {
                Some(OpKind::InsertText { at: at - d.len(), len })
            } else {
                // Inside the deleted range (its end offset included, which
                // would otherwise land exactly on the deletion-point
                // remnant): absorbed.
                None
            }
        }

        // ── delete vs insert ─────────────────────────────────────────
        (OpKind::DeleteText { span: s }, OpKind::InsertText { at, len }) => {
            let kind = if *at <= s.start() {
                OpKind::DeleteText {
                    span: shift_right(&s, *len),
                }
            } else if *at > s.end() {
                OpKind::DeleteText { span: s }
            } else {
                // Insert landed inside the range being deleted: the delete
                // grows to cover it (pairs with the absorption rule above).
                OpKind::DeleteText {
                    span: extend_by(&s, *len),
                }
            };
            Some(kind)
        }

        // ── delete vs delete ─────────────────────────────────────────
        (OpKind::DeleteText { span: s }, OpKind::DeleteText { span: d }) => {
            let start = map_pos_delete(s.start(), d);
            let end = map_pos_delete(s.end(), d);
            Span::new(start, end).ok().map(|span| OpKind::DeleteText { span })
        }

        // ── move vs text edits ───────────────────────────────────────
        (OpKind::MoveSpan { target, span }, OpKind::InsertText { at, len }) => {
            Some(OpKind::MoveSpan {
                target,
                span: span.map_insert(*at, *len),
            })
        }
        (OpKind::MoveSpan { target, span }, OpKind::DeleteText { span: d }) => {
            // A swallowed destination collapses to the deletion-point
            // remnant, mirroring what the deletion does to annotation spans.
            Some(OpKind::MoveSpan {
                target,
                span: span.map_delete_clamped(d),
            })
        }

        // ── move vs move ─────────────────────────────────────────────
        (OpKind::MoveSpan { target, span }, OpKind::MoveSpan { target: b_target, .. }) => {
            if target == *b_target && a.order_key() < b.order_key() {
                // The later writer has already applied; drop the earlier move.
                None
            } else {
                Some(OpKind::MoveSpan { target, span })
            }
        }

        // ── relabel: pure overwrite, never transformed ───────────────
        (kind @ OpKind::Relabel { .. }, _) => Some(kind),
        (kind, OpKind::Relabel { .. }) => Some(kind),
        (kind, OpKind::MoveSpan { .. }) => Some(kind),
    };

    kind.map(|kind| Operation { kind, ..a })
}

fn shift_right(span: &Span, by: u64) -> Span {
    // Safe: shifting a valid span right keeps start < end.
    Span::new(span.start() + by, span.end() + by).unwrap_or(*span)
}

fn extend_by(span: &Span, by: u64) -> Span {
    Span::new(span.start(), span.end() + by).unwrap_or(*span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{Annotation, AnnotationSet, AnnotationStatus};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn span(start: u64, end: u64) -> Span {
        Span::new(start, end).unwrap()
    }

    fn op(author: u128, ts: u64, kind: OpKind) -> Operation {
        Operation::new(Uuid::from_u128(author), ts, kind)
    }

    fn seed_set(spans: &[(u128, u64, u64)]) -> AnnotationSet {
        let mut set = AnnotationSet::new();
        for (id, start, end) in spans {
            set.insert(Annotation {
                id: Uuid::from_u128(*id),
                span: span(*start, *end),
                labels: BTreeSet::from(["PERSON".to_string()]),
                author: Uuid::from_u128(7),
                version: 1,
                status: AnnotationStatus::Active,
                modified_at_ms: 0,
            });
        }
        set
    }

    /// Apply `[first, transform(second, first)]` to a copy of `set`.
    fn converge(set: &AnnotationSet, first: &Operation, second: &Operation) -> AnnotationSet {
        let mut out = set.clone();
        out.apply(first);
        if let Some(adjusted) = transform(second.clone(), first) {
            out.apply(&adjusted);
        }
        out
    }

    fn assert_converges(set: &AnnotationSet, a: &Operation, b: &Operation) {
        let ab = converge(set, a, b);
        let ba = converge(set, b, a);
        assert_eq!(
            ab.fingerprint(),
            ba.fingerprint(),
            "divergence for a={a:?} b={b:?}"
        );
    }

    #[test]
    fn test_insert_insert_identical_offset_tiebreak() {
        let a = op(1, 100, OpKind::InsertText { at: 10, len: 3 });
        let b = op(2, 100, OpKind::InsertText { at: 10, len: 5 });

        // a orders first (same timestamp, smaller author id): a stays put,
        // b shifts past a's insertion.
        let a2 = transform(a.clone(), &b).unwrap();
        assert_eq!(a2.kind, OpKind::InsertText { at: 10, len: 3 });

        let b2 = transform(b.clone(), &a).unwrap();
        assert_eq!(b2.kind, OpKind::InsertText { at: 13, len: 5 });
    }

    #[test]
    fn test_insert_shifts_after_earlier_insert() {
        let a = op(1, 200, OpKind::InsertText { at: 30, len: 4 });
        let b = op(2, 100, OpKind::InsertText { at: 10, len: 6 });
        let a2 = transform(a, &b).unwrap();
        assert_eq!(a2.kind, OpKind::InsertText { at: 36, len: 4 });
    }

    #[test]
    fn test_insert_inside_delete_is_absorbed() {
        let ins = op(1, 100, OpKind::InsertText { at: 12, len: 4 });
        let del = op(2, 100, OpKind::DeleteText { span: span(10, 20) });

        assert!(transform(ins.clone(), &del).is_none());

        let del2 = transform(del, &ins).unwrap();
        assert_eq!(del2.kind, OpKind::DeleteText { span: span(10, 24) });
    }

    #[test]
    fn test_delete_delete_overlap_shrinks() {
        let a = op(1, 100, OpKind::DeleteText { span: span(10, 30) });
        let b = op(2, 100, OpKind::DeleteText { span: span(20, 40) });

        let a2 = transform(a.clone(), &b).unwrap();
        assert_eq!(a2.kind, OpKind::DeleteText { span: span(10, 20) });

        let b2 = transform(b, &a).unwrap();
        assert_eq!(b2.kind, OpKind::DeleteText { span: span(10, 20) });
    }

    #[test]
    fn test_delete_fully_shadowed_is_absorbed() {
        let a = op(1, 100, OpKind::DeleteText { span: span(12, 18) });
        let b = op(2, 100, OpKind::DeleteText { span: span(10, 20) });
        assert!(transform(a, &b).is_none());
    }

    #[test]
    fn test_move_move_same_target_last_writer_wins() {
        let target = Uuid::from_u128(42);
        let earlier = op(1, 100, OpKind::MoveSpan { target, span: span(0, 5) });
        let later = op(2, 200, OpKind::MoveSpan { target, span: span(50, 55) });

        assert!(transform(earlier.clone(), &later).is_none());
        let kept = transform(later.clone(), &earlier).unwrap();
        assert_eq!(kept.kind, later.kind);
    }

    #[test]
    fn test_move_remapped_through_text_edit() {
        let target = Uuid::from_u128(42);
        let mv = op(1, 100, OpKind::MoveSpan { target, span: span(30, 40) });
        let ins = op(2, 100, OpKind::InsertText { at: 10, len: 5 });

        let mv2 = transform(mv, &ins).unwrap();
        assert_eq!(
            mv2.kind,
            OpKind::MoveSpan { target, span: span(35, 45) }
        );
    }

    #[test]
    fn test_relabel_passes_through() {
        let target = Uuid::from_u128(42);
        let relabel = op(
            1,
            100,
            OpKind::Relabel {
                target,
                labels: BTreeSet::from(["ORG".to_string()]),
            },
        );
        let del = op(2, 100, OpKind::DeleteText { span: span(0, 100) });
        let out = transform(relabel.clone(), &del).unwrap();
        assert_eq!(out.kind, relabel.kind);
    }

    // ── convergence scenarios over an annotation arena ───────────────

    #[test]
    fn test_convergence_insert_vs_delete_overlapping() {
        let set = seed_set(&[(1, 10, 20), (2, 40, 60)]);
        let a = op(1, 100, OpKind::InsertText { at: 15, len: 7 });
        let b = op(2, 100, OpKind::DeleteText { span: span(12, 45) });
        assert_converges(&set, &a, &b);
    }

    #[test]
    fn test_convergence_delete_vs_delete() {
        let set = seed_set(&[(1, 5, 25), (2, 30, 50), (3, 60, 90)]);
        let a = op(1, 100, OpKind::DeleteText { span: span(10, 40) });
        let b = op(2, 100, OpKind::DeleteText { span: span(20, 70) });
        assert_converges(&set, &a, &b);
    }

    #[test]
    fn test_convergence_move_vs_swallowing_delete() {
        let set = seed_set(&[(1, 10, 20)]);
        let mv = op(
            1,
            100,
            OpKind::MoveSpan {
                target: Uuid::from_u128(1),
                span: span(100, 110),
            },
        );
        let del = op(2, 100, OpKind::DeleteText { span: span(5, 25) });
        assert_converges(&set, &mv, &del);
    }

    #[test]
    fn test_convergence_move_vs_move() {
        let set = seed_set(&[(1, 10, 20)]);
        let m1 = op(
            1,
            100,
            OpKind::MoveSpan {
                target: Uuid::from_u128(1),
                span: span(30, 40),
            },
        );
        let m2 = op(
            2,
            150,
            OpKind::MoveSpan {
                target: Uuid::from_u128(1),
                span: span(70, 80),
            },
        );
        let ab = converge(&set, &m1, &m2);
        let ba = converge(&set, &m2, &m1);
        assert_eq!(ab.fingerprint(), ba.fingerprint());
        // The later writer's span is the one that sticks.
        assert_eq!(ab.get(&Uuid::from_u128(1)).unwrap().span, span(70, 80));
    }

    #[test]
    fn test_convergence_identical_offset_inserts() {
        let set = seed_set(&[(1, 10, 20), (2, 10, 30)]);
        let a = op(1, 100, OpKind::InsertText { at: 10, len: 3 });
        let b = op(2, 100, OpKind::InsertText { at: 10, len: 5 });
        assert_converges(&set, &a, &b);
    }
}

#[cfg(test)]
mod convergence_property {
    //! Randomized convergence check: any concurrent pair of transformable
    //! operations must commute after transformation.

    use super::*;
    use crate::annotation::{Annotation, AnnotationSet, AnnotationStatus};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn arb_span() -> impl Strategy<Value = Span> {
        (0u64..150, 1u64..40).prop_map(|(start, len)| Span::new(start, start + len).unwrap())
    }

    fn arb_kind() -> impl Strategy<Value = OpKind> {
        prop_oneof![
            (0u64..150, 1u64..20).prop_map(|(at, len)| OpKind::InsertText { at, len }),
            arb_span().prop_map(|span| OpKind::DeleteText { span }),
            (1u128..4, arb_span()).prop_map(|(target, span)| OpKind::MoveSpan {
                target: Uuid::from_u128(target),
                span,
            }),
        ]
    }

    fn arb_op() -> impl Strategy<Value = Operation> {
        (1u128..6, 0u64..1000, arb_kind())
            .prop_map(|(author, ts, kind)| Operation::new(Uuid::from_u128(author), ts, kind))
    }

    fn arb_set() -> impl Strategy<Value = AnnotationSet> {
        proptest::collection::vec(arb_span(), 1..4).prop_map(|spans| {
            let mut set = AnnotationSet::new();
            for (i, span) in spans.into_iter().enumerate() {
                set.insert(Annotation {
                    id: Uuid::from_u128(i as u128 + 1),
                    span,
                    labels: BTreeSet::from(["PERSON".to_string()]),
                    author: Uuid::from_u128(50),
                    version: 1,
                    status: AnnotationStatus::Active,
                    modified_at_ms: 0,
                });
            }
            set
        })
    }

    proptest! {
        #[test]
        fn prop_transform_converges(set in arb_set(), a in arb_op(), b in arb_op()) {
            // The coordinator stamps per-author timestamps strictly
            // monotonically, so concurrent ops never share an order key.
            prop_assume!(a.order_key() != b.order_key());

            let mut ab = set.clone();
            ab.apply(&a);
            if let Some(adjusted) = transform(b.clone(), &a) {
                ab.apply(&adjusted);
            }

            let mut ba = set.clone();
            ba.apply(&b);
            if let Some(adjusted) = transform(a.clone(), &b) {
                ba.apply(&adjusted);
            }

            prop_assert_eq!(ab.fingerprint(), ba.fingerprint());
        }
    }
}
