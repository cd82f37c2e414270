//! Verification status lattice.
//!
//! A verification outcome is a point on a small lattice: `Processed` at the
//! top, `Invalid` at the bottom, with `NotReady` and `Unknown` as transient
//! states in between. Folding prerequisite outcomes uses [`merge`], the meet
//! of the lattice; the identity for an empty prerequisite set is
//! [`VerificationData::processed`].

use serde::{Deserialize, Serialize};

use crate::ids::DiagnosticId;

/// Status of a single entity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// No verification has run yet, or a previous result was discarded.
    Unknown,
    /// Verification ran but a dependency or external resource is still
    /// pending. Recoverable: callers retry later.
    NotReady,
    /// The entity and all of its prerequisites are in a usable state.
    Processed,
    /// The entity is broken. Diagnostic records describe why.
    Invalid,
}

/// A verification outcome: status plus references to persisted diagnostics.
///
/// Invariant: `errors` is non-empty only when `status` is
/// [`VerificationStatus::Invalid`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationData {
    pub status: VerificationStatus,
    #[serde(default)]
    pub errors: Vec<DiagnosticId>,
}

impl VerificationData {
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            status: VerificationStatus::Unknown,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn not_ready() -> Self {
        Self {
            status: VerificationStatus::NotReady,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn processed() -> Self {
        Self {
            status: VerificationStatus::Processed,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn invalid(errors: Vec<DiagnosticId>) -> Self {
        Self {
            status: VerificationStatus::Invalid,
            errors,
        }
    }

    #[must_use]
    pub fn invalid_one(error: DiagnosticId) -> Self {
        Self::invalid(vec![error])
    }

    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.status == VerificationStatus::Processed
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.status == VerificationStatus::Invalid
    }
}

impl Default for VerificationData {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Meet of two verification outcomes.
///
/// `Invalid` absorbs everything and unions error references; any transient
/// state (`NotReady` or `Unknown`) collapses to `NotReady` against a
/// non-`Invalid` operand; `Processed` meets `Processed` is `Processed`.
/// Commutative and associative (duplicate error ids aside: the union keeps
/// first-occurrence order and drops repeats).
#[must_use]
pub fn merge(a: &VerificationData, b: &VerificationData) -> VerificationData {
    use VerificationStatus::{Invalid, NotReady, Processed, Unknown};

    match (a.status, b.status) {
        (Invalid, Invalid) => {
            let mut errors = a.errors.clone();
            for e in &b.errors {
                if !errors.contains(e) {
                    errors.push(*e);
                }
            }
            VerificationData::invalid(errors)
        }
        (Invalid, _) => a.clone(),
        (_, Invalid) => b.clone(),
        (NotReady | Unknown, _) | (_, NotReady | Unknown) => VerificationData::not_ready(),
        (Processed, Processed) => VerificationData::processed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(id: i64) -> DiagnosticId {
        DiagnosticId::new(id)
    }

    fn sample_points() -> Vec<VerificationData> {
        vec![
            VerificationData::unknown(),
            VerificationData::not_ready(),
            VerificationData::processed(),
            VerificationData::invalid_one(d(1)),
            VerificationData::invalid(vec![d(2), d(3)]),
        ]
    }

    #[test]
    fn merge_invalid_unions_errors() {
        let a = VerificationData::invalid(vec![d(1), d(2)]);
        let b = VerificationData::invalid(vec![d(2), d(3)]);
        let merged = merge(&a, &b);
        assert_eq!(merged.status, VerificationStatus::Invalid);
        assert_eq!(merged.errors, vec![d(1), d(2), d(3)]);
    }

    #[test]
    fn merge_invalid_absorbs_everything() {
        let invalid = VerificationData::invalid_one(d(7));
        for other in sample_points() {
            if other.is_invalid() {
                continue;
            }
            assert_eq!(merge(&invalid, &other), invalid);
            assert_eq!(merge(&other, &invalid), invalid);
        }
    }

    #[test]
    fn merge_unknown_is_conservative() {
        let merged = merge(
            &VerificationData::unknown(),
            &VerificationData::processed(),
        );
        assert_eq!(merged.status, VerificationStatus::NotReady);
    }

    #[test]
    fn merge_processed_is_identity_for_processed() {
        let merged = merge(
            &VerificationData::processed(),
            &VerificationData::processed(),
        );
        assert_eq!(merged.status, VerificationStatus::Processed);
    }

    #[test]
    fn merge_is_commutative() {
        let points = sample_points();
        for a in &points {
            for b in &points {
                let ab = merge(a, b);
                let ba = merge(b, a);
                assert_eq!(ab.status, ba.status, "status differs for {a:?} / {b:?}");
                // Error order differs across operand order; the sets must match.
                let mut ab_errors = ab.errors.clone();
                let mut ba_errors = ba.errors.clone();
                ab_errors.sort_by_key(|e| e.value());
                ba_errors.sort_by_key(|e| e.value());
                assert_eq!(ab_errors, ba_errors);
            }
        }
    }

    #[test]
    fn merge_is_associative() {
        let points = sample_points();
        for a in &points {
            for b in &points {
                for c in &points {
                    let left = merge(&merge(a, b), c);
                    let right = merge(a, &merge(b, c));
                    assert_eq!(
                        left.status, right.status,
                        "status differs for {a:?} / {b:?} / {c:?}"
                    );
                    let mut left_errors = left.errors.clone();
                    let mut right_errors = right.errors.clone();
                    left_errors.sort_by_key(|e| e.value());
                    right_errors.sort_by_key(|e| e.value());
                    assert_eq!(left_errors, right_errors);
                }
            }
        }
    }

    #[test]
    fn invalid_only_state_with_errors() {
        for point in sample_points() {
            if !point.is_invalid() {
                assert!(point.errors.is_empty());
            }
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&VerificationStatus::NotReady).unwrap();
        assert_eq!(json, "\"not_ready\"");
    }
}
