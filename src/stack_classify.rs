//! Stack-frame classification hook (§10.3 supplement).
//!
//! Grounded on `perl-dap-stack`'s `classifier.rs`, which tags frames as
//! user code vs. library code so a UI can fold the latter by default. This
//! crate doesn't opinionate on what counts as "library code" for an
//! arbitrary adapter, so the classifier is a consumer-supplied hook that
//! the bridge (C9) consults once per fetched frame, defaulting to
//! `Normal` for everything.

use crate::graph::PresentationHint;
use crate::protocol::WireStackFrame;

/// Classifies one adapter-reported stack frame into a
/// [`PresentationHint`], driving `Frame.presentation_hint`.
pub trait StackClassifier {
    fn classify(&self, frame: &WireStackFrame) -> PresentationHint;
}

/// Classifies every frame as `Normal`.
pub struct DefaultStackClassifier;

impl StackClassifier for DefaultStackClassifier {
    fn classify(&self, _frame: &WireStackFrame) -> PresentationHint {
        PresentationHint::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classifier_is_always_normal() {
        let frame = WireStackFrame { id: 1, name: "main".into(), source: None, line: 1, column: 1, presentation_hint: None };
        assert_eq!(DefaultStackClassifier.classify(&frame), PresentationHint::Normal);
    }
}
