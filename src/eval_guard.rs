//! Safe-evaluation guardrail hook (§10.4 supplement).
//!
//! Grounded on `perl-dap-eval`'s `validator.rs`, which rejects expressions
//! with side effects before they reach the backend. Whether an expression
//! has side effects is language-specific, so this crate only carries the
//! hook point: `Frame::evaluate` (C9) consults it before issuing DAP's
//! `evaluate` request, and the default guard passes every expression
//! through unexamined.

/// Vets an expression before it is sent to the adapter's `evaluate`
/// request. Returning `Err` aborts the evaluate call with that message,
/// without ever reaching the wire.
pub trait EvaluateGuard {
    fn check(&self, expression: &str, context: Option<&str>) -> Result<(), String>;
}

/// Passes every expression through.
pub struct PermissiveEvaluateGuard;

impl EvaluateGuard for PermissiveEvaluateGuard {
    fn check(&self, _expression: &str, _context: Option<&str>) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_guard_never_rejects() {
        assert!(PermissiveEvaluateGuard.check("1 + 1", Some("watch")).is_ok());
    }
}
