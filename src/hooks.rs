//! Bundles the consumer-overridable hooks (§10.2–10.4) into one handle
//! threaded through the session engine (C8) and entity bridge (C9), so
//! `Debugger::register_adapter`/`start` callers don't have to pass three
//! separate trait objects around.

use std::rc::Rc;

use crate::eval_guard::{EvaluateGuard, PermissiveEvaluateGuard};
use crate::stack_classify::{DefaultStackClassifier, StackClassifier};
use crate::variable_render::{DefaultVariableRenderer, VariableRenderer};

pub struct Hooks {
    pub variable_renderer: Box<dyn VariableRenderer>,
    pub stack_classifier: Box<dyn StackClassifier>,
    pub evaluate_guard: Box<dyn EvaluateGuard>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            variable_renderer: Box::new(DefaultVariableRenderer),
            stack_classifier: Box::new(DefaultStackClassifier),
            evaluate_guard: Box::new(PermissiveEvaluateGuard),
        }
    }
}

impl Hooks {
    pub fn shared() -> Rc<Hooks> {
        Rc::new(Hooks::default())
    }
}
