//! Variable rendering hook (§10.2 supplement).
//!
//! Grounded on `perl-dap-variables`'s `VariableRenderer` trait, which turns
//! a typed backend value into a DAP-shaped `RenderedVariable`. This crate
//! only ever receives the adapter's own wire strings (`value`, `type`), so
//! the hook's job narrows to letting a consumer reshape presentation
//! without forking the bridge (C9) that calls it.

use crate::protocol::WireVariable;

/// A rendered view of one adapter-reported variable, handed to the bridge
/// before it writes `Variable`'s signals.
#[derive(Debug, Clone)]
pub struct RenderedVariable {
    pub value: String,
    pub type_annotation: Option<String>,
}

/// Reshapes a [`WireVariable`] before it's written into the graph.
pub trait VariableRenderer {
    fn render(&self, wire: &WireVariable) -> RenderedVariable;
}

/// Renders the adapter's `value`/`type` strings verbatim.
pub struct DefaultVariableRenderer;

impl VariableRenderer for DefaultVariableRenderer {
    fn render(&self, wire: &WireVariable) -> RenderedVariable {
        RenderedVariable { value: wire.value.clone(), type_annotation: wire.type_annotation.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_renderer_passes_through() {
        let wire = WireVariable { name: "x".into(), value: "42".into(), type_annotation: Some("int".into()), evaluate_name: None, variables_reference: 0 };
        let rendered = DefaultVariableRenderer.render(&wire);
        assert_eq!(rendered.value, "42");
        assert_eq!(rendered.type_annotation.as_deref(), Some("int"));
    }
}
