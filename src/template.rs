//! Input substitution into transaction scripts.
//!
//! Definitions may carry an `inputs` map; placeholders like `{{ hostname }}`
//! in the script are rendered against that map before the script is compiled.

use minijinja::Environment;

use crate::error::TemplateError;
use crate::transaction::Definition;

/// Expand the definition's inputs into its script.
///
/// Returns the definition with the substituted script. Definitions without
/// inputs pass through untouched; a script without placeholders expands to
/// itself, so expansion is idempotent.
pub fn expand(mut definition: Definition) -> Result<Definition, TemplateError> {
    let Some(inputs) = definition.inputs.as_ref() else {
        return Ok(definition);
    };
    if inputs.is_empty() {
        return Ok(definition);
    }

    let env = Environment::new();
    let rendered = env
        .render_str(&definition.script, inputs)
        .map_err(|e| TemplateError::Expand {
            name: definition.name.clone(),
            message: e.to_string(),
        })?;

    definition.script = rendered;
    Ok(definition)
}
