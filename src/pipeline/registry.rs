//! Step type name -> factory lookup, consulted once when the chain is built.

use super::Step;
use super::steps::{cleanup, estimate, external, relocate, replace};
use crate::config::StepSpec;
use crate::error::{Error, Result};

/// Produces a fresh step instance per page.
pub type StepFactory = Box<dyn Fn() -> Box<dyn Step> + Send + Sync>;

type Builder = fn(&StepSpec) -> Result<StepFactory>;

const REGISTRY: &[(&str, Builder)] = &[
    ("ocrd-container", external::container_factory),
    ("tesseract", external::tesseract_factory),
    ("replace-chars", replace::factory),
    ("replace-regex", replace::factory),
    ("relocate", relocate::factory),
    ("remove-file", cleanup::factory),
    ("estimate-quality", estimate::factory),
];

pub fn registered_types() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

pub fn factory_for(spec: &StepSpec) -> Result<StepFactory> {
    let name = spec.type_name();
    let (_, build) = REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .ok_or_else(|| Error::config(format!("unknown step type: {name}")))?;
    build(spec)
}

/// Raised by a builder handed a spec of another type; only reachable through
/// a registry entry pointing at the wrong builder.
pub(crate) fn mismatch(expected: &str, spec: &StepSpec) -> Error {
    Error::config(format!(
        "step builder for {expected} received {}",
        spec.type_name()
    ))
}
