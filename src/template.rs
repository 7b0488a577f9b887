//! HTML email templates.
//!
//! Two templates ship with the binary. A `TEMPLATE_DIR` containing
//! `<name>.hbs` files replaces the built-in template of the same name.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Confirmation sent when a request first appears.
pub const CONFIRMATION: &str = "gss_response";
/// Follow-up sent when a coordinator is assigned.
pub const ASSIGNMENT: &str = "gss_update";

const BUILTIN: [(&str, &str); 2] = [
    (CONFIRMATION, include_str!("../templates/gss_response.hbs")),
    (ASSIGNMENT, include_str!("../templates/gss_update.hbs")),
];

pub struct Templates {
    registry: Handlebars<'static>,
}

impl Templates {
    /// Built-in templates only.
    pub fn builtin() -> Result<Self> {
        Self::load(None)
    }

    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut registry = Handlebars::new();
        for (name, source) in BUILTIN {
            registry
                .register_template_string(name, source)
                .with_context(|| format!("registering {name} template"))?;
        }
        if let Some(dir) = dir {
            for (name, _) in BUILTIN {
                let path = dir.join(format!("{name}.hbs"));
                if path.is_file() {
                    debug!(path = %path.display(), "overriding built-in template");
                    registry
                        .register_template_file(name, &path)
                        .with_context(|| format!("loading template {}", path.display()))?;
                }
            }
        }
        Ok(Self { registry })
    }

    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        self.registry
            .render(name, context)
            .with_context(|| format!("rendering {name} template"))
    }
}
