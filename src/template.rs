//! Template collaborator contracts.
//!
//! Template engines live outside this crate. The dispatcher only needs a
//! way to find a renderable template by path (optionally localized) and to
//! execute it against a JSON value.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

pub type TemplateError = Box<dyn std::error::Error + Send + Sync>;

/// Something that can be executed against template data.
pub trait Template: Send + Sync {
    fn execute(&self, data: &Value, out: &mut Vec<u8>) -> Result<(), TemplateError>;
}

impl<F> Template for F
where
    F: Fn(&Value, &mut Vec<u8>) -> Result<(), TemplateError> + Send + Sync,
{
    fn execute(&self, data: &Value, out: &mut Vec<u8>) -> Result<(), TemplateError> {
        self(data, out)
    }
}

/// Finds templates by path, e.g. `layouts/default.tpl`.
pub trait TemplateResolver: Send + Sync {
    /// `locale` is set when localized templates are enabled; resolvers
    /// should prefer a localized variant and fall back to the plain path.
    fn resolve(&self, path: &str, locale: Option<&str>) -> Option<Arc<dyn Template>>;
}

/// A resolver that never finds anything.
pub struct NoTemplates;

impl TemplateResolver for NoTemplates {
    fn resolve(&self, _path: &str, _locale: Option<&str>) -> Option<Arc<dyn Template>> { None }
}

/// Templates registered in memory. A localized variant of `a/b.tpl` for
/// `pt` is registered as `a/b_pt.tpl`.
#[derive(Default)]
pub struct MemoryTemplates {
    templates: HashMap<String, Arc<dyn Template>>,
}

impl MemoryTemplates {
    pub fn new() -> Self { Self::default() }

    pub fn insert(mut self, path: &str, template: impl Template + 'static) -> Self {
        self.templates.insert(path.to_owned(), Arc::new(template));
        self
    }
}

/// `layouts/error.tpl` + `pt` -> `layouts/error_pt.tpl`
pub fn localized_path(path: &str, locale: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => format!("{stem}_{locale}.{ext}"),
        _ => format!("{path}_{locale}"),
    }
}

impl TemplateResolver for MemoryTemplates {
    fn resolve(&self, path: &str, locale: Option<&str>) -> Option<Arc<dyn Template>> {
        locale
            .and_then(|l| self.templates.get(&localized_path(path, l)))
            .or_else(|| self.templates.get(path))
            .cloned()
    }
}

/// Executes `template` into a string.
pub fn execute_to_string(template: &dyn Template, data: &Value) -> Result<String, TemplateError> {
    let mut out = Vec::new();
    template.execute(data, &mut out)?;
    Ok(String::from_utf8(out)?)
}
