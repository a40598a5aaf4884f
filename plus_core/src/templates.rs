//! HTML templates rendered with handlebars.
//!
//! Every `*.html` file under the templates directory is registered once, at
//! load time, under its path relative to that directory (`errors/404.html`).
//! `{{ value }}` is HTML-escaped; `{{{ value }}}` is not.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{Error, Result};

pub use handlebars::html_escape;

#[derive(Clone, Debug)]
pub struct Templates {
    dir: PathBuf,
    registry: Arc<Handlebars<'static>>,
}

impl Templates {
    /// Register the templates under `dir`. A missing directory registers none.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut registry = Handlebars::new();
        if dir.is_dir() {
            register_dir(&mut registry, &dir, &dir)?;
        }
        tracing::debug!(
            dir = %dir.display(),
            count = registry.get_templates().len(),
            "Registered templates"
        );
        Ok(Self {
            dir,
            registry: Arc::new(registry),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn has(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }

    /// Render `name` with `data`. `None` if no such template was registered.
    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<Option<String>> {
        if !self.registry.has_template(name) {
            return Ok(None);
        }
        self.registry
            .render(name, data)
            .map(Some)
            .map_err(|e| Error::Template(format!("{name}: {e}")))
    }
}

fn register_dir(registry: &mut Handlebars<'static>, root: &Path, dir: &Path) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_dir() {
            register_dir(registry, root, &path)?;
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some("html") {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative.to_string_lossy().replace('\\', "/");
        let source = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        registry
            .register_template_string(&name, source)
            .map_err(|e| Error::Template(format!("{name}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn write(dir: &Path, name: &str, source: &str) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, source).unwrap();
    }

    #[test]
    fn renders_both_spacings() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "errors/404.html", "<p>{{ error }}</p><i>{{error}}</i>");

        let templates = Templates::load(dir.path()).unwrap();
        let html = templates
            .render("errors/404.html", &json!({ "error": "gone" }))
            .unwrap();
        assert_eq!(html.as_deref(), Some("<p>gone</p><i>gone</i>"));
    }

    #[test]
    fn escapes_values() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "page.html", "{{ x }}");

        let templates = Templates::load(dir.path()).unwrap();
        let html = templates
            .render("page.html", &json!({ "x": "<b>\"a\" & 'b'</b>" }))
            .unwrap()
            .unwrap();
        assert_eq!(html, "&lt;b&gt;&quot;a&quot; &amp; &#x27;b&#x27;&lt;/b&gt;");
        assert_eq!(html_escape("<i>"), "&lt;i&gt;");
    }

    #[test]
    fn values_are_not_expanded_again() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "errors/500.html", "{{ error }}|{{ other }}");

        let templates = Templates::load(dir.path()).unwrap();
        let html = templates
            .render(
                "errors/500.html",
                &json!({ "error": "{{ other }}", "other": "x" }),
            )
            .unwrap()
            .unwrap();
        assert_eq!(html, "{{ other }}|x");
    }

    #[test]
    fn missing_template_renders_none() {
        let dir = tempfile::tempdir().unwrap();
        let templates = Templates::load(dir.path().join("absent")).unwrap();
        assert!(!templates.has("errors/404.html"));
        assert_eq!(
            templates.render("errors/404.html", &json!({})).unwrap(),
            None
        );
    }

    #[test]
    fn only_html_files_are_registered() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "errors/404.html", "lost");
        write(dir.path(), "errors/notes.txt", "ignored");

        let templates = Templates::load(dir.path()).unwrap();
        assert!(templates.has("errors/404.html"));
        assert!(!templates.has("errors/notes.txt"));
    }

    #[test]
    fn broken_template_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "errors/403.html", "{{#if error}}unclosed");

        let err = Templates::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Template(ref msg) if msg.starts_with("errors/403.html")));
    }
}
