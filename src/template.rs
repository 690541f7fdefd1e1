use crate::{
    config::PromptConfig,
    error::{Error, Result},
};
use std::fs;
use std::path::Path;
use tera::{Context, Tera};

const MERGE: &str = "merge";
const REDUCE: &str = "reduce";
const COMPRESS: &str = "compress";

/// Renders the instruction sent with each model call.
///
/// Built-in templates live under `templates/`; any of them can be replaced by a
/// file named in the `prompts` section of the configuration.
pub(crate) struct TemplateEngine {
    tera: Tera,
}

impl TemplateEngine {
    /// Creates a template engine, loading configured overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an override file cannot be read or does not parse.
    pub(crate) fn new(config: &PromptConfig) -> Result<Self> {
        let mut tera = Tera::default();

        Self::register_builtin_templates(&mut tera)?;

        for (name, path) in [
            (MERGE, &config.merge),
            (REDUCE, &config.reduce),
            (COMPRESS, &config.compress),
        ] {
            if let Some(path) = path {
                Self::register_override(&mut tera, name, path)?;
            }
        }

        Ok(Self { tera })
    }

    fn register_builtin_templates(tera: &mut Tera) -> Result<()> {
        tera.add_raw_template(MERGE, include_str!("../templates/merge.tera"))
            .map_err(|e| Error::template(MERGE, e))?;
        tera.add_raw_template(REDUCE, include_str!("../templates/reduce.tera"))
            .map_err(|e| Error::template(REDUCE, e))?;
        tera.add_raw_template(COMPRESS, include_str!("../templates/compress.tera"))
            .map_err(|e| Error::template(COMPRESS, e))?;
        Ok(())
    }

    fn register_override(tera: &mut Tera, name: &str, path: &Path) -> Result<()> {
        let source = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        tera.add_raw_template(name, &source)
            .map_err(|e| Error::template(path.display().to_string(), e))
    }

    /// Instruction for merging the fragments of one topic.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails.
    pub(crate) fn merge(&self, topic_id: &str, topic: &str) -> Result<String> {
        let mut context = Context::new();
        context.insert("topic_id", topic_id);
        context.insert("topic", topic);
        self.render(MERGE, &context)
    }

    /// Instruction for one group of a reduction pass.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails.
    pub(crate) fn reduce(
        &self,
        pass: usize,
        group: usize,
        group_count: usize,
        group_size: usize,
    ) -> Result<String> {
        let mut context = Context::new();
        context.insert("pass", &pass);
        context.insert("group", &group);
        context.insert("group_count", &group_count);
        context.insert("group_size", &group_size);
        self.render(REDUCE, &context)
    }

    /// Instruction for the final formatting pass.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails.
    pub(crate) fn compress(&self) -> Result<String> {
        self.render(COMPRESS, &Context::new())
    }

    fn render(&self, name: &str, context: &Context) -> Result<String> {
        self.tera
            .render(name, context)
            .map(|text| text.trim().to_string())
            .map_err(|e| Error::template(name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_builtin_templates_render() {
        let engine = TemplateEngine::new(&PromptConfig::default()).unwrap();

        let merge = engine.merge("walkers", "Walkers and Graph Traversal").unwrap();
        assert!(merge.contains("\"Walkers and Graph Traversal\""));

        let reduce = engine.reduce(2, 1, 3, 4).unwrap();
        assert!(reduce.contains("reduction pass 2, group 1 of 3"));
        assert!(reduce.contains("4 documentation sections"));

        let single = engine.reduce(1, 3, 3, 1).unwrap();
        assert!(single.contains("1 documentation section,"));

        assert!(!engine.compress().unwrap().is_empty());
    }

    #[test]
    fn test_override_template() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("merge.txt");
        file.write_str("Merge notes on {{ topic_id }} only.").unwrap();

        let config = PromptConfig {
            merge: Some(file.path().to_path_buf()),
            ..PromptConfig::default()
        };
        let engine = TemplateEngine::new(&config).unwrap();

        assert_eq!(engine.merge("edges", "Edges").unwrap(), "Merge notes on edges only.");
    }

    #[test]
    fn test_override_syntax_error() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("reduce.txt");
        file.write_str("{% if pass %}unterminated").unwrap();

        let config = PromptConfig {
            reduce: Some(file.path().to_path_buf()),
            ..PromptConfig::default()
        };

        assert!(matches!(
            TemplateEngine::new(&config),
            Err(Error::Template { .. })
        ));
    }

    #[test]
    fn test_missing_override_file() {
        let config = PromptConfig {
            compress: Some("/nonexistent/compress.txt".into()),
            ..PromptConfig::default()
        };

        assert!(matches!(TemplateEngine::new(&config), Err(e) if e.is_io()));
    }
}
