//! Continuation prompt rendered after a session restart.

use anyhow::Result;
use minijinja::{Environment, context};

const CONTINUATION_TEMPLATE: &str = include_str!("prompts/continuation.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("continuation", CONTINUATION_TEMPLATE)
            .expect("continuation template should be valid");
        Self { env }
    }

    /// Render the priming message from preserved snippets.
    ///
    /// Snippets are flattened to one line each; the driven CLI submits on the
    /// first carriage return, so the result never contains newlines.
    pub fn render_continuation(&self, snippets: &[String], pending_task: Option<&str>) -> Result<String> {
        let snippets: Vec<String> = snippets.iter().map(|s| one_line(s)).collect();
        let template = self.env.get_template("continuation")?;
        let rendered = template.render(context! {
            snippets => snippets,
            pending_task => pending_task.map(one_line).filter(|s| !s.is_empty()),
        })?;
        Ok(one_line(&rendered))
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
