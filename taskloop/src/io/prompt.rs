//! Prompt rendering for units of work.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::io::init::TaskloopPaths;
use crate::io::registry::Session;

const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const SPEC_TEMPLATE: &str = include_str!("prompts/spec.md");
const AGENTS_TEMPLATE: &str = include_str!("prompts/agents.md");

/// Session facts every template can reference.
#[derive(Debug, Clone, Serialize)]
pub struct SessionPromptContext {
    pub name: String,
    pub description: String,
    pub plan_path: String,
    pub progress_path: String,
    pub specs_dir: Option<String>,
    pub references_dir: Option<String>,
    pub agents_file: String,
}

impl SessionPromptContext {
    pub fn new(session: &Session, paths: &TaskloopPaths) -> Self {
        Self {
            name: session.name.clone(),
            description: session.description.clone(),
            plan_path: display(&session.plan_path(paths), &paths.root),
            progress_path: display(session.progress_log(paths).path(), &paths.root),
            specs_dir: session.specs_dir(paths).map(|dir| display(&dir, &paths.root)),
            references_dir: session
                .references_dir(paths)
                .map(|dir| display(&dir, &paths.root)),
            agents_file: display(&paths.agents_file, &paths.root),
        }
    }
}

/// Paths inside the project are shown relative to it.
fn display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("build", BUILD_TEMPLATE)
            .expect("build template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("spec", SPEC_TEMPLATE)
            .expect("spec template should be valid");
        env.add_template("agents", AGENTS_TEMPLATE)
            .expect("agents template should be valid");
        Self { env }
    }

    /// Base instructions plus exactly one task.
    pub fn render_build(
        &self,
        session: &SessionPromptContext,
        task: &str,
        completion_signal: &str,
        delegate: bool,
    ) -> Result<String> {
        let template = self.env.get_template("build")?;
        Ok(template.render(context! {
            session => session,
            task => task.trim(),
            completion_signal => completion_signal,
            delegate => delegate,
        })?)
    }

    pub fn render_plan(
        &self,
        session: &SessionPromptContext,
        existing_tasks: usize,
        completed_tasks: usize,
    ) -> Result<String> {
        let template = self.env.get_template("plan")?;
        Ok(template.render(context! {
            session => session,
            existing_tasks => existing_tasks,
            completed_tasks => completed_tasks,
        })?)
    }

    pub fn render_spec(&self, session: &SessionPromptContext, target_dir: &str) -> Result<String> {
        let template = self.env.get_template("spec")?;
        Ok(template.render(context! {
            session => session,
            target_dir => target_dir,
        })?)
    }

    pub fn render_agents(&self, session: &SessionPromptContext) -> Result<String> {
        let template = self.env.get_template("agents")?;
        Ok(template.render(context! { session => session })?)
    }
}
