//! Standalone-mode board seeding: load an initial set of projects and
//! backlog cards into the in-process [`foreman_core::card::InMemoryCardStore`]
//! from a JSON file, since that store has no persistence of its own.

use std::path::Path;

use anyhow::{Context, Result};
use foreman_core::card::{InMemoryCardStore, Project, ProjectStatus};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub projects: Vec<SeedProject>,
    #[serde(default)]
    pub cards: Vec<SeedCard>,
}

#[derive(Debug, Deserialize)]
pub struct SeedProject {
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub agent_timeout_minutes: Option<u32>,
    #[serde(default)]
    pub max_concurrent_agents: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SeedCard {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
}

pub fn load(path: &Path) -> Result<SeedFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse seed file {}", path.display()))
}

/// Apply a loaded seed file to a fresh store. Cards are filed through
/// `create_card` rather than inserted directly so backlog position is
/// assigned the same way `Heartbeat::submit_task_brief` would assign it.
pub fn apply(store: &InMemoryCardStore, seed: &SeedFile) -> Result<()> {
    for project in &seed.projects {
        store.insert_project(Project {
            project_id: project.project_id.clone(),
            name: project.name.clone(),
            status: ProjectStatus::Active,
            agent_timeout_minutes: project.agent_timeout_minutes,
            max_concurrent_agents: project.max_concurrent_agents,
        });
    }

    for card in &seed.cards {
        foreman_core::card::CardStore::create_card(
            store,
            &card.project_id,
            &card.title,
            &card.description,
            card.priority,
        )
        .with_context(|| format!("failed to seed card '{}'", card.title))?;
    }

    Ok(())
}
