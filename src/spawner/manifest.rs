//! Task manifest rendering and housekeeping.
//!
//! The manifest is the agent's entire input: a plain-text file written under
//! `<work-dir>/.ai-tasks/` and piped to the CLI on stdin. It is deleted when
//! the agent exits; a background sweep removes orphans left by crashes.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::constants::MANIFEST_DIR;
use crate::models::{AgentType, Task};
use crate::Result;

pub fn manifest_path(work_dir: &Path, agent_id: &str) -> PathBuf {
    work_dir.join(MANIFEST_DIR).join(format!("task-{agent_id}.md"))
}

/// Render the manifest body for one agent invocation.
pub fn render(agent_type: AgentType, task: &Task) -> Result<String> {
    let context_json = serde_json::to_string_pretty(&task.context)?;

    let mut manifest = format!(
        "# AI Agent Task\n\
         **Agent Type**: {}\n\
         **Task ID**: {}\n\
         **Description**: {}\n\
         \n\
         ## Instructions\n\
         {}\n\
         \n\
         ## Context\n\
         ```json\n\
         {}\n\
         ```\n\
         \n\
         ## Requirements\n\
         1. Follow the SOPs defined in CLAUDE.md\n\
         2. Use the appropriate agent type guidelines\n\
         3. Provide clear, actionable output\n\
         4. Include code examples where applicable\n\
         5. Document any assumptions made\n\
         \n\
         ## Output Format\n\
         - Executive Summary\n\
         - Detailed Analysis\n\
         - Recommendations\n\
         - Implementation Steps\n\
         - Code Examples\n",
        agent_type.as_str(),
        task.id,
        task.description,
        task.prompt,
        context_json,
    );

    if let Some(appendix) = appendix(agent_type) {
        manifest.push('\n');
        manifest.push_str(appendix);
    }

    Ok(manifest)
}

/// Role-specific guidance appended for known agent types.
fn appendix(agent_type: AgentType) -> Option<&'static str> {
    match agent_type {
        AgentType::BusinessAnalyst => Some(
            "## Business Analyst Guidelines\n\
             - Capture requirements as user stories with acceptance criteria\n\
             - Call out conflicting or ambiguous requirements explicitly\n\
             - Map each recommendation to a stakeholder need\n",
        ),
        AgentType::CodeReviewer => Some(
            "## Code Review Guidelines\n\
             - Review for correctness first, style second\n\
             - Flag security-sensitive changes with severity\n\
             - Suggest concrete diffs, not vague advice\n",
        ),
        AgentType::TestRunner => Some(
            "## Test Runner Guidelines\n\
             - Run the full suite before any targeted subset\n\
             - Report failures with the exact command to reproduce\n\
             - Summarise coverage changes when available\n",
        ),
        AgentType::TechnicalArchitect => Some(
            "## Architecture Guidelines\n\
             - State the constraints before the design\n\
             - Present at least one rejected alternative\n\
             - Separate the migration path from the target state\n",
        ),
        AgentType::SopEnforcer => Some(
            "## SOP Compliance Guidelines\n\
             - Cite the specific SOP section for every finding\n\
             - Distinguish violations from recommendations\n",
        ),
        AgentType::DevelopmentPlanner | AgentType::GeneralPurpose => None,
    }
}

/// Write the manifest to disk, creating the manifest directory if needed.
pub async fn write(work_dir: &Path, agent_id: &str, content: &str) -> Result<PathBuf> {
    let dir = work_dir.join(MANIFEST_DIR);
    fs::create_dir_all(&dir).await?;
    let path = manifest_path(work_dir, agent_id);
    fs::write(&path, content).await?;
    debug!(path = %path.display(), "wrote task manifest");
    Ok(path)
}

/// Best-effort manifest removal after the agent exits.
pub async fn remove(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to delete manifest");
        }
    }
}

/// Remove manifests older than the retention window; returns the count.
pub async fn sweep_stale(work_dir: &Path, older_than_secs: u64) -> Result<usize> {
    let dir = work_dir.join(MANIFEST_DIR);
    if !dir.exists() {
        return Ok(0);
    }

    let now = Utc::now();
    let mut removed = 0;
    let mut entries = fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let age = now
            .signed_duration_since(chrono::DateTime::<Utc>::from(modified))
            .num_seconds();
        if age >= 0 && age as u64 > older_than_secs {
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to sweep manifest");
            } else {
                removed += 1;
            }
        }
    }

    if removed > 0 {
        debug!(removed, "swept stale task manifests");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_carries_the_contract_sections() {
        let task = Task::new("run tests", "Please run the full test suite")
            .with_context("user_id", "u1");
        let body = render(AgentType::TestRunner, &task).unwrap();

        assert!(body.starts_with("# AI Agent Task\n"));
        assert!(body.contains("**Agent Type**: test-runner\n"));
        assert!(body.contains(&format!("**Task ID**: {}\n", task.id)));
        assert!(body.contains("## Instructions\nPlease run the full test suite\n"));
        assert!(body.contains("## Context\n```json\n"));
        assert!(body.contains("\"user_id\": \"u1\""));
        assert!(body.contains("1. Follow the SOPs defined in CLAUDE.md"));
        assert!(body.contains("- Executive Summary"));
        // Type appendix for a known role
        assert!(body.contains("## Test Runner Guidelines"));
    }

    #[test]
    fn general_purpose_gets_no_appendix() {
        let task = Task::new("do something", "prompt");
        let body = render(AgentType::GeneralPurpose, &task).unwrap();
        assert!(!body.contains("Guidelines"));
    }

    #[tokio::test]
    async fn write_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "agent-1", "hello").await.unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        remove(&path).await;
        assert!(!path.exists());
        // Removing again is silent.
        remove(&path).await;
    }

    #[tokio::test]
    async fn sweep_ignores_fresh_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agent-1", "fresh").await.unwrap();

        let removed = sweep_stale(dir.path(), 3600).await.unwrap();
        assert_eq!(removed, 0);

        let removed = sweep_stale(dir.path(), 0).await.unwrap();
        // Age must strictly exceed the window; a just-written file survives
        // a zero-second window only if the clock has not ticked.
        assert!(removed <= 1);
    }
}
