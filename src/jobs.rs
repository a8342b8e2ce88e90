//! Job context for sessions tied to a specific opening.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the interviewer should know about the job being hired for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobContext {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
}

impl JobContext {
    /// Plain-text rendering stored on the session and fed to the generator.
    pub fn render(&self) -> String {
        let mut out = format!("Job: {}\n", self.title);
        if !self.description.trim().is_empty() {
            out.push_str(&format!("Description: {}\n", self.description.trim()));
        }
        if !self.requirements.is_empty() {
            out.push_str("Requirements:\n");
            for r in &self.requirements {
                out.push_str(&format!("- {}\n", r));
            }
        }
        if !self.tech_stack.is_empty() {
            out.push_str(&format!("Tech stack: {}\n", self.tech_stack.join(", ")));
        }
        out
    }
}

#[async_trait]
pub trait JobContextProvider: Send + Sync {
    async fn job_context(&self, job_ref: &str) -> Option<JobContext>;
}

/// Job contexts loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct JobCatalog {
    jobs: HashMap<String, JobContext>,
}

impl JobCatalog {
    pub fn new(jobs: impl IntoIterator<Item = JobContext>) -> Self {
        Self {
            jobs: jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobContextProvider for JobCatalog {
    async fn job_context(&self, job_ref: &str) -> Option<JobContext> {
        self.jobs.get(job_ref).cloned()
    }
}
