use crate::{
    listing::ImageAsset,
    pipeline::{Orchestrator, Pipeline, PipelineError, RunSnapshot, RunTicket},
    security::AuthContext,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const STAGE_SESSION: &str = "session";

#[derive(Clone)]
struct Session {
    tenant: String,
    orchestrator: Orchestrator,
    created_at: DateTime<Utc>,
}

/// In-memory sessions, one orchestrator each. Nothing survives a restart.
#[derive(Clone)]
pub struct SessionRegistry {
    pipeline: Pipeline,
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl SessionRegistry {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn create(&self, context: &AuthContext) -> Uuid {
        let id = Uuid::new_v4();
        let session = Session {
            tenant: context.tenant.clone(),
            orchestrator: Orchestrator::new(self.pipeline.clone()),
            created_at: Utc::now(),
        };
        self.sessions.lock().await.insert(id, session);
        info!(target = "atelier.api", session_id = %id, tenant = %context.tenant, "session_created");
        id
    }

    /// Look up a session owned by the caller. Other tenants' sessions read as missing.
    pub async fn get(&self, context: &AuthContext, id: &str) -> Result<Orchestrator, PipelineError> {
        let id = parse_session_id(id)?;
        let guard = self.sessions.lock().await;
        guard
            .get(&id)
            .filter(|session| session.tenant == context.tenant)
            .map(|session| session.orchestrator.clone())
            .ok_or_else(|| PipelineError::not_found(STAGE_SESSION, "session_not_found"))
    }

    pub async fn remove(&self, context: &AuthContext, id: &str) -> Result<(), PipelineError> {
        let orchestrator = self.get(context, id).await?;
        let id = parse_session_id(id)?;
        orchestrator.cancel().await;
        if let Some(session) = self.sessions.lock().await.remove(&id) {
            debug!(
                target = "atelier.api",
                session_id = %id,
                age_secs = (Utc::now() - session.created_at).num_seconds(),
                "session_removed"
            );
        }
        Ok(())
    }

    pub async fn snapshot(&self, context: &AuthContext, id: &str) -> Result<RunSnapshot, PipelineError> {
        Ok(self.get(context, id).await?.snapshot().await)
    }

    /// Start verification for `images` and let it run in the background.
    pub async fn submit(
        &self,
        context: &AuthContext,
        id: &str,
        images: Vec<ImageAsset>,
    ) -> Result<Uuid, PipelineError> {
        let orchestrator = self.get(context, id).await?;
        let ticket = orchestrator.submit(images).await?;
        Ok(spawn_run(orchestrator, ticket))
    }

    pub async fn prune(
        &self,
        context: &AuthContext,
        id: &str,
        indices: &[usize],
    ) -> Result<Uuid, PipelineError> {
        let orchestrator = self.get(context, id).await?;
        let ticket = orchestrator.resubmit_without(indices).await?;
        Ok(spawn_run(orchestrator, ticket))
    }

    pub async fn generate(&self, context: &AuthContext, id: &str) -> Result<Uuid, PipelineError> {
        let orchestrator = self.get(context, id).await?;
        let ticket = orchestrator.generate().await?;
        Ok(spawn_run(orchestrator, ticket))
    }
}

fn spawn_run(orchestrator: Orchestrator, ticket: RunTicket) -> Uuid {
    let run_id = ticket.run_id;
    tokio::spawn(async move { orchestrator.execute(ticket).await });
    run_id
}

fn parse_session_id(raw: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| PipelineError::invalid_input(STAGE_SESSION, "invalid_session_id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedInference;
    use crate::pipeline::{PipelineConfig, PipelineErrorKind, RunStage};
    use serde_json::json;
    use std::time::Duration;

    fn registry(replies: Vec<String>) -> SessionRegistry {
        let llm = Arc::new(ScriptedInference::ok(replies));
        SessionRegistry::new(Pipeline::new(PipelineConfig::default(), llm))
    }

    fn tenant(name: &str) -> AuthContext {
        AuthContext {
            tenant: name.to_string(),
            key_label: "key-01".to_string(),
        }
    }

    #[tokio::test]
    async fn sessions_are_private_to_their_tenant() {
        let registry = registry(vec![]);
        let id = registry.create(&tenant("a")).await.to_string();
        assert!(registry.snapshot(&tenant("a"), &id).await.is_ok());
        let err = registry.snapshot(&tenant("b"), &id).await.expect_err("foreign");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
        let err = registry.snapshot(&tenant("a"), "nope").await.expect_err("bad id");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn submitted_run_completes_in_background() {
        let mismatch = json!({
            "isMatch": false,
            "confidence": 80,
            "reason": "second photo is a different shirt",
            "mismatchedIndices": [1]
        })
        .to_string();
        let registry = registry(vec![mismatch]);
        let owner = tenant("a");
        let id = registry.create(&owner).await.to_string();
        let images = vec![
            ImageAsset::new(vec![1], "image/jpeg", "a.jpg"),
            ImageAsset::new(vec![2], "image/jpeg", "b.jpg"),
        ];
        let run_id = registry.submit(&owner, &id, images).await.expect("submit");

        let mut snapshot = registry.snapshot(&owner, &id).await.expect("snapshot");
        for _ in 0..50 {
            if !snapshot.stage.is_in_flight() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            snapshot = registry.snapshot(&owner, &id).await.expect("snapshot");
        }
        assert_eq!(snapshot.run_id, Some(run_id));
        assert_eq!(snapshot.stage, RunStage::Mismatched);
    }

    #[tokio::test]
    async fn removed_session_is_gone() {
        let registry = registry(vec![]);
        let owner = tenant("a");
        let id = registry.create(&owner).await.to_string();
        registry.remove(&owner, &id).await.expect("remove");
        assert!(registry.get(&owner, &id).await.is_err());
    }
}
