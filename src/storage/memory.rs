//! In-memory repository.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::Repository;
use crate::domain::{Asset, Link, Orchestration, Phase, Stage};
use crate::error::{Error, Result};

#[derive(Default)]
struct Tables {
    assets: BTreeMap<String, Asset>,
    orchestrations: BTreeMap<String, Orchestration>,
    stages: BTreeMap<String, Stage>,
    links: BTreeMap<String, Link>,
}

/// Repository holding every record in memory behind one lock. Lists come
/// back sorted by name.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert_unique<T>(map: &mut BTreeMap<String, T>, kind: &str, name: &str, value: T) -> Result<()> {
    if map.contains_key(name) {
        return Err(Error::already_exists(format!("{} {}", kind, name)));
    }
    map.insert(name.to_string(), value);
    Ok(())
}

fn lookup<T: Clone>(map: &BTreeMap<String, T>, kind: &str, name: &str) -> Result<T> {
    map.get(name)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("{} {}", kind, name)))
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_asset(&self, asset: Asset) -> Result<()> {
        let mut tables = self.tables.write().await;
        let name = asset.name.clone();
        insert_unique(&mut tables.assets, "asset", &name, asset)
    }

    async fn get_asset(&self, name: &str) -> Result<Asset> {
        lookup(&self.tables.read().await.assets, "asset", name)
    }

    async fn list_assets(&self) -> Result<Vec<Asset>> {
        Ok(self.tables.read().await.assets.values().cloned().collect())
    }

    async fn create_orchestration(&self, orchestration: Orchestration) -> Result<()> {
        let mut tables = self.tables.write().await;
        let name = orchestration.name.clone();
        insert_unique(&mut tables.orchestrations, "orchestration", &name, orchestration)
    }

    async fn get_orchestration(&self, name: &str) -> Result<Orchestration> {
        lookup(&self.tables.read().await.orchestrations, "orchestration", name)
    }

    async fn list_orchestrations(&self) -> Result<Vec<Orchestration>> {
        Ok(self
            .tables
            .read()
            .await
            .orchestrations
            .values()
            .cloned()
            .collect())
    }

    async fn create_stage(&self, stage: Stage) -> Result<()> {
        let mut tables = self.tables.write().await;
        let orch = tables
            .orchestrations
            .get(&stage.orchestration)
            .ok_or_else(|| Error::not_found(format!("orchestration {}", stage.orchestration)))?;
        // Same lock as mark_running.
        if orch.phase != Phase::Pending {
            return Err(Error::failed_precondition(format!(
                "orchestration {} is {}",
                stage.orchestration, orch.phase
            )));
        }
        let name = stage.name.clone();
        let orchestration = stage.orchestration.clone();
        insert_unique(&mut tables.stages, "stage", &name, stage)?;
        if let Some(orch) = tables.orchestrations.get_mut(&orchestration) {
            orch.stages.push(name);
        }
        Ok(())
    }

    async fn get_stage(&self, name: &str) -> Result<Stage> {
        lookup(&self.tables.read().await.stages, "stage", name)
    }

    async fn list_stages(&self) -> Result<Vec<Stage>> {
        Ok(self.tables.read().await.stages.values().cloned().collect())
    }

    async fn create_link(&self, link: Link) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.orchestrations.contains_key(&link.orchestration) {
            return Err(Error::not_found(format!(
                "orchestration {}",
                link.orchestration
            )));
        }
        let name = link.name.clone();
        let orchestration = link.orchestration.clone();
        insert_unique(&mut tables.links, "link", &name, link)?;
        if let Some(orch) = tables.orchestrations.get_mut(&orchestration) {
            orch.links.push(name);
        }
        Ok(())
    }

    async fn get_link(&self, name: &str) -> Result<Link> {
        lookup(&self.tables.read().await.links, "link", name)
    }

    async fn list_links(&self) -> Result<Vec<Link>> {
        Ok(self.tables.read().await.links.values().cloned().collect())
    }

    async fn mark_running(&self, orchestration: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let Tables {
            orchestrations,
            stages,
            ..
        } = &mut *tables;

        let orch = orchestrations
            .get_mut(orchestration)
            .ok_or_else(|| Error::not_found(format!("orchestration {}", orchestration)))?;
        if orch.phase != Phase::Pending {
            return Err(Error::failed_precondition(format!(
                "orchestration {} is {}",
                orchestration, orch.phase
            )));
        }

        orch.phase = Phase::Running;
        for name in &orch.stages {
            if let Some(stage) = stages.get_mut(name) {
                stage.phase = Phase::Running;
            }
        }
        debug!(orchestration, "Marked running");
        Ok(())
    }

    async fn mark_finished(&self, orchestration: &str, failed: &HashSet<String>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let Tables {
            orchestrations,
            stages,
            ..
        } = &mut *tables;

        let orch = orchestrations
            .get_mut(orchestration)
            .ok_or_else(|| Error::not_found(format!("orchestration {}", orchestration)))?;
        if orch.phase != Phase::Running {
            return Err(Error::failed_precondition(format!(
                "orchestration {} is {}",
                orchestration, orch.phase
            )));
        }

        let mut any_failed = false;
        for name in &orch.stages {
            if let Some(stage) = stages.get_mut(name) {
                stage.phase = if failed.contains(name) {
                    any_failed = true;
                    Phase::Failed
                } else {
                    Phase::Succeeded
                };
            }
        }
        orch.phase = if any_failed {
            Phase::Failed
        } else {
            Phase::Succeeded
        };
        debug!(orchestration, phase = %orch.phase, "Marked finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::test_utils::rpc;

    fn stage(name: &str, orchestration: &str) -> Stage {
        Stage::new(name, orchestration, rpc("EchoService", "Echo"), "localhost:1")
    }

    async fn repo_with_orchestration(name: &str) -> MemoryRepository {
        let repo = MemoryRepository::new();
        repo.create_orchestration(Orchestration::new(name))
            .await
            .unwrap();
        repo
    }

    #[tokio::test]
    async fn test_asset_create_get_list() {
        let repo = MemoryRepository::new();
        let asset = Asset {
            name: "echo".to_string(),
            image: "registry/echo:1".to_string(),
        };
        repo.create_asset(asset.clone()).await.unwrap();

        assert_eq!(repo.get_asset("echo").await.unwrap(), asset);
        assert_eq!(repo.list_assets().await.unwrap(), vec![asset.clone()]);

        let err = repo.create_asset(asset).await.unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let repo = MemoryRepository::new();
        assert_eq!(
            repo.get_orchestration("nope").await.unwrap_err().code(),
            Code::NotFound
        );
        assert_eq!(repo.get_stage("nope").await.unwrap_err().code(), Code::NotFound);
        assert_eq!(repo.get_link("nope").await.unwrap_err().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_stage_recorded_on_orchestration() {
        let repo = repo_with_orchestration("o").await;
        repo.create_stage(stage("a", "o")).await.unwrap();
        repo.create_stage(stage("b", "o")).await.unwrap();

        let orch = repo.get_orchestration("o").await.unwrap();
        assert_eq!(orch.stages, vec!["a", "b"]);
        assert_eq!(repo.list_stages().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stage_requires_orchestration() {
        let repo = MemoryRepository::new();
        let err = repo.create_stage(stage("a", "o")).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_stage_not_recorded_twice() {
        let repo = repo_with_orchestration("o").await;
        repo.create_stage(stage("a", "o")).await.unwrap();
        let err = repo.create_stage(stage("a", "o")).await.unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(repo.get_orchestration("o").await.unwrap().stages, vec!["a"]);
    }

    #[tokio::test]
    async fn test_stage_rejected_once_running() {
        let repo = repo_with_orchestration("o").await;
        repo.create_stage(stage("a", "o")).await.unwrap();
        repo.mark_running("o").await.unwrap();

        let err = repo.create_stage(stage("late", "o")).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(repo.get_stage("late").await.is_err());
        assert_eq!(repo.get_orchestration("o").await.unwrap().stages, vec!["a"]);
    }

    #[tokio::test]
    async fn test_link_recorded_on_orchestration() {
        let repo = repo_with_orchestration("o").await;
        repo.create_link(Link::new("l1", "a", "b").in_orchestration("o"))
            .await
            .unwrap();
        assert_eq!(repo.get_orchestration("o").await.unwrap().links, vec!["l1"]);
        assert_eq!(repo.get_link("l1").await.unwrap().target_stage, "b");
    }

    #[tokio::test]
    async fn test_mark_running_then_finished() {
        let repo = repo_with_orchestration("o").await;
        repo.create_stage(stage("a", "o")).await.unwrap();
        repo.create_stage(stage("b", "o")).await.unwrap();

        repo.mark_running("o").await.unwrap();
        assert_eq!(repo.get_orchestration("o").await.unwrap().phase, Phase::Running);
        assert_eq!(repo.get_stage("a").await.unwrap().phase, Phase::Running);

        let err = repo.mark_running("o").await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let failed: HashSet<String> = ["b".to_string()].into_iter().collect();
        repo.mark_finished("o", &failed).await.unwrap();
        assert_eq!(repo.get_stage("a").await.unwrap().phase, Phase::Succeeded);
        assert_eq!(repo.get_stage("b").await.unwrap().phase, Phase::Failed);
        assert_eq!(repo.get_orchestration("o").await.unwrap().phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_mark_finished_requires_running() {
        let repo = repo_with_orchestration("o").await;
        let err = repo.mark_finished("o", &HashSet::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }
}
