//! Persistence of pipeline definitions.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::{Asset, Link, Orchestration, Stage};
use crate::error::Result;

pub mod memory;

pub use memory::MemoryRepository;

/// Name-keyed store of assets, orchestrations, stages and links.
///
/// Stage and link names are unique across orchestrations. Creating a stage
/// or link also records its name on the owning orchestration.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_asset(&self, asset: Asset) -> Result<()>;
    async fn get_asset(&self, name: &str) -> Result<Asset>;
    async fn list_assets(&self) -> Result<Vec<Asset>>;

    async fn create_orchestration(&self, orchestration: Orchestration) -> Result<()>;
    async fn get_orchestration(&self, name: &str) -> Result<Orchestration>;
    async fn list_orchestrations(&self) -> Result<Vec<Orchestration>>;

    async fn create_stage(&self, stage: Stage) -> Result<()>;
    async fn get_stage(&self, name: &str) -> Result<Stage>;
    async fn list_stages(&self) -> Result<Vec<Stage>>;

    async fn create_link(&self, link: Link) -> Result<()>;
    async fn get_link(&self, name: &str) -> Result<Link>;
    async fn list_links(&self) -> Result<Vec<Link>>;

    /// Move a Pending orchestration and all its stages to Running.
    async fn mark_running(&self, orchestration: &str) -> Result<()>;

    /// Move a Running orchestration to its final phase. Stages named in
    /// `failed` become Failed, the rest Succeeded. The orchestration fails
    /// if any of its stages did.
    async fn mark_finished(&self, orchestration: &str, failed: &HashSet<String>) -> Result<()>;
}
