//! Top-level façade.
//!
//! The [`Manager`] validates and records pipeline definitions, keeps the
//! per-stage flow routing in sync with the links it accepts, and turns an
//! orchestration into a running [`Execution`] that callers can attach to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{info, instrument};

use crate::config::{Config, PipelineConfig};
use crate::discovery::{self, Hints};
use crate::domain::{validate_name, Asset, Link, Orchestration, Phase, Stage};
use crate::error::{Code, Error, Result, ResultExt};
use crate::execution::{Dialer, Execution, ExecutionConfig, Invoker, Worker};
use crate::flow::{Connection, FlowRegistry, Input, Output};
use crate::grpc::connect_with_retry;
use crate::pubsub::{PubSubConfig, Subscription, Token};
use crate::reflection::{Message, ReflectionClient};
use crate::storage::Repository;

/// Request to create a stage from a live service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StageSpec {
    pub name: String,
    pub orchestration: String,
    /// `host:port` or a full URI.
    pub address: String,
    /// Service hint. Empty picks the only service.
    pub service: String,
    /// Method hint. Empty picks the only method.
    pub rpc: String,
    pub asset: Option<String>,
}

impl StageSpec {
    pub fn new(
        name: impl Into<String>,
        orchestration: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            orchestration: orchestration.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_rpc(mut self, rpc: impl Into<String>) -> Self {
        self.rpc = rpc.into();
        self
    }

    pub fn hints(&self) -> Hints {
        Hints::new(self.service.clone(), self.rpc.clone())
    }
}

pub struct Manager {
    repo: Arc<dyn Repository>,
    dialer: Arc<dyn Dialer>,
    execution: ExecutionConfig,
    pubsub: PubSubConfig,
    flows: Mutex<FlowRegistry>,
    /// Held while stages and links are added, and while a start snapshots
    /// the routing. Never held across a dial.
    definitions: AsyncMutex<()>,
    executions: RwLock<HashMap<String, Arc<Execution>>>,
}

impl Manager {
    pub fn new(repo: Arc<dyn Repository>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            repo,
            dialer,
            execution: ExecutionConfig::default(),
            pubsub: PubSubConfig::default(),
            flows: Mutex::new(FlowRegistry::new()),
            definitions: AsyncMutex::new(()),
            executions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.execution = config.execution.clone();
        self.pubsub = config.pubsub.clone();
        self
    }

    pub fn with_execution_config(mut self, config: ExecutionConfig) -> Self {
        self.execution = config;
        self
    }

    pub fn with_pubsub_config(mut self, config: PubSubConfig) -> Self {
        self.pubsub = config;
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    fn flows(&self) -> MutexGuard<'_, FlowRegistry> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- assets -------------------------------------------------------

    #[instrument(skip(self, asset), fields(asset = %asset.name))]
    pub async fn create_asset(&self, asset: Asset) -> Result<()> {
        validate_name("asset", &asset.name)?;
        self.repo.create_asset(asset).await
    }

    pub async fn get_asset(&self, name: &str) -> Result<Asset> {
        self.repo.get_asset(name).await
    }

    pub async fn list_assets(&self) -> Result<Vec<Asset>> {
        self.repo.list_assets().await
    }

    // ---- orchestrations -----------------------------------------------

    #[instrument(skip(self))]
    pub async fn create_orchestration(&self, name: &str) -> Result<()> {
        validate_name("orchestration", name)?;
        self.repo.create_orchestration(Orchestration::new(name)).await?;
        info!("Orchestration created");
        Ok(())
    }

    pub async fn get_orchestration(&self, name: &str) -> Result<Orchestration> {
        self.repo.get_orchestration(name).await
    }

    pub async fn list_orchestrations(&self) -> Result<Vec<Orchestration>> {
        self.repo.list_orchestrations().await
    }

    // ---- stages -------------------------------------------------------

    /// Check that a stage may join `orchestration` before doing any work.
    async fn check_new_stage(&self, name: &str, orchestration: &str, asset: Option<&str>) -> Result<()> {
        validate_name("stage", name)?;
        let orch = self.repo.get_orchestration(orchestration).await?;
        if orch.phase != Phase::Pending {
            return Err(Error::failed_precondition(format!(
                "orchestration {} is {}",
                orchestration, orch.phase
            )));
        }
        if let Some(asset) = asset {
            self.repo.get_asset(asset).await?;
        }
        Ok(())
    }

    /// Create a stage bound to the RPC the service at `spec.address` exposes.
    #[instrument(skip(self, spec), fields(stage = %spec.name, address = %spec.address))]
    pub async fn create_stage(&self, spec: StageSpec) -> Result<Stage> {
        async {
            self.check_new_stage(&spec.name, &spec.orchestration, spec.asset.as_deref())
                .await?;

            let channel =
                connect_with_retry("stage", &spec.address, self.execution.connect_retries).await?;
            let client = ReflectionClient::new(channel);
            let rpc = discovery::find_rpc(&client, &spec.hints()).await?;

            let mut stage = Stage::new(&spec.name, &spec.orchestration, rpc, &spec.address);
            stage.asset = spec.asset.clone();
            self.register_stage(stage.clone()).await?;
            Ok::<_, Error>(stage)
        }
        .await
        .with_context(|| format!("stage {}", spec.name))
    }

    /// Store a stage whose RPC is already resolved.
    #[instrument(skip(self, stage), fields(stage = %stage.name, rpc = %stage.rpc.full_name()))]
    pub async fn register_stage(&self, stage: Stage) -> Result<()> {
        let _definitions = self.definitions.lock().await;
        self.check_new_stage(&stage.name, &stage.orchestration, stage.asset.as_deref())
            .await?;
        let name = stage.name.clone();
        self.repo.create_stage(stage).await?;
        self.flows().add_stage(&name);
        info!("Stage registered");
        Ok(())
    }

    pub async fn get_stage(&self, name: &str) -> Result<Stage> {
        self.repo.get_stage(name).await
    }

    pub async fn list_stages(&self) -> Result<Vec<Stage>> {
        self.repo.list_stages().await
    }

    // ---- links --------------------------------------------------------

    /// Validate a link against both stages' schemas and wire its flow.
    #[instrument(skip(self, link), fields(link = %link.name))]
    pub async fn create_link(&self, mut link: Link) -> Result<()> {
        validate_name("link", &link.name)?;
        let _definitions = self.definitions.lock().await;
        match self.repo.get_link(&link.name).await {
            Ok(_) => return Err(Error::already_exists(format!("link {}", link.name))),
            Err(e) if e.code() == Code::NotFound => {}
            Err(e) => return Err(e),
        }

        if link.source_stage == link.target_stage {
            return Err(Error::invalid_argument(format!(
                "link {} connects stage {} to itself",
                link.name, link.source_stage
            )));
        }
        let source = self.repo.get_stage(&link.source_stage).await?;
        let target = self.repo.get_stage(&link.target_stage).await?;

        if source.orchestration != target.orchestration {
            return Err(Error::invalid_argument(format!(
                "stages {} and {} belong to different orchestrations",
                source.name, target.name
            )));
        }
        if link.orchestration.is_empty() {
            link.orchestration = source.orchestration.clone();
        } else if link.orchestration != source.orchestration {
            return Err(Error::invalid_argument(format!(
                "link {} is in orchestration {} but its stages are in {}",
                link.name, link.orchestration, source.orchestration
            )));
        }
        for stage in [&source, &target] {
            if stage.phase != Phase::Pending {
                return Err(Error::failed_precondition(format!(
                    "stage {} is {}",
                    stage.name, stage.phase
                )));
            }
        }

        let produced = narrow(source.rpc.output(), &link.source_field)
            .with_context(|| format!("source of link {}", link.name))?;
        let consumed = narrow(target.rpc.input(), &link.target_field)
            .with_context(|| format!("target of link {}", link.name))?;
        if !produced.compatible(&consumed) {
            return Err(Error::invalid_argument(format!(
                "link {}: {} is not compatible with {}",
                link.name,
                produced.full_name(),
                consumed.full_name()
            )));
        }

        let connection = Connection::between(
            link.clone(),
            &source.rpc,
            &target.rpc,
            self.execution.queue_capacity,
        )?;
        let registered = self.flows().register(connection)?;

        if let Err(e) = self.repo.create_link(link.clone()).await {
            self.flows().unregister_connection(&registered);
            return Err(e);
        }
        info!(source = %link.source_stage, target = %link.target_stage, "Link created");
        Ok(())
    }

    pub async fn get_link(&self, name: &str) -> Result<Link> {
        self.repo.get_link(name).await
    }

    pub async fn list_links(&self) -> Result<Vec<Link>> {
        self.repo.list_links().await
    }

    // ---- executions ---------------------------------------------------

    /// Runtime input and output of a stage, from its registered flows.
    fn routes(&self, stage: &Stage) -> Result<(Input, Output)> {
        let flows = self.flows();

        let source = || {
            Input::paced_source(stage.rpc.input().clone(), self.execution.source_interval())
        };
        let input = match flows.input(&stage.name) {
            None => source(),
            Some(config) if config.is_empty() => source(),
            Some(config) => config.to_input().ok_or_else(|| {
                Error::failed_precondition(format!(
                    "stage {} has {} incoming links, at most one is supported",
                    stage.name,
                    config.len()
                ))
            })?,
        };

        let output = match flows.output(&stage.name) {
            None => Output::sink(&stage.name),
            Some(config) if config.is_empty() => Output::sink(&stage.name),
            Some(config) => config.to_output().ok_or_else(|| {
                Error::failed_precondition(format!(
                    "stage {} has {} outgoing links, at most one is supported",
                    stage.name,
                    config.len()
                ))
            })?,
        };

        Ok((input, output))
    }

    /// Invokers for every stage of `orchestration`, keyed by stage name.
    async fn dial_stages(&self, orchestration: &Orchestration) -> Result<HashMap<String, Arc<dyn Invoker>>> {
        let mut invokers = HashMap::with_capacity(orchestration.stages.len());
        for stage_name in &orchestration.stages {
            let stage = self.repo.get_stage(stage_name).await?;
            let invoker = self
                .dialer
                .dial(&stage.address)
                .await
                .with_context(|| format!("stage {}", stage.name))?;
            invokers.insert(stage.name, invoker);
        }
        Ok(invokers)
    }

    /// Build and start the execution of an orchestration. Starting a running
    /// orchestration returns the existing execution.
    ///
    /// Stages are dialed before any lock is taken. Routing is then read and
    /// the orchestration marked Running in one step, so a stage or link added
    /// meanwhile either makes this start fail or is rejected itself.
    #[instrument(skip(self))]
    pub async fn start_execution(&self, name: &str) -> Result<Arc<Execution>> {
        if let Some(execution) = self.executions.read().await.get(name) {
            return Ok(execution.clone());
        }

        let orchestration = self.repo.get_orchestration(name).await?;
        let mut invokers = if orchestration.phase == Phase::Pending {
            self.dial_stages(&orchestration).await?
        } else {
            HashMap::new()
        };

        let _definitions = self.definitions.lock().await;
        if let Some(execution) = self.executions.read().await.get(name) {
            return Ok(execution.clone());
        }
        let current = self.pending_orchestration(name).await?;
        if current.stages != orchestration.stages {
            return Err(Error::failed_precondition(format!(
                "orchestration {} changed while starting",
                name
            )));
        }

        let mut workers = Vec::with_capacity(current.stages.len());
        for stage_name in &current.stages {
            let stage = self.repo.get_stage(stage_name).await?;
            let (input, output) = self.routes(&stage)?;
            let invoker = invokers
                .remove(&stage.name)
                .ok_or_else(|| Error::internal(format!("stage {} was not dialed", stage.name)))?;
            workers.push(
                Worker::new(&stage.name, stage.rpc.clone(), invoker, input, output)
                    .with_timeout(self.execution.invocation_timeout())
                    .with_max_messages(self.execution.max_messages),
            );
        }

        self.repo.mark_running(name).await?;
        let execution = Arc::new(Execution::new(name, workers, self.pubsub.clone()));
        execution.start().await?;
        self.executions
            .write()
            .await
            .insert(name.to_string(), execution.clone());

        info!(stages = current.stages.len(), "Execution started");
        Ok(execution)
    }

    async fn pending_orchestration(&self, name: &str) -> Result<Orchestration> {
        let orchestration = self.repo.get_orchestration(name).await?;
        if orchestration.phase != Phase::Pending {
            return Err(Error::failed_precondition(format!(
                "orchestration {} is {}",
                name, orchestration.phase
            )));
        }
        Ok(orchestration)
    }

    async fn execution(&self, name: &str) -> Result<Arc<Execution>> {
        self.executions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("execution {}", name)))
    }

    /// Attach to a running execution's event stream.
    #[instrument(skip(self))]
    pub async fn attach_execution(&self, name: &str) -> Result<Subscription> {
        self.execution(name).await?.subscribe().await
    }

    /// Release a subscription obtained from [`Manager::attach_execution`].
    #[instrument(skip(self))]
    pub async fn detach_execution(&self, name: &str, token: Token) -> Result<()> {
        self.execution(name).await?.pubsub().unsubscribe(token).await
    }

    /// Stop a running execution and record each stage's final phase.
    #[instrument(skip(self))]
    pub async fn stop_execution(&self, name: &str) -> Result<()> {
        let execution = self
            .executions
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("execution {}", name)))?;

        execution.stop().await?;
        let failed = execution.failed_stages();
        self.repo.mark_finished(name, &failed).await?;
        info!(failed = failed.len(), "Execution stopped");
        Ok(())
    }

    /// Create everything a declarative pipeline describes, in dependency
    /// order: assets, the orchestration, stages, then links.
    #[instrument(skip(self, pipeline), fields(orchestration = %pipeline.orchestration))]
    pub async fn apply_pipeline(&self, pipeline: &PipelineConfig) -> Result<()> {
        for asset in &pipeline.assets {
            self.create_asset(asset.clone()).await?;
        }
        self.create_orchestration(&pipeline.orchestration).await?;

        for spec in &pipeline.stages {
            let mut spec = spec.clone();
            if spec.orchestration.is_empty() {
                spec.orchestration = pipeline.orchestration.clone();
            }
            self.create_stage(spec).await?;
        }

        for link in &pipeline.links {
            let mut link = link.clone();
            if link.orchestration.is_empty() {
                link.orchestration = pipeline.orchestration.clone();
            }
            self.create_link(link).await?;
        }
        Ok(())
    }
}

/// The schema a link side carries: the whole message, or one of its fields.
fn narrow(message: &Message, field: &str) -> Result<Message> {
    if field.is_empty() {
        Ok(message.clone())
    } else {
        message.get_message_field(field)
    }
}
