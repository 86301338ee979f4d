//! Build engine for producing images from Dockerfiles.
//!
//! Orchestrates a build: parses the Dockerfile, plans the stage graph,
//! runs the stages the target needs (independent stages concurrently, each
//! as soon as its dependencies finished) and assembles the manifest of the
//! target stage.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use kiln_core::config::KilnConfig;
use kiln_core::error::{KilnError, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::assemble::{assemble, ImageManifest};
use super::dockerfile::Dockerfile;
use super::executor::{BuildServices, StageJob, StageOutput, StepReport, StepStatus};
use super::fetch::{Fetcher, HttpFetcher};
use super::plan::BuildPlan;
use super::runner::{ChrootRunner, CommandRunner};
use crate::cache::{DiskLayerStore, LayerStore};
use crate::context::{BuildContext, DirContext};
use crate::image::{DirImageSource, ImageSource};

/// Per-build options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// `--build-arg` values overriding ARG defaults
    pub build_args: HashMap<String, String>,
    /// Stage to build (alias or index); defaults to the last leaf stage
    pub target: Option<String>,
    /// Skip store lookups; results are still stored
    pub no_cache: bool,
}

impl BuildOptions {
    pub fn with_build_arg(mut self, name: &str, value: &str) -> Self {
        self.build_args.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub manifest: ImageManifest,
    /// `sha256:<hex>` of the manifest's canonical JSON
    pub digest: String,
    /// Stages built, in dependency order
    pub stages: Vec<String>,
    /// Every step of every built stage, grouped by stage in build order
    pub steps: Vec<StepReport>,
}

impl BuildResult {
    /// Filesystem steps replayed from the store.
    pub fn cache_hits(&self) -> usize {
        self.count(StepStatus::Cached)
    }

    /// Filesystem steps executed by this build.
    pub fn executed(&self) -> usize {
        self.count(StepStatus::Built)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// The build engine.
pub struct BuildEngine {
    services: BuildServices,
    max_parallel_stages: usize,
}

impl BuildEngine {
    /// Create an engine with the default `chroot` runner and HTTP fetcher.
    pub fn new(
        config: &KilnConfig,
        context: Arc<dyn BuildContext>,
        images: Arc<dyn ImageSource>,
        store: Arc<dyn LayerStore>,
    ) -> Self {
        Self {
            services: BuildServices {
                context,
                images,
                store,
                runner: Arc::new(ChrootRunner::new()),
                fetcher: Arc::new(HttpFetcher::new()),
                fetch_policy: config.fetch.clone(),
                instruction_timeout: config.instruction_timeout(),
            },
            max_parallel_stages: config.max_parallel_stages.max(1),
        }
    }

    /// Create an engine over directories: the build context (honouring
    /// `.dockerignore`), an image directory and the configured layer store.
    pub fn open(config: &KilnConfig, context_dir: &Path, image_dir: &Path) -> Result<Self> {
        let context = DirContext::new(context_dir)?;
        let store = DiskLayerStore::new(&config.store_dir)?;
        Ok(Self::new(
            config,
            Arc::new(context),
            Arc::new(DirImageSource::new(image_dir)),
            Arc::new(store),
        ))
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.services.runner = runner;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.services.fetcher = fetcher;
        self
    }

    pub fn with_max_parallel_stages(mut self, max: usize) -> Self {
        self.max_parallel_stages = max.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn LayerStore> {
        &self.services.store
    }

    pub fn images(&self) -> &Arc<dyn ImageSource> {
        &self.services.images
    }

    /// Parse and plan without executing anything.
    pub fn plan(&self, dockerfile: &str, options: &BuildOptions) -> Result<BuildPlan> {
        let parsed = Dockerfile::parse(dockerfile)?;
        BuildPlan::new(&parsed, &options.build_args, options.target.as_deref())
    }

    /// Build the image described by `dockerfile`.
    pub async fn build(&self, dockerfile: &str, options: &BuildOptions) -> Result<BuildResult> {
        self.build_with_cancel(dockerfile, options, CancellationToken::new())
            .await
    }

    /// Build, stopping at the next step boundary once `cancel` fires.
    pub async fn build_with_cancel(
        &self,
        dockerfile: &str,
        options: &BuildOptions,
        cancel: CancellationToken,
    ) -> Result<BuildResult> {
        let plan = Arc::new(self.plan(dockerfile, options)?);

        tracing::info!(
            stages = ?plan.order_names(),
            levels = plan.levels.len(),
            target_stage = %plan.target_stage().name,
            no_cache = options.no_cache,
            "Starting build"
        );

        let workspace = tempfile::Builder::new()
            .prefix("kiln-build-")
            .tempdir()
            .map_err(|e| KilnError::Build(format!("Failed to create build directory: {}", e)))?;

        let completed = self
            .run_stages(&plan, options, workspace.path(), cancel)
            .await?;

        let target = plan.target_stage();
        let manifest = assemble(
            &target.name,
            completed.get(&plan.target).map(|output| output.as_ref()),
        )?;
        let digest = manifest.digest()?;

        let steps: Vec<StepReport> = plan
            .order
            .iter()
            .filter_map(|index| completed.get(index))
            .flat_map(|output| output.steps.iter().cloned())
            .collect();
        let result = BuildResult {
            manifest,
            digest,
            stages: plan.order_names(),
            steps,
        };

        tracing::info!(
            digest = %result.digest,
            layers = result.manifest.layers.len(),
            cached = result.cache_hits(),
            executed = result.executed(),
            "Build complete"
        );
        Ok(result)
    }

    /// Run the planned stages, each once its dependencies completed.
    async fn run_stages(
        &self,
        plan: &Arc<BuildPlan>,
        options: &BuildOptions,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> Result<HashMap<usize, Arc<StageOutput>>> {
        let services = Arc::new(self.services.clone());
        let build_args = Arc::new(options.build_args.clone());
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_stages));
        // Cancelling our child token on failure leaves the caller's untouched
        let cancel = cancel.child_token();

        let mut waiting: HashMap<usize, usize> = plan
            .order
            .iter()
            .map(|&index| (index, plan.stages[index].dependencies.len()))
            .collect();
        let mut ready: BTreeSet<usize> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&index, _)| index)
            .collect();
        waiting.retain(|_, count| *count > 0);

        let mut completed: HashMap<usize, Arc<StageOutput>> = HashMap::new();
        let mut failure: Option<KilnError> = None;
        let mut join_set = JoinSet::new();

        loop {
            if failure.is_none() {
                while let Some(index) = ready.pop_first() {
                    let job = StageJob {
                        index,
                        plan: Arc::clone(plan),
                        services: Arc::clone(&services),
                        build_args: Arc::clone(&build_args),
                        no_cache: options.no_cache,
                        workspace: workspace.to_path_buf(),
                        completed: plan.stages[index]
                            .dependencies
                            .iter()
                            .filter_map(|dep| completed.get(dep).map(|o| (*dep, Arc::clone(o))))
                            .collect(),
                        cancel: cancel.clone(),
                    };
                    let semaphore = Arc::clone(&semaphore);
                    join_set.spawn(async move {
                        let result = match semaphore.acquire_owned().await {
                            Ok(_permit) => job.run().await,
                            Err(_) => Err(KilnError::Cancelled),
                        };
                        (index, result)
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let error = match joined {
                Ok((index, Ok(output))) => {
                    completed.insert(index, Arc::new(output));
                    for (&dependent, count) in waiting.iter_mut() {
                        if plan.stages[dependent].dependencies.contains(&index) {
                            *count -= 1;
                            if *count == 0 {
                                ready.insert(dependent);
                            }
                        }
                    }
                    waiting.retain(|_, count| *count > 0);
                    continue;
                }
                Ok((index, Err(e))) => {
                    tracing::warn!(stage = %plan.stages[index].name, error = %e, "Stage failed");
                    e
                }
                Err(e) => KilnError::Build(format!("Stage task failed: {}", e)),
            };

            cancel.cancel();
            failure = match failure {
                None => Some(error),
                // A real failure explains a cancellation, not the reverse
                Some(KilnError::Cancelled) if !matches!(error, KilnError::Cancelled) => {
                    Some(error)
                }
                kept => kept,
            };
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(completed),
        }
    }
}
