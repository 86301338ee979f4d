//! Stage execution.
//!
//! A [`StageJob`] builds one stage: it materializes the base into a rootfs
//! directory, then walks the steps in order. Every step is fingerprinted;
//! filesystem steps are looked up in the layer store and either replayed
//! from the stored blob or executed and stored. Metadata steps only update
//! the immutable [`ImageMetadata`] / [`ArgScope`] snapshots.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::config::FetchConfig;
use kiln_core::error::{KilnError, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::assemble::{BaseReference, HistoryEntry, LayerRecord};
use super::dockerfile::{normalize_port, Instruction, Step};
use super::expand::{expand, ExpandError};
use super::fetch::{fetch_with_retry, is_remote, url_file_name, Fetcher};
use super::fingerprint::{Fingerprint, StepKey};
use super::layer::{
    apply_layer, copy_dir_recursive, create_layer, resolve_entry_in_rootfs, resolve_in_rootfs,
    sha256_bytes, DirSnapshot,
};
use super::metadata::{ArgScope, ImageMetadata};
use super::plan::{BuildPlan, PlannedStage, StageRef};
use super::runner::{CommandRunner, RunSpec};
use crate::archive;
use crate::cache::{LayerMeta, LayerStore, PutOutcome, StoredLayer};
use crate::context::{BuildContext, ContextFile, DirContext};
use crate::image::ImageSource;

/// Lines of stderr kept in a [`KilnError::BuildFailed`].
const STDERR_TAIL_LINES: usize = 20;

/// Mode of remote ADD downloads without `--chmod`.
const REMOTE_FILE_MODE: u32 = 0o600;

/// Collaborators shared by all stages of a build.
#[derive(Clone)]
pub struct BuildServices {
    pub context: Arc<dyn BuildContext>,
    pub images: Arc<dyn ImageSource>,
    pub store: Arc<dyn LayerStore>,
    pub runner: Arc<dyn CommandRunner>,
    pub fetcher: Arc<dyn Fetcher>,
    pub fetch_policy: FetchConfig,
    /// Limit for a single RUN or remote ADD
    pub instruction_timeout: Option<Duration>,
}

/// How a step was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// FROM: base materialized
    Base,
    /// Executed and stored
    Built,
    /// Replayed from the layer store
    Cached,
    /// Metadata only, no layer
    Metadata,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub stage: String,
    pub line: usize,
    pub instruction: String,
    pub fingerprint: Fingerprint,
    pub status: StepStatus,
    /// RUN output, replayed from the store on cache hits
    pub stdout: String,
    pub stderr: String,
}

/// A completed stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub index: usize,
    pub name: String,
    /// Declared alias; `name` falls back to the index without one
    pub alias: Option<String>,
    /// Materialized filesystem, alive until the build finishes
    pub rootfs: PathBuf,
    pub metadata: ImageMetadata,
    /// Fingerprint of the last step
    pub fingerprint: Fingerprint,
    pub base: Option<BaseReference>,
    /// Non-empty layers, inherited ones first
    pub layers: Vec<LayerRecord>,
    pub history: Vec<HistoryEntry>,
    pub steps: Vec<StepReport>,
}

/// Everything needed to build one stage on its own task.
pub struct StageJob {
    pub index: usize,
    pub plan: Arc<BuildPlan>,
    pub services: Arc<BuildServices>,
    pub build_args: Arc<HashMap<String, String>>,
    pub no_cache: bool,
    /// Per-build scratch directory
    pub workspace: PathBuf,
    /// Outputs of the stages this one depends on
    pub completed: HashMap<usize, Arc<StageOutput>>,
    pub cancel: CancellationToken,
}

/// Mutable cursor threaded through a stage's steps.
struct StageState {
    metadata: ImageMetadata,
    args: ArgScope,
    fingerprint: Fingerprint,
    base: Option<BaseReference>,
    layers: Vec<LayerRecord>,
    history: Vec<HistoryEntry>,
    steps: Vec<StepReport>,
    /// Whether CMD was set in this stage (not inherited)
    cmd_set: bool,
}

/// Files or downloaded bytes selected by one COPY/ADD operand.
enum Source {
    Files {
        context: Arc<dyn BuildContext>,
        files: Vec<ContextFile>,
    },
    Remote {
        url: String,
        bytes: Vec<u8>,
    },
}

impl Source {
    /// Number of entries that land directly in the destination.
    fn top_level_count(&self) -> usize {
        match self {
            Source::Files { files, .. } => {
                files.iter().filter(|f| f.relative().is_empty()).count()
            }
            Source::Remote { .. } => 1,
        }
    }
}

/// What a filesystem step does when it is not cached.
enum Action {
    Workdir(String),
    Run(RunSpec),
    Copy {
        sources: Vec<Source>,
        dst: String,
        chmod: Option<u32>,
    },
}

impl StageJob {
    fn planned(&self) -> &PlannedStage {
        &self.plan.stages[self.index]
    }

    fn name(&self) -> &str {
        &self.planned().name
    }

    /// Build the stage.
    pub async fn run(self) -> Result<StageOutput> {
        let planned = self.planned();
        let rootfs = self.workspace.join(format!("stage-{}", self.index));
        let total = planned.stage.steps.len();

        let Some((from_step, steps)) = planned.stage.steps.split_first() else {
            return Err(KilnError::IncompleteStage {
                stage: planned.name.clone(),
            });
        };

        self.check_cancelled(from_step)?;
        let mut state = self.materialize_base(&rootfs, from_step).await?;

        for (offset, step) in steps.iter().enumerate() {
            self.check_cancelled(step)?;
            let position = offset + 1;
            self.execute_step(&mut state, &rootfs, position, step).await?;

            if let Some(report) = state.steps.last() {
                tracing::info!(
                    stage = %planned.name,
                    step = position + 1,
                    total,
                    fingerprint = %report.fingerprint.short(),
                    cached = report.status == StepStatus::Cached,
                    "{}",
                    report.instruction
                );
            }
        }

        tracing::info!(
            stage = %planned.name,
            layers = state.layers.len(),
            fingerprint = %state.fingerprint.short(),
            "Stage complete"
        );

        Ok(StageOutput {
            index: self.index,
            name: planned.name.clone(),
            alias: planned.stage.alias.clone(),
            rootfs,
            metadata: state.metadata,
            fingerprint: state.fingerprint,
            base: state.base,
            layers: state.layers,
            history: state.history,
            steps: state.steps,
        })
    }

    fn check_cancelled(&self, step: &Step) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::info!(stage = %self.name(), line = step.line, "Stage cancelled");
            return Err(KilnError::Cancelled);
        }
        Ok(())
    }

    fn completed_stage(&self, index: usize) -> Result<&Arc<StageOutput>> {
        self.completed
            .get(&index)
            .ok_or_else(|| KilnError::IncompleteStage {
                stage: self.plan.stages[index].name.clone(),
            })
    }

    async fn materialize_base(&self, rootfs: &Path, from_step: &Step) -> Result<StageState> {
        let planned = self.planned();
        let mut state = match &planned.base {
            StageRef::Stage(index) => {
                let parent = self.completed_stage(*index)?;
                let (src, dst) = (parent.rootfs.clone(), rootfs.to_path_buf());
                blocking(move || copy_dir_recursive(&src, &dst)).await?;
                StageState {
                    metadata: parent.metadata.clone(),
                    args: ArgScope::default(),
                    fingerprint: parent.fingerprint.clone(),
                    base: parent.base.clone(),
                    layers: parent.layers.clone(),
                    history: parent.history.clone(),
                    steps: Vec::new(),
                    cmd_set: false,
                }
            }
            StageRef::Image(reference) => {
                let image = self.services.images.fetch(reference).await?;
                image.unpack_into(rootfs).await?;
                StageState {
                    metadata: image.metadata.clone(),
                    args: ArgScope::default(),
                    fingerprint: Fingerprint::for_image(&image.digest),
                    base: Some(BaseReference {
                        reference: image.reference.clone(),
                        digest: image.digest.clone(),
                    }),
                    layers: Vec::new(),
                    history: Vec::new(),
                    steps: Vec::new(),
                    cmd_set: false,
                }
            }
        };

        let created_by = format!("FROM {}", self.describe(&planned.base));
        tracing::info!(
            stage = %planned.name,
            fingerprint = %state.fingerprint.short(),
            "{}",
            created_by
        );
        state.history.push(HistoryEntry {
            created_by: created_by.clone(),
            empty_layer: true,
        });
        state.steps.push(StepReport {
            stage: planned.name.clone(),
            line: from_step.line,
            instruction: created_by,
            fingerprint: state.fingerprint.clone(),
            status: StepStatus::Base,
            stdout: String::new(),
            stderr: String::new(),
        });
        Ok(state)
    }

    /// Stable name of a stage reference: the stage name or image reference.
    fn describe(&self, reference: &StageRef) -> String {
        match reference {
            StageRef::Stage(index) => self.plan.stages[*index].name.clone(),
            StageRef::Image(image) => image.clone(),
        }
    }

    async fn execute_step(
        &self,
        state: &mut StageState,
        rootfs: &Path,
        position: usize,
        step: &Step,
    ) -> Result<()> {
        let instruction = self.expand_instruction(state, position, step)?;

        match &instruction {
            Instruction::From { .. } => Err(KilnError::Syntax {
                line: step.line,
                message: "FROM can only start a stage".to_string(),
            }),
            Instruction::Arg { name, default } => {
                let value = default
                    .clone()
                    .or_else(|| self.plan.global_args.get(name));
                let args = state.args.declare(name, value, &self.build_args);
                self.record_metadata(state, step, &instruction)?;
                state.args = args;
                Ok(())
            }
            Instruction::Env { pairs } => {
                let metadata = state.metadata.with_env(pairs);
                self.record_metadata(state, step, &instruction)?;
                state.metadata = metadata;
                Ok(())
            }
            Instruction::Label { pairs } => {
                let metadata = state.metadata.with_labels(pairs);
                self.record_metadata(state, step, &instruction)?;
                state.metadata = metadata;
                Ok(())
            }
            Instruction::Expose { ports } => {
                let metadata = state.metadata.with_ports(ports);
                self.record_metadata(state, step, &instruction)?;
                state.metadata = metadata;
                Ok(())
            }
            Instruction::User { user } => {
                let metadata = state.metadata.with_user(user.clone());
                self.record_metadata(state, step, &instruction)?;
                state.metadata = metadata;
                Ok(())
            }
            Instruction::Cmd { exec } => {
                let metadata = state.metadata.with_cmd(exec.clone());
                self.record_metadata(state, step, &instruction)?;
                state.metadata = metadata;
                state.cmd_set = true;
                Ok(())
            }
            Instruction::Entrypoint { exec } => {
                let metadata = state.metadata.with_entrypoint(exec.clone(), state.cmd_set);
                self.record_metadata(state, step, &instruction)?;
                state.metadata = metadata;
                Ok(())
            }
            Instruction::Workdir { path } => {
                let workdir = normalize_workdir(&state.metadata.resolve_path(path));
                let normalized = StepKey {
                    instruction: &instruction,
                    workdir: &state.metadata.workdir,
                    env: None,
                    args: None,
                    user: None,
                }
                .normalize()?;
                self.filesystem_step(
                    state,
                    rootfs,
                    step,
                    &instruction,
                    normalized,
                    Vec::new(),
                    Action::Workdir(workdir.clone()),
                )
                .await?;
                state.metadata = state.metadata.with_workdir(workdir);
                Ok(())
            }
            Instruction::Run { command } => {
                let bindings = state.args.bindings();
                let normalized = StepKey {
                    instruction: &instruction,
                    workdir: &state.metadata.workdir,
                    env: Some(&state.metadata.env),
                    args: Some(&bindings),
                    user: state.metadata.user.as_deref(),
                }
                .normalize()?;

                // Image env wins over build args of the same name
                let mut env = bindings;
                env.extend(state.metadata.env.clone());
                let spec = RunSpec {
                    argv: command.argv(),
                    workdir: state.metadata.workdir.clone(),
                    env,
                    user: state.metadata.user.clone(),
                };
                self.filesystem_step(
                    state,
                    rootfs,
                    step,
                    &instruction,
                    normalized,
                    Vec::new(),
                    Action::Run(spec),
                )
                .await
            }
            Instruction::Copy {
                src, dst, chmod, ..
            } => {
                let from = self.planned().copy_sources.get(&position);
                let (sources, inputs) = self.gather_sources(step, src, from, false).await?;
                self.copy_step(state, rootfs, step, &instruction, sources, inputs, dst, *chmod)
                    .await
            }
            Instruction::Add {
                src, dst, chmod, ..
            } => {
                let (sources, inputs) = self.gather_sources(step, src, None, true).await?;
                self.copy_step(state, rootfs, step, &instruction, sources, inputs, dst, *chmod)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_step(
        &self,
        state: &mut StageState,
        rootfs: &Path,
        step: &Step,
        instruction: &Instruction,
        sources: Vec<Source>,
        inputs: Vec<(String, String)>,
        dst: &str,
        chmod: Option<u32>,
    ) -> Result<()> {
        let top_level: usize = sources.iter().map(Source::top_level_count).sum();
        let dest_path = rootfs_path(rootfs, &state.metadata.resolve_path(dst)).await?;
        if top_level > 1 && !dst.ends_with('/') && !dest_path.is_dir() {
            return Err(KilnError::Syntax {
                line: step.line,
                message: format!(
                    "{} with more than one source requires the destination to end with '/'",
                    instruction.keyword()
                ),
            });
        }

        let normalized = StepKey {
            instruction,
            workdir: &state.metadata.workdir,
            env: None,
            args: None,
            user: None,
        }
        .normalize()?;
        let action = Action::Copy {
            sources,
            dst: dst.to_string(),
            chmod,
        };
        self.filesystem_step(state, rootfs, step, instruction, normalized, inputs, action)
            .await
    }

    /// Record a step that changes only metadata.
    fn record_metadata(
        &self,
        state: &mut StageState,
        step: &Step,
        instruction: &Instruction,
    ) -> Result<()> {
        let normalized = StepKey {
            instruction,
            workdir: &state.metadata.workdir,
            env: None,
            args: None,
            user: None,
        }
        .normalize()?;
        let fingerprint = Fingerprint::compute(Some(&state.fingerprint), &normalized, &[]);
        let created_by = instruction.to_string();

        state.history.push(HistoryEntry {
            created_by: created_by.clone(),
            empty_layer: true,
        });
        state.steps.push(StepReport {
            stage: self.name().to_string(),
            line: step.line,
            instruction: created_by,
            fingerprint: fingerprint.clone(),
            status: StepStatus::Metadata,
            stdout: String::new(),
            stderr: String::new(),
        });
        state.fingerprint = fingerprint;
        Ok(())
    }

    /// Resolve a filesystem step against the store, executing it on a miss.
    #[allow(clippy::too_many_arguments)]
    async fn filesystem_step(
        &self,
        state: &mut StageState,
        rootfs: &Path,
        step: &Step,
        instruction: &Instruction,
        normalized: String,
        inputs: Vec<(String, String)>,
        action: Action,
    ) -> Result<()> {
        let fingerprint = Fingerprint::compute(Some(&state.fingerprint), &normalized, &inputs);
        let created_by = instruction.to_string();
        let store = &self.services.store;

        if !self.no_cache {
            if let Some(stored) = store.get(&fingerprint).await? {
                if !stored.blob.is_empty() {
                    let (blob, root) = (stored.blob, rootfs.to_path_buf());
                    blocking(move || apply_layer(&blob, &root)).await?;
                }
                replay_logs(self.name(), step.line, &stored.meta);
                self.record_layer(state, step, fingerprint, &stored.meta, StepStatus::Cached);
                return Ok(());
            }
        }

        let root = rootfs.to_path_buf();
        let before = blocking(move || DirSnapshot::capture(&root)).await?;

        let (stdout, stderr) = self.perform(state, rootfs, step, action).await?;

        let root = rootfs.to_path_buf();
        let blob = blocking(move || {
            let after = DirSnapshot::capture(&root)?;
            let delta = before.diff(&after);
            if delta.is_empty() {
                Ok(Vec::new())
            } else {
                create_layer(&root, &delta)
            }
        })
        .await?;

        let layer = StoredLayer::new(fingerprint.clone(), created_by, blob, stdout, stderr);
        let meta = layer.meta.clone();
        let meta = match store.put_if_absent(layer).await? {
            PutOutcome::Inserted => meta,
            PutOutcome::AlreadyPresent => {
                tracing::debug!(
                    stage = %self.name(),
                    fingerprint = %fingerprint.short(),
                    "Layer already stored by another writer"
                );
                store
                    .get(&fingerprint)
                    .await?
                    .map(|stored| stored.meta)
                    .unwrap_or(meta)
            }
        };
        self.record_layer(state, step, fingerprint, &meta, StepStatus::Built);
        Ok(())
    }

    fn record_layer(
        &self,
        state: &mut StageState,
        step: &Step,
        fingerprint: Fingerprint,
        meta: &LayerMeta,
        status: StepStatus,
    ) {
        let empty_layer = meta.is_empty_layer();
        if !empty_layer {
            state.layers.push(LayerRecord {
                fingerprint: fingerprint.clone(),
                digest: meta.digest.clone(),
                size_bytes: meta.size_bytes,
            });
        }
        state.history.push(HistoryEntry {
            created_by: meta.created_by.clone(),
            empty_layer,
        });
        state.steps.push(StepReport {
            stage: self.name().to_string(),
            line: step.line,
            instruction: meta.created_by.clone(),
            fingerprint: fingerprint.clone(),
            status,
            stdout: meta.stdout.clone(),
            stderr: meta.stderr.clone(),
        });
        state.fingerprint = fingerprint;
    }

    /// Execute a filesystem step, returning its captured output.
    async fn perform(
        &self,
        state: &StageState,
        rootfs: &Path,
        step: &Step,
        action: Action,
    ) -> Result<(String, String)> {
        match action {
            Action::Workdir(workdir) => {
                let dir = rootfs_path(rootfs, &workdir).await?;
                tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                    KilnError::Build(format!(
                        "Failed to create WORKDIR {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
                Ok((String::new(), String::new()))
            }
            Action::Run(spec) => {
                let output = self
                    .with_timeout(step, self.services.runner.run(rootfs, &spec))
                    .await?;
                for text in output.stdout.lines() {
                    tracing::debug!(stage = %self.name(), line = step.line, "{}", text);
                }
                if !output.success() {
                    return Err(KilnError::BuildFailed {
                        stage: self.name().to_string(),
                        line: step.line,
                        exit_code: output.exit_code,
                        stderr: output.stderr_tail(STDERR_TAIL_LINES),
                    });
                }
                Ok((output.stdout, output.stderr))
            }
            Action::Copy {
                sources,
                dst,
                chmod,
            } => {
                let dest = state.metadata.resolve_path(&dst);
                let dest_is_dir =
                    dst.ends_with('/') || rootfs_path(rootfs, &dest).await?.is_dir();
                for source in &sources {
                    place_source(source, rootfs, &dest, dest_is_dir, chmod).await?;
                }
                Ok((String::new(), String::new()))
            }
        }
    }

    async fn with_timeout<T, F>(&self, step: &Step, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.services.instruction_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| KilnError::Timeout {
                    stage: self.name().to_string(),
                    line: step.line,
                    after: limit,
                })?,
            None => operation.await,
        }
    }

    /// Resolve COPY/ADD operands to sources and fingerprint inputs.
    async fn gather_sources(
        &self,
        step: &Step,
        operands: &[String],
        from: Option<&StageRef>,
        allow_remote: bool,
    ) -> Result<(Vec<Source>, Vec<(String, String)>)> {
        let (context, source_root) = self.source_context(from).await?;
        let mut sources = Vec::with_capacity(operands.len());
        let mut inputs = Vec::new();

        for operand in operands {
            if allow_remote && is_remote(operand) {
                let bytes = self
                    .with_timeout(
                        step,
                        fetch_with_retry(
                            self.services.fetcher.as_ref(),
                            operand,
                            &self.services.fetch_policy,
                        ),
                    )
                    .await?;
                inputs.push((operand.clone(), sha256_bytes(&bytes)));
                sources.push(Source::Remote {
                    url: operand.clone(),
                    bytes,
                });
                continue;
            }

            let pattern = match &source_root {
                Some(root) => through_links(root, operand).await?,
                None => operand.clone(),
            };
            let files = context.resolve(&pattern).await?;
            if files.is_empty() {
                return Err(KilnError::SourceNotFound {
                    stage: self.name().to_string(),
                    line: step.line,
                    path: operand.clone(),
                });
            }
            inputs.extend(
                files
                    .iter()
                    .map(|f| (f.path.clone(), format!("{}:{:o}", f.hash, f.mode))),
            );
            sources.push(Source::Files {
                context: Arc::clone(&context),
                files,
            });
        }

        Ok((sources, inputs))
    }

    /// Context to copy from, plus its root when it is a filesystem image.
    async fn source_context(
        &self,
        from: Option<&StageRef>,
    ) -> Result<(Arc<dyn BuildContext>, Option<PathBuf>)> {
        match from {
            None => Ok((Arc::clone(&self.services.context), None)),
            Some(StageRef::Stage(index)) => {
                let stage = self.completed_stage(*index)?;
                Ok((
                    Arc::new(DirContext::unfiltered(&stage.rootfs)),
                    Some(stage.rootfs.clone()),
                ))
            }
            Some(StageRef::Image(reference)) => {
                let image = self.services.images.fetch(reference).await?;
                let dir = self
                    .workspace
                    .join(format!("image-{}", uuid::Uuid::new_v4()));
                image.unpack_into(&dir).await?;
                Ok((Arc::new(DirContext::unfiltered(&dir)), Some(dir)))
            }
        }
    }

    /// Expand variables in the operands of `step`.
    fn expand_instruction(
        &self,
        state: &StageState,
        position: usize,
        step: &Step,
    ) -> Result<Instruction> {
        let word = |text: &str| self.expand_word(state, step.line, text);
        let words = |texts: &[String]| -> Result<Vec<String>> {
            texts.iter().map(|t| word(t)).collect()
        };
        let pairs = |pairs: &[(String, String)], keys: bool| -> Result<Vec<(String, String)>> {
            pairs
                .iter()
                .map(|(k, v)| {
                    let key = if keys { word(k)? } else { k.clone() };
                    Ok((key, word(v)?))
                })
                .collect()
        };

        Ok(match &step.instruction {
            Instruction::Copy {
                src,
                dst,
                chown,
                chmod,
                ..
            } => Instruction::Copy {
                src: words(src)?,
                dst: word(dst)?,
                from: self
                    .planned()
                    .copy_sources
                    .get(&position)
                    .map(|source| self.describe(source)),
                chown: chown.as_deref().map(word).transpose()?,
                chmod: *chmod,
            },
            Instruction::Add {
                src,
                dst,
                chown,
                chmod,
            } => Instruction::Add {
                src: words(src)?,
                dst: word(dst)?,
                chown: chown.as_deref().map(word).transpose()?,
                chmod: *chmod,
            },
            Instruction::Env { pairs: env } => Instruction::Env {
                pairs: pairs(env, false)?,
            },
            Instruction::Label { pairs: labels } => Instruction::Label {
                pairs: pairs(labels, true)?,
            },
            Instruction::Expose { ports } => {
                let mut normalized = Vec::with_capacity(ports.len());
                for port in words(ports)? {
                    for part in port.split_whitespace() {
                        normalized.push(normalize_port(part).map_err(|message| {
                            KilnError::Syntax {
                                line: step.line,
                                message,
                            }
                        })?);
                    }
                }
                Instruction::Expose { ports: normalized }
            }
            Instruction::User { user } => Instruction::User { user: word(user)? },
            Instruction::Workdir { path } => Instruction::Workdir { path: word(path)? },
            other => other.clone(),
        })
    }

    /// Expand one word with the stage env, then its build args.
    fn expand_word(&self, state: &StageState, line: usize, text: &str) -> Result<String> {
        expand(text, |name| {
            state
                .metadata
                .env
                .get(name)
                .cloned()
                .or_else(|| state.args.get(name))
        })
        .map_err(|e| match e {
            ExpandError::Undefined(name) => KilnError::UndefinedArgument {
                stage: self.name().to_string(),
                line,
                name,
            },
            ExpandError::Malformed(text) => KilnError::Syntax {
                line,
                message: format!("Malformed variable reference '{}'", text),
            },
        })
    }
}

/// Emit the captured output of a replayed step.
fn replay_logs(stage: &str, line: usize, meta: &LayerMeta) {
    for output in meta.stdout.lines().chain(meta.stderr.lines()) {
        tracing::debug!(stage, line, cached = true, "{}", output);
    }
}

/// Strip a trailing `/` from a resolved working directory.
fn normalize_workdir(resolved: &str) -> String {
    match resolved.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Container path a selected file lands at under the destination.
fn copy_target(dest: &str, dest_is_dir: bool, file: &ContextFile) -> String {
    let relative = file.relative();
    let base = dest.trim_end_matches('/');
    if !relative.is_empty() {
        return format!("{}/{}", base, relative);
    }
    if dest_is_dir {
        let name = file.path.rsplit('/').next().unwrap_or_default();
        format!("{}/{}", base, name)
    } else {
        dest.to_string()
    }
}

/// Rewrite a literal source operand so symlinked directories along it are
/// followed inside `root`. A final symlink is copied as a link unless the
/// operand ends in `/`.
async fn through_links(root: &Path, operand: &str) -> Result<String> {
    if operand.contains(['*', '?', '[']) {
        return Ok(operand.to_string());
    }
    let path = format!("/{}", operand.trim_start_matches('/'));
    let entry = if operand.ends_with('/') {
        rootfs_path(root, &path).await?
    } else {
        rootfs_entry(root, &path).await?
    };
    let relative = match entry.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative,
        _ => return Ok(operand.to_string()),
    };
    let mut pattern = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if operand.ends_with('/') {
        pattern.push('/');
    }
    Ok(pattern)
}

/// Host path of a container path; symlinks resolve inside `rootfs`.
async fn rootfs_path(rootfs: &Path, path: &str) -> Result<PathBuf> {
    let (root, path) = (rootfs.to_path_buf(), path.to_string());
    blocking(move || resolve_in_rootfs(&root, &path)).await
}

/// Host path of the entry a container path names, without following a
/// final symlink.
async fn rootfs_entry(rootfs: &Path, path: &str) -> Result<PathBuf> {
    let (root, path) = (rootfs.to_path_buf(), path.to_string());
    blocking(move || resolve_entry_in_rootfs(&root, &path)).await
}

/// Place one source at the container path `dest` inside `rootfs`.
async fn place_source(
    source: &Source,
    rootfs: &Path,
    dest: &str,
    dest_is_dir: bool,
    chmod: Option<u32>,
) -> Result<()> {
    match source {
        Source::Files { context, files } => {
            for file in files {
                let target = rootfs_entry(rootfs, &copy_target(dest, dest_is_dir, file)).await?;
                prepare_target(&target).await?;
                match &file.link_target {
                    Some(link) => create_symlink(link, &target).await?,
                    None => {
                        let content = context.read(&file.path).await?;
                        write_file(&target, &content, chmod.unwrap_or(file.mode)).await?;
                    }
                }
            }
            Ok(())
        }
        Source::Remote { url, bytes } => {
            if archive::ArchiveKind::detect(bytes).is_some() {
                let (data, dir) = (bytes.clone(), rootfs_path(rootfs, dest).await?);
                blocking(move || archive::unpack(&data, &dir).map(|_| ())).await?;
                return Ok(());
            }

            let target = if dest_is_dir {
                let name = url_file_name(url).ok_or_else(|| KilnError::Fetch {
                    url: url.clone(),
                    message: "cannot derive a file name; use a destination file path".to_string(),
                })?;
                format!("{}/{}", dest.trim_end_matches('/'), name)
            } else {
                dest.to_string()
            };
            let target = rootfs_entry(rootfs, &target).await?;
            prepare_target(&target).await?;
            write_file(&target, bytes, chmod.unwrap_or(REMOTE_FILE_MODE)).await
        }
    }
}

/// Create parent directories and remove a symlink occupying `target`.
async fn prepare_target(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            KilnError::Build(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    if let Ok(existing) = tokio::fs::symlink_metadata(target).await {
        if existing.file_type().is_symlink() {
            tokio::fs::remove_file(target).await?;
        }
    }
    Ok(())
}

async fn write_file(target: &Path, content: &[u8], mode: u32) -> Result<()> {
    tokio::fs::write(target, content).await.map_err(|e| {
        KilnError::Build(format!("Failed to write {}: {}", target.display(), e))
    })?;
    set_mode(target, mode).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| {
            KilnError::Build(format!(
                "Failed to set mode {:o} on {}: {}",
                mode,
                path.display(),
                e
            ))
        })
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(link_target: &str, path: &Path) -> Result<()> {
    tokio::fs::symlink(link_target, path).await.map_err(|e| {
        KilnError::Build(format!(
            "Failed to link {} -> {}: {}",
            path.display(),
            link_target,
            e
        ))
    })
}

#[cfg(not(unix))]
async fn create_symlink(link_target: &str, path: &Path) -> Result<()> {
    Err(KilnError::Build(format!(
        "Symbolic links are not supported on this platform: {} -> {}",
        path.display(),
        link_target
    )))
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| KilnError::Build(format!("Blocking task failed: {}", e)))?
}
