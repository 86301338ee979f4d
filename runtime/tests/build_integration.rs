//! Integration tests: end-to-end builds through `BuildEngine`.
//!
//! RUN commands go to a scripted runner instead of `chroot`, so these tests
//! need neither root privileges nor a real base image. The runner
//! understands a handful of shell-form commands:
//!
//! - `write <path> <content>`: create a file inside the rootfs
//! - `require <path>`: exit 1 unless the file exists
//! - `link <target> <path>`: create a symlink inside the rootfs
//! - `sleep <ms>`: wait, then succeed
//! - `fail <code>`: exit with `code`
//! - anything else succeeds without touching the filesystem

#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::config::KilnConfig;
use kiln_core::error::{KilnError, Result};
use kiln_runtime::build::{
    export_oci_layout, BuildEngine, BuildOptions, CommandRunner, FetchFailure, Fetcher,
    ImageMetadata, RunOutput, RunSpec, StepStatus,
};
use kiln_runtime::cache::{DiskLayerStore, LayerStore, MemoryLayerStore};
use kiln_runtime::context::MemoryContext;
use kiln_runtime::image::{BaseImage, MemoryImageSource};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<RunSpec>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.argv.last().cloned().unwrap_or_default())
            .collect()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn interpret(&self, rootfs: &Path, spec: &RunSpec) -> RunOutput {
        let script = spec.argv.last().cloned().unwrap_or_default();
        let words: Vec<&str> = script.splitn(3, ' ').collect();
        let in_rootfs = |path: &str| {
            let absolute = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("{}/{}", spec.workdir.trim_end_matches('/'), path)
            };
            rootfs.join(absolute.trim_start_matches('/'))
        };

        match words.as_slice() {
            ["write", path, content] => {
                let file = in_rootfs(path);
                std::fs::create_dir_all(file.parent().unwrap()).unwrap();
                std::fs::write(&file, content).unwrap();
                ok(&format!("wrote {}\n", path))
            }
            ["link", target, path] => {
                let link = in_rootfs(path);
                std::fs::create_dir_all(link.parent().unwrap()).unwrap();
                std::os::unix::fs::symlink(target, &link).unwrap();
                ok("")
            }
            ["require", path] => {
                if in_rootfs(path).exists() {
                    ok("")
                } else {
                    failed(1, &format!("{}: No such file or directory\n", path))
                }
            }
            ["sleep", millis] => {
                tokio::time::sleep(Duration::from_millis(millis.parse().unwrap())).await;
                ok("")
            }
            ["fail", code] => failed(code.parse().unwrap(), "compiler error\nlast line\n"),
            _ => ok(""),
        }
    }
}

fn ok(stdout: &str) -> RunOutput {
    RunOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(exit_code: i32, stderr: &str) -> RunOutput {
    RunOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, rootfs: &Path, spec: &RunSpec) -> Result<RunOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let output = self.interpret(rootfs, spec).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(output)
    }
}

struct StaticFetcher {
    body: Vec<u8>,
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> std::result::Result<Vec<u8>, FetchFailure> {
        Ok(self.body.clone())
    }
}

struct Harness {
    runner: Arc<ScriptedRunner>,
    store: Arc<dyn LayerStore>,
    images: Arc<MemoryImageSource>,
    context: MemoryContext,
    config: KilnConfig,
}

impl Harness {
    fn new() -> Self {
        let mut metadata = ImageMetadata::default();
        metadata.env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        let base = BaseImage::from_files(
            "base:1",
            &[("bin/sh", "#!shell"), ("etc/os-release", "ID=base")],
            metadata,
        )
        .unwrap();

        Self {
            runner: Arc::new(ScriptedRunner::default()),
            store: Arc::new(MemoryLayerStore::new()),
            images: Arc::new(MemoryImageSource::new().with_image(base)),
            context: MemoryContext::new()
                .with_file("app.txt", "version 1")
                .with_file("src/main.rs", "fn main() {}"),
            config: KilnConfig::default(),
        }
    }

    fn with_context(mut self, context: MemoryContext) -> Self {
        self.context = context;
        self
    }

    fn with_store(mut self, store: Arc<dyn LayerStore>) -> Self {
        self.store = store;
        self
    }

    fn engine(&self) -> BuildEngine {
        BuildEngine::new(
            &self.config,
            Arc::new(self.context.clone()),
            self.images.clone(),
            self.store.clone(),
        )
        .with_runner(self.runner.clone())
    }
}

const APP: &str = "\
FROM base:1
WORKDIR /app
RUN write deps.txt fetched
COPY app.txt ./
RUN write build.txt compiled
CMD [\"/app/run\"]
";

#[tokio::test]
async fn test_repeat_build_is_fully_cached() {
    let harness = Harness::new();
    let engine = harness.engine();

    let first = engine.build(APP, &BuildOptions::default()).await.unwrap();
    assert_eq!(first.executed(), 4);
    assert_eq!(first.cache_hits(), 0);
    assert_eq!(harness.runner.call_count(), 2);

    let second = engine.build(APP, &BuildOptions::default()).await.unwrap();
    assert_eq!(second.executed(), 0);
    assert_eq!(second.cache_hits(), 4);
    assert_eq!(harness.runner.call_count(), 2);

    assert_eq!(first.digest, second.digest);
    assert_eq!(first.manifest, second.manifest);
}

#[tokio::test]
async fn test_fresh_stores_produce_identical_manifests() {
    let first = Harness::new()
        .engine()
        .build(APP, &BuildOptions::default())
        .await
        .unwrap();
    let second = Harness::new()
        .engine()
        .build(APP, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(first.digest, second.digest);
    assert_eq!(
        first.manifest.canonical_json().unwrap(),
        second.manifest.canonical_json().unwrap()
    );
}

#[tokio::test]
async fn test_changed_input_invalidates_from_that_step() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let before = harness.engine().build(APP, &BuildOptions::default()).await.unwrap();

    let changed = Harness::new()
        .with_store(store)
        .with_context(
            MemoryContext::new()
                .with_file("app.txt", "version 2")
                .with_file("src/main.rs", "fn main() {}"),
        );
    let after = changed.engine().build(APP, &BuildOptions::default()).await.unwrap();

    let statuses: Vec<(usize, StepStatus)> =
        after.steps.iter().map(|s| (s.line, s.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, StepStatus::Base),
            (2, StepStatus::Cached),
            (3, StepStatus::Cached),
            (4, StepStatus::Built),
            (5, StepStatus::Built),
            (6, StepStatus::Metadata),
        ]
    );
    assert_eq!(changed.runner.commands(), vec!["write build.txt compiled"]);

    // Unchanged prefix keeps its fingerprints, everything after moves
    for (old, new) in before.steps.iter().zip(&after.steps) {
        if new.line < 4 {
            assert_eq!(old.fingerprint, new.fingerprint);
        } else {
            assert_ne!(old.fingerprint, new.fingerprint);
        }
    }
    assert_ne!(before.digest, after.digest);
}

#[tokio::test]
async fn test_no_cache_executes_every_step() {
    let harness = Harness::new();
    let engine = harness.engine();
    let first = engine.build(APP, &BuildOptions::default()).await.unwrap();
    let second = engine
        .build(APP, &BuildOptions::default().with_no_cache(true))
        .await
        .unwrap();
    assert_eq!(second.cache_hits(), 0);
    assert_eq!(harness.runner.call_count(), 4);
    assert_eq!(first.digest, second.digest);
}

#[tokio::test]
async fn test_run_sees_env_args_and_workdir() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1
ARG MODE=debug
ENV GREETING=hello
WORKDIR /work
RUN echo $GREETING
";
    harness
        .engine()
        .build(dockerfile, &BuildOptions::default().with_build_arg("MODE", "release"))
        .await
        .unwrap();

    let calls = harness.runner.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let spec = &calls[0];
    assert_eq!(spec.workdir, "/work");
    assert_eq!(spec.env.get("GREETING").map(String::as_str), Some("hello"));
    assert_eq!(spec.env.get("MODE").map(String::as_str), Some("release"));
    assert_eq!(spec.env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
}

#[tokio::test]
async fn test_build_arg_changes_run_fingerprint() {
    let harness = Harness::new();
    let engine = harness.engine();
    let dockerfile = "FROM base:1\nARG MODE=debug\nRUN write mode.txt built\n";

    let debug = engine.build(dockerfile, &BuildOptions::default()).await.unwrap();
    let release = engine
        .build(dockerfile, &BuildOptions::default().with_build_arg("MODE", "release"))
        .await
        .unwrap();
    assert_eq!(harness.runner.call_count(), 2);
    assert_ne!(debug.digest, release.digest);
}

#[tokio::test]
async fn test_unresolved_stage_runs_nothing() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1 AS builder
RUN write out.bin binary
FROM base:1
COPY --from=bulider /out.bin /usr/bin/
";
    let err = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap_err();
    match err {
        KilnError::UnresolvedStage { line, reference } => {
            assert_eq!(line, 4);
            assert_eq!(reference, "bulider");
        }
        other => panic!("expected UnresolvedStage, got {other}"),
    }
    assert_eq!(harness.runner.call_count(), 0);
}

#[tokio::test]
async fn test_cycle_rejected_before_execution() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1 AS a
COPY --from=b /x /x
FROM base:1 AS b
COPY --from=a /y /y
";
    let err = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::CyclicDependency { .. }), "got {err}");
    assert_eq!(harness.runner.call_count(), 0);
}

#[tokio::test]
async fn test_run_failure_reports_line_and_stderr() {
    let harness = Harness::new();
    let dockerfile = "FROM base:1\nRUN write a.txt a\nRUN fail 2\nRUN write b.txt b\n";
    let err = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap_err();
    match err {
        KilnError::BuildFailed {
            stage,
            line,
            exit_code,
            stderr,
        } => {
            assert_eq!(stage, "0");
            assert_eq!(line, 3);
            assert_eq!(exit_code, 2);
            assert!(stderr.contains("last line"));
        }
        other => panic!("expected BuildFailed, got {other}"),
    }
    assert_eq!(harness.runner.commands(), vec!["write a.txt a", "fail 2"]);
}

#[tokio::test]
async fn test_missing_copy_source() {
    let harness = Harness::new();
    let err = harness
        .engine()
        .build("FROM base:1\nCOPY missing.txt /app/\n", &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::SourceNotFound { line: 2, .. }), "got {err}");
}

#[tokio::test]
async fn test_multi_stage_copy_from() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1 AS builder
WORKDIR /src
COPY src/ ./
RUN write /out/app.bin binary
FROM base:1
COPY --from=builder /out/app.bin /usr/local/bin/app
RUN require /usr/local/bin/app
ENTRYPOINT [\"/usr/local/bin/app\"]
";
    let result = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stages, vec!["builder", "1"]);
    assert_eq!(result.manifest.target, None);
    assert_eq!(
        result.manifest.metadata.entrypoint,
        Some(vec!["/usr/local/bin/app".to_string()])
    );
    // Only the COPY changed the filesystem; builder layers stay out
    assert_eq!(result.manifest.layers.len(), 1);
}

#[tokio::test]
async fn test_target_builds_only_needed_stages() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1 AS builder
RUN write /out.bin binary
FROM base:1 AS tests
RUN write /tests.log passed
FROM base:1
COPY --from=builder /out.bin /out.bin
";
    let result = harness
        .engine()
        .build(dockerfile, &BuildOptions::default().with_target("builder"))
        .await
        .unwrap();
    assert_eq!(result.stages, vec!["builder"]);
    assert_eq!(result.manifest.target.as_deref(), Some("builder"));
    assert_eq!(harness.runner.commands(), vec!["write /out.bin binary"]);
}

#[tokio::test]
async fn test_stage_declaration_order_does_not_change_image() {
    let forward = "\
FROM base:1 AS left
RUN write /left.txt L
FROM base:1 AS right
RUN write /right.txt R
FROM base:1
COPY --from=left /left.txt /l.txt
COPY --from=right /right.txt /r.txt
";
    let swapped = "\
FROM base:1 AS right
RUN write /right.txt R
FROM base:1 AS left
RUN write /left.txt L
FROM base:1
COPY --from=left /left.txt /l.txt
COPY --from=right /right.txt /r.txt
";
    let a = Harness::new()
        .engine()
        .build(forward, &BuildOptions::default())
        .await
        .unwrap();
    let b = Harness::new()
        .engine()
        .build(swapped, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(a.digest, b.digest);
}

#[tokio::test]
async fn test_swapping_builder_and_final_stage_keeps_manifest() {
    let builder_first = "\
FROM base:1 AS builder
RUN write /out/app bin
FROM base:1
COPY --from=builder /out /out
";
    let final_first = "\
FROM base:1
COPY --from=builder /out /out
FROM base:1 AS builder
RUN write /out/app bin
";
    let a = Harness::new()
        .engine()
        .build(builder_first, &BuildOptions::default())
        .await
        .unwrap();
    let b = Harness::new()
        .engine()
        .build(final_first, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(a.manifest.target, None);
    assert_eq!(a.manifest, b.manifest);
    assert_eq!(a.digest, b.digest);
}

const SIBLINGS: &str = "\
FROM base:1 AS one
RUN sleep 200
FROM base:1 AS two
RUN sleep 200
FROM base:1
COPY --from=one /etc/os-release /one
COPY --from=two /etc/os-release /two
";

#[tokio::test]
async fn test_independent_stages_run_concurrently() {
    let harness = Harness::new();
    harness
        .engine()
        .with_max_parallel_stages(2)
        .build(SIBLINGS, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(harness.runner.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_parallelism_limit_is_respected() {
    let harness = Harness::new();
    harness
        .engine()
        .with_max_parallel_stages(1)
        .build(SIBLINGS, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(harness.runner.call_count(), 2);
    assert_eq!(harness.runner.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_failed_stage_cancels_siblings() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1 AS broken
RUN fail 1
FROM base:1 AS slow
RUN sleep 300
RUN write /never.txt x
FROM base:1
COPY --from=broken /etc/os-release /a
COPY --from=slow /etc/os-release /b
";
    let err = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::BuildFailed { line: 2, .. }), "got {err}");
    assert!(!harness
        .runner
        .commands()
        .contains(&"write /never.txt x".to_string()));
}

#[tokio::test]
async fn test_cancellation_stops_at_step_boundary() {
    let harness = Harness::new();
    let engine = harness.engine();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let dockerfile = "FROM base:1\nRUN sleep 300\nRUN write /after.txt x\n";
    let err = engine
        .build_with_cancel(dockerfile, &BuildOptions::default(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Cancelled), "got {err}");
    assert_eq!(harness.runner.commands(), vec!["sleep 300"]);

    // The interrupted step completed and was stored
    let resumed = engine
        .build("FROM base:1\nRUN sleep 300\n", &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(resumed.cache_hits(), 1);
}

#[tokio::test]
async fn test_instruction_timeout() {
    let mut harness = Harness::new();
    harness.config.instruction_timeout_secs = 1;
    let err = harness
        .engine()
        .build("FROM base:1\nRUN sleep 5000\n", &BuildOptions::default())
        .await
        .unwrap_err();
    match err {
        KilnError::Timeout { line, after, .. } => {
            assert_eq!(line, 2);
            assert_eq!(after, Duration::from_secs(1));
        }
        other => panic!("expected Timeout, got {other}"),
    }
}

#[tokio::test]
async fn test_remote_add_is_fingerprinted_by_content() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1
ADD https://example.com/tool.sh /usr/bin/tool.sh
RUN require /usr/bin/tool.sh
";
    let build = |body: &str| {
        harness
            .engine()
            .with_fetcher(Arc::new(StaticFetcher {
                body: body.as_bytes().to_vec(),
            }))
    };

    let first = build("echo v1").build(dockerfile, &BuildOptions::default()).await.unwrap();
    let same = build("echo v1").build(dockerfile, &BuildOptions::default()).await.unwrap();
    let changed = build("echo v2").build(dockerfile, &BuildOptions::default()).await.unwrap();

    assert_eq!(first.digest, same.digest);
    assert_eq!(same.cache_hits(), 2);
    assert_ne!(first.digest, changed.digest);
    assert_eq!(changed.executed(), 2);
}

#[tokio::test]
async fn test_disk_store_shared_between_engines() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(dir.path()).unwrap());

    let first = Harness::new().with_store(store.clone());
    let built = first.engine().build(APP, &BuildOptions::default()).await.unwrap();

    let reopened: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(dir.path()).unwrap());
    let second = Harness::new().with_store(reopened);
    let cached = second.engine().build(APP, &BuildOptions::default()).await.unwrap();

    assert_eq!(second.runner.call_count(), 0);
    assert_eq!(built.digest, cached.digest);
}

#[tokio::test]
async fn test_export_oci_layout() {
    let harness = Harness::new();
    let engine = harness.engine();
    let result = engine.build(APP, &BuildOptions::default()).await.unwrap();

    let output = tempfile::TempDir::new().unwrap();
    let export = export_oci_layout(
        &result.manifest,
        engine.store().as_ref(),
        engine.images().as_ref(),
        output.path(),
    )
    .await
    .unwrap();

    // Base rootfs plus every non-empty layer of the target
    assert_eq!(export.layer_count, result.manifest.layers.len() + 1);
    assert!(output.path().join("index.json").exists());
    assert!(output.path().join("oci-layout").exists());
}

#[tokio::test]
async fn test_build_args_do_not_leak_between_stages() {
    let harness = Harness::new();
    let dockerfile = "\
ARG VERSION=1.0
FROM base:1 AS first
ARG VERSION
LABEL version=$VERSION
FROM base:1
LABEL version=$VERSION
";
    let err = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, KilnError::UndefinedArgument { line: 6, ref name, .. } if name == "VERSION"),
        "got {err}"
    );

    let first = harness
        .engine()
        .build(dockerfile, &BuildOptions::default().with_target("first"))
        .await
        .unwrap();
    assert_eq!(
        first.manifest.metadata.labels.get("version").map(String::as_str),
        Some("1.0")
    );
}

#[tokio::test]
async fn test_build_args_map_is_independent() {
    let harness = Harness::new();
    let mut args = HashMap::new();
    args.insert("UNUSED".to_string(), "x".to_string());
    let options = BuildOptions {
        build_args: args,
        ..BuildOptions::default()
    };
    let result = harness
        .engine()
        .build("FROM base:1\nLABEL a=b\n", &options)
        .await
        .unwrap();
    assert_eq!(result.manifest.layers.len(), 0);
}

#[tokio::test]
async fn test_copy_through_absolute_link_lands_in_link_target() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1
RUN write /run/.keep x
RUN link /run /var/run
COPY app.txt /var/run/app.txt
RUN require /run/app.txt
";

    let result = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(result.executed(), 4);
}

#[tokio::test]
async fn test_copy_through_link_to_host_stays_in_rootfs() {
    let harness = Harness::new();
    let host = tempfile::TempDir::new().unwrap();
    let host_dir = host.path().to_string_lossy().to_string();
    let dockerfile = format!(
        "FROM base:1\nRUN link {host} /escape\nCOPY app.txt /escape/pwned\nRUN require {host}/pwned\n",
        host = host_dir
    );

    harness
        .engine()
        .build(&dockerfile, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read_dir(host.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_workdir_through_link_to_host_stays_in_rootfs() {
    let harness = Harness::new();
    let host = tempfile::TempDir::new().unwrap();
    let dockerfile = format!(
        "FROM base:1\nRUN link {} /escape\nWORKDIR /escape/app\nCOPY app.txt ./\n",
        host.path().display()
    );

    harness
        .engine()
        .build(&dockerfile, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read_dir(host.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_copy_from_stage_follows_linked_directory() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1 AS s
RUN write /run/x socket-config
RUN link /run /var/run
RUN link /run/x /current

FROM base:1
COPY --from=s /var/run/x /x
COPY --from=s /current /current
RUN require /x
";

    let result = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stages.len(), 2);
}

#[tokio::test]
async fn test_copy_from_stage_missing_behind_link() {
    let harness = Harness::new();
    let dockerfile = "\
FROM base:1 AS s
RUN link /run /var/run

FROM base:1
COPY --from=s /var/run/x /x
";

    let err = harness
        .engine()
        .build(dockerfile, &BuildOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, KilnError::SourceNotFound { line: 5, path, .. } if path == "/var/run/x"),
        "got {err}"
    );
}

