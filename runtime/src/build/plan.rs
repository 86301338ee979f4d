//! Stage planning.
//!
//! Turns a parsed [`Dockerfile`] into a [`BuildPlan`]: every stage's base
//! and `COPY --from` references are resolved to stage indices or external
//! images, the stage graph is checked for cycles, and the stages needed by
//! the build target are ordered topologically.
//!
//! Planning is eager: every stage is validated even when it is not needed
//! by the target, and all planning errors surface before anything runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use kiln_core::error::{KilnError, Result};
use serde::Serialize;

use super::dockerfile::{Dockerfile, Instruction, Stage};
use super::expand::{expand, ExpandError};
use super::metadata::ArgScope;

/// What a `FROM` or `COPY --from` points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "ref", rename_all = "lowercase")]
pub enum StageRef {
    /// External image reference (or `scratch`)
    Image(String),
    /// Another stage of the same file, by index
    Stage(usize),
}

/// A stage with its references resolved.
#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub index: usize,
    pub name: String,
    pub base: StageRef,
    /// `COPY --from` sources keyed by step position within the stage
    pub copy_sources: BTreeMap<usize, StageRef>,
    /// Stages that must complete before this one starts
    pub dependencies: BTreeSet<usize>,
    pub stage: Stage,
}

/// A validated, ordered build plan.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// All stages in declaration order
    pub stages: Vec<PlannedStage>,
    /// Global ARGs with `--build-arg` overrides applied
    pub global_args: ArgScope,
    /// Stage that produces the image
    pub target: usize,
    /// Stages needed for the target, dependencies first
    pub order: Vec<usize>,
    /// `order` grouped so each level depends only on earlier levels
    pub levels: Vec<Vec<usize>>,
}

impl BuildPlan {
    /// Plan `dockerfile` for `target` (alias or index), or for the default
    /// target: the last declared stage no other stage depends on.
    pub fn new(
        dockerfile: &Dockerfile,
        build_args: &HashMap<String, String>,
        target: Option<&str>,
    ) -> Result<Self> {
        let global_args = dockerfile
            .global_args
            .iter()
            .fold(ArgScope::default(), |scope, arg| {
                scope.declare(&arg.name, arg.default.clone(), build_args)
            });

        let aliases: HashMap<String, usize> = dockerfile
            .stages
            .iter()
            .filter_map(|s| s.alias.clone().map(|alias| (alias, s.index)))
            .collect();
        let resolver = RefResolver {
            aliases: &aliases,
            stage_count: dockerfile.stages.len(),
            global_args: &global_args,
        };

        let mut stages = Vec::with_capacity(dockerfile.stages.len());
        for stage in &dockerfile.stages {
            stages.push(plan_stage(stage, &resolver)?);
        }

        if let Some(cycle) = find_cycle(&stages) {
            return Err(KilnError::CyclicDependency {
                cycle: cycle.into_iter().map(|i| stages[i].name.clone()).collect(),
            });
        }

        let target = match target {
            Some(name) => resolver.stage_index(name).ok_or_else(|| {
                KilnError::Build(format!("Target stage '{}' is not declared", name))
            })?,
            None => default_target(&stages),
        };

        let required = ancestry(&stages, target);
        let order: Vec<usize> = topological_order(&stages)
            .into_iter()
            .filter(|i| required.contains(i))
            .collect();
        let levels = group_levels(&stages, &order);

        tracing::debug!(
            target_stage = %stages[target].name,
            stages = order.len(),
            levels = levels.len(),
            "Build plan ready"
        );

        Ok(BuildPlan {
            stages,
            global_args,
            target,
            order,
            levels,
        })
    }

    /// Names of the scheduled stages in build order.
    pub fn order_names(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|&i| self.stages[i].name.clone())
            .collect()
    }

    pub fn target_stage(&self) -> &PlannedStage {
        &self.stages[self.target]
    }
}

struct RefResolver<'a> {
    aliases: &'a HashMap<String, usize>,
    stage_count: usize,
    global_args: &'a ArgScope,
}

impl RefResolver<'_> {
    fn stage_index(&self, reference: &str) -> Option<usize> {
        let lowered = reference.to_lowercase();
        if let Some(&index) = self.aliases.get(&lowered) {
            return Some(index);
        }
        match reference.parse::<usize>() {
            Ok(index) if index < self.stage_count => Some(index),
            _ => None,
        }
    }

    /// Resolve a raw reference from `line` of stage `stage_name`.
    fn resolve(&self, raw: &str, stage_name: &str, line: usize) -> Result<StageRef> {
        let reference = expand(raw, |name| self.global_args.get(name)).map_err(|e| match e {
            ExpandError::Undefined(name) => KilnError::UndefinedArgument {
                stage: stage_name.to_string(),
                line,
                name,
            },
            ExpandError::Malformed(text) => KilnError::Syntax {
                line,
                message: format!("Malformed variable reference '{}'", text),
            },
        })?;

        if let Some(index) = self.stage_index(&reference) {
            return Ok(StageRef::Stage(index));
        }
        if is_image_reference(&reference) {
            return Ok(StageRef::Image(reference));
        }
        Err(KilnError::UnresolvedStage { line, reference })
    }
}

/// `scratch`, or a reference carrying a tag, digest or registry path.
///
/// A bare word is taken to be a stage name, so a mistyped alias is
/// reported instead of silently pulled as an image.
fn is_image_reference(reference: &str) -> bool {
    reference.eq_ignore_ascii_case("scratch")
        || (!reference.is_empty() && reference.contains([':', '@', '/']))
}

fn plan_stage(stage: &Stage, resolver: &RefResolver<'_>) -> Result<PlannedStage> {
    let name = stage.name();
    let base = resolver.resolve(&stage.base, &name, stage.line)?;

    let mut copy_sources = BTreeMap::new();
    for (position, step) in stage.steps.iter().enumerate() {
        if let Instruction::Copy {
            from: Some(from), ..
        } = &step.instruction
        {
            copy_sources.insert(position, resolver.resolve(from, &name, step.line)?);
        }
    }

    let dependencies = std::iter::once(&base)
        .chain(copy_sources.values())
        .filter_map(|r| match r {
            StageRef::Stage(index) => Some(*index),
            StageRef::Image(_) => None,
        })
        .collect();

    Ok(PlannedStage {
        index: stage.index,
        name,
        base,
        copy_sources,
        dependencies,
        stage: stage.clone(),
    })
}

/// Find a dependency cycle by depth-first search.
///
/// Returns the stage indices along the cycle with the first one repeated
/// at the end.
fn find_cycle(stages: &[PlannedStage]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        node: usize,
        stages: &[PlannedStage],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::InProgress;
        path.push(node);
        for &dep in &stages[node].dependencies {
            match marks[dep] {
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(dep, stages, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; stages.len()];
    let mut path = Vec::new();
    for index in 0..stages.len() {
        if marks[index] == Mark::Unvisited {
            if let Some(cycle) = visit(index, stages, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn's algorithm over all stages; ties go to the lower index.
///
/// Must only be called on an acyclic graph.
fn topological_order(stages: &[PlannedStage]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = stages.iter().map(|s| s.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for stage in stages {
        for &dep in &stage.dependencies {
            dependents[dep].push(stage.index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    order
}

/// The last declared stage that nothing depends on.
fn default_target(stages: &[PlannedStage]) -> usize {
    let depended_on: BTreeSet<usize> = stages
        .iter()
        .flat_map(|s| s.dependencies.iter().copied())
        .collect();
    (0..stages.len())
        .rev()
        .find(|i| !depended_on.contains(i))
        .unwrap_or(stages.len().saturating_sub(1))
}

/// `target` and everything it transitively depends on.
fn ancestry(stages: &[PlannedStage], target: usize) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([target]);
    while let Some(index) = queue.pop_front() {
        if seen.insert(index) {
            queue.extend(stages[index].dependencies.iter().copied());
        }
    }
    seen
}

fn group_levels(stages: &[PlannedStage], order: &[usize]) -> Vec<Vec<usize>> {
    let mut level_of: HashMap<usize, usize> = HashMap::new();
    let mut levels: Vec<Vec<usize>> = Vec::new();

    for &index in order {
        let level = stages[index]
            .dependencies
            .iter()
            .filter_map(|dep| level_of.get(dep))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        level_of.insert(index, level);
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(index);
    }

    for level in &mut levels {
        level.sort_unstable();
    }
    levels
}
