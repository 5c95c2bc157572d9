//! Step graph analysis: plan validation, readiness and dispatch grouping

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::template;
use crate::executor::ExecutorRegistry;
use crate::model::{StepStatus, Task, TaskStep};
use crate::{OrchestratorError, Result};

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::PlanValidation(msg.into())
}

/// Validate a step graph and mark fallback targets as standby
///
/// Applied to generated plans, submitted plans and automation clones alike.
pub fn validate_plan(steps: &mut [TaskStep], registry: &ExecutorRegistry) -> Result<()> {
    if steps.is_empty() {
        return Err(invalid("plan has no steps"));
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(invalid(format!("step at position {} has an empty id", i)));
        }
        if index.insert(step.id.as_str(), i).is_some() {
            return Err(invalid(format!("duplicate step id '{}'", step.id)));
        }
    }

    for step in steps.iter() {
        if !registry.contains(&step.agent_type) {
            return Err(invalid(format!(
                "step '{}' uses unregistered agent type '{}'",
                step.id, step.agent_type
            )));
        }
        if step.retry_count > step.max_retries {
            return Err(invalid(format!(
                "step '{}' has retry_count {} above max_retries {}",
                step.id, step.retry_count, step.max_retries
            )));
        }
        for dep in &step.dependencies {
            if dep == &step.id {
                return Err(invalid(format!("step '{}' depends on itself", step.id)));
            }
            if !index.contains_key(dep.as_str()) {
                return Err(invalid(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
        if let Some(ref fallback) = step.fallback_step_id {
            if fallback == &step.id {
                return Err(invalid(format!("step '{}' is its own fallback", step.id)));
            }
            if !index.contains_key(fallback.as_str()) {
                return Err(invalid(format!(
                    "step '{}' has unknown fallback '{}'",
                    step.id, fallback
                )));
            }
        }
    }

    let order = topological_order(steps, &index)?;
    let ancestors = ancestors(steps, &index, &order);

    // fallback target -> steps it backs up
    let mut backs: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if let Some(ref fallback) = step.fallback_step_id {
            backs.entry(fallback.as_str()).or_default().push(i);
        }
    }

    for (fallback, originals) in &backs {
        let f = index[fallback];
        for &o in originals {
            if ancestors[f].contains(&o) {
                return Err(invalid(format!(
                    "fallback '{}' depends on the step it replaces '{}'",
                    fallback, steps[o].id
                )));
            }
        }
    }

    for step in steps.iter() {
        for dep in &step.dependencies {
            if backs.contains_key(dep.as_str()) {
                return Err(invalid(format!(
                    "step '{}' depends on fallback step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    for (i, step) in steps.iter().enumerate() {
        let mut allowed: HashSet<usize> = ancestors[i].clone();
        if let Some(originals) = backs.get(step.id.as_str()) {
            for &o in originals {
                allowed.extend(ancestors[o].iter().copied());
            }
        }

        for referenced in template::referenced_steps(&step.inputs) {
            let ok = index
                .get(referenced.as_str())
                .map(|r| allowed.contains(r))
                .unwrap_or(false);
            if !ok {
                return Err(invalid(format!(
                    "step '{}' references '{}' which is not one of its dependencies",
                    step.id, referenced
                )));
            }
        }
    }

    let standby: HashSet<String> = backs.keys().map(|s| s.to_string()).collect();
    for step in steps.iter_mut() {
        step.standby = standby.contains(&step.id);
    }

    Ok(())
}

/// Kahn's algorithm; any leftover node sits on a cycle
fn topological_order(steps: &[TaskStep], index: &HashMap<&str, usize>) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            dependents[index[dep.as_str()]].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                queue.push_back(d);
            }
        }
    }

    if order.len() != steps.len() {
        let mut cyclic: Vec<&str> = (0..steps.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| steps[i].id.as_str())
            .collect();
        cyclic.sort_unstable();
        return Err(invalid(format!(
            "dependency cycle among steps: {}",
            cyclic.join(", ")
        )));
    }

    Ok(order)
}

/// Transitive dependencies of every step, indexed like `steps`
fn ancestors(
    steps: &[TaskStep],
    index: &HashMap<&str, usize>,
    order: &[usize],
) -> Vec<HashSet<usize>> {
    let mut result: Vec<HashSet<usize>> = vec![HashSet::new(); steps.len()];
    for &i in order {
        let mut acc = HashSet::new();
        for dep in &steps[i].dependencies {
            let d = index[dep.as_str()];
            acc.insert(d);
            acc.extend(result[d].iter().copied());
        }
        result[i] = acc;
    }
    result
}

/// Pending, non-standby steps whose dependencies are all completed or skipped
pub fn compute_ready_steps(task: &Task) -> Vec<&TaskStep> {
    task.steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending && !step.standby)
        .filter(|step| {
            step.dependencies.iter().all(|dep| {
                task.step(dep)
                    .map(|d| d.status.satisfies_dependents())
                    .unwrap_or(false)
            })
        })
        .collect()
}

/// Pending steps that can never run because a dependency failed, with that dependency
pub fn blocked_steps(task: &Task) -> Vec<(&TaskStep, &str)> {
    task.steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending && !step.standby)
        .filter_map(|step| {
            step.dependencies
                .iter()
                .find(|dep| {
                    task.step(dep)
                        .map(|d| d.status == StepStatus::Failed)
                        .unwrap_or(false)
                })
                .map(|dep| (step, dep.as_str()))
        })
        .collect()
}

/// Steps dispatched together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchGroup {
    /// Explicit label, generated name for auto-groups of two or more, or none
    pub name: Option<String>,
    pub step_ids: Vec<String>,
}

/// Partition ready steps into dispatch groups
///
/// Explicitly labelled steps group by label; the rest group by agent type
/// and dependency set. Group order follows first appearance in the plan.
pub fn group_ready(ready: &[&TaskStep]) -> Vec<DispatchGroup> {
    #[derive(PartialEq, Eq, PartialOrd, Ord, Clone)]
    enum Key {
        Explicit(String),
        Auto(String, Vec<String>),
    }

    let mut order: Vec<Key> = Vec::new();
    let mut members: BTreeMap<Key, Vec<String>> = BTreeMap::new();

    for step in ready {
        let key = match step.parallel_group {
            Some(ref label) => Key::Explicit(label.clone()),
            None => Key::Auto(
                step.agent_type.to_string(),
                step.dependencies.iter().cloned().collect(),
            ),
        };
        let entry = members.entry(key.clone()).or_default();
        if entry.is_empty() {
            order.push(key);
        }
        entry.push(step.id.clone());
    }

    let mut auto_counter = 0;
    order
        .into_iter()
        .map(|key| {
            let step_ids = members.remove(&key).unwrap_or_default();
            let name = match key {
                Key::Explicit(label) => Some(label),
                Key::Auto(agent, _) if step_ids.len() > 1 => {
                    auto_counter += 1;
                    Some(format!("auto-{}-{}", agent, auto_counter))
                }
                Key::Auto(..) => None,
            };
            DispatchGroup { name, step_ids }
        })
        .collect()
}
