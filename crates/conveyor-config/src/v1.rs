//! Version 1 definition sub-parser.
//!
//! Consumes the normalized tree (`{version, workflows, jobs}`) produced by
//! the JSON dialects or the KDL converter, and produces the build graph
//! skeleton. Structural validation happens here: name grammar, uniqueness,
//! limits, and sequential step-dependency injection. Graph validation
//! (cycles, dangling references) is the queue engine's job at admission.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use conveyor_core::job::{JobType, StepExecution};
use conveyor_core::limits;

use crate::definition::{BuildDefinition, JobDef, StepDef, WorkflowDef};
use crate::reference::{DependencyRef, is_valid_name, parse_job_name};
use crate::{ConfigError, ConfigResult};

pub fn build_definition(tree: &Value) -> ConfigResult<BuildDefinition> {
    let mut workflows: Vec<WorkflowDef> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    // The default workflow always exists, even when empty.
    ensure_workflow(&mut workflows, &mut index, "");

    if let Some(decls) = tree.get("workflows") {
        for decl in as_array(decls, "workflows")? {
            let name = coerce_string(require(decl, "name")?, "workflow name")?;
            if !is_valid_name(&name) {
                return Err(ConfigError::InvalidValue {
                    field: "workflow name".to_string(),
                    message: format!("{name:?}"),
                });
            }
            if index.contains_key(name.as_str()) {
                return Err(ConfigError::Duplicate(format!("workflow {name}")));
            }
            let slot = ensure_workflow(&mut workflows, &mut index, &name);
            for job in as_array(require(decl, "jobs")?, "jobs")? {
                let parsed = parse_job(job, false)?;
                workflows[slot].jobs.push(parsed.1);
            }
        }
    }

    if let Some(decls) = tree.get("jobs") {
        for job in as_array(decls, "jobs")? {
            // Top-level jobs may carry a dotted name routing them into a
            // named workflow.
            let (target, job_def) = parse_job(job, true)?;
            let slot = ensure_workflow(&mut workflows, &mut index, target.as_deref().unwrap_or(""));
            workflows[slot].jobs.push(job_def);
        }
    }

    let definition = BuildDefinition {
        version: 1,
        workflows,
    };
    validate(&definition)?;
    Ok(definition)
}

fn ensure_workflow(
    workflows: &mut Vec<WorkflowDef>,
    index: &mut HashMap<String, usize>,
    name: &str,
) -> usize {
    if let Some(&i) = index.get(name) {
        return i;
    }
    workflows.push(WorkflowDef {
        name: name.to_string(),
        jobs: Vec::new(),
    });
    index.insert(name.to_string(), workflows.len() - 1);
    workflows.len() - 1
}

fn parse_job(value: &Value, allow_dotted_name: bool) -> ConfigResult<(Option<String>, JobDef)> {
    let raw_name = coerce_string(require(value, "name")?, "job name")?;
    let (workflow, name) = if allow_dotted_name {
        parse_job_name(&raw_name)?
    } else {
        if !is_valid_name(&raw_name) {
            return Err(ConfigError::InvalidValue {
                field: "job name".to_string(),
                message: format!("{raw_name:?}"),
            });
        }
        (None, raw_name)
    };

    let image = match value.get("image") {
        Some(v) => Some(coerce_string(v, "image")?),
        None => None,
    };

    let job_type = match value.get("type") {
        Some(v) => match coerce_string(v, "type")?.as_str() {
            "docker" => JobType::Docker,
            "exec" => JobType::Exec,
            "dynamic" => JobType::Dynamic,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: format!("job {name} type"),
                    message: format!("{other:?}"),
                });
            }
        },
        // Jobs with an image default to docker, the rest to host exec.
        None if image.is_some() => JobType::Docker,
        None => JobType::Exec,
    };

    let step_execution = match value.get("step_execution") {
        Some(v) => match coerce_string(v, "step_execution")?.as_str() {
            "sequential" => StepExecution::Sequential,
            "parallel" => StepExecution::Parallel,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: format!("job {name} step_execution"),
                    message: format!("{other:?}"),
                });
            }
        },
        None => StepExecution::default(),
    };

    let mut depends = Vec::new();
    if let Some(deps) = value.get("depends") {
        for dep in as_array(deps, "depends")? {
            let text = dep.as_str().ok_or_else(|| ConfigError::InvalidValue {
                field: format!("job {name} depends"),
                message: "references must be strings".to_string(),
            })?;
            depends.push(DependencyRef::parse(text)?);
        }
    }

    let mut env = HashMap::new();
    if let Some(map) = value.get("env") {
        let obj = map.as_object().ok_or_else(|| ConfigError::InvalidValue {
            field: format!("job {name} env"),
            message: "expected an object".to_string(),
        })?;
        for (k, v) in obj {
            env.insert(k.clone(), coerce_string(v, "env value")?);
        }
    }

    let mut steps = Vec::new();
    if let Some(decls) = value.get("steps") {
        for step in as_array(decls, "steps")? {
            steps.push(parse_step(step, &name)?);
        }
    }
    if step_execution == StepExecution::Sequential {
        inject_sequential_dependencies(&mut steps);
    }

    Ok((
        workflow,
        JobDef {
            name,
            job_type,
            image,
            env,
            step_execution,
            depends,
            steps,
        },
    ))
}

fn parse_step(value: &Value, job_name: &str) -> ConfigResult<StepDef> {
    let name = coerce_string(require(value, "name")?, "step name")?;
    if !is_valid_name(&name) {
        return Err(ConfigError::InvalidValue {
            field: format!("job {job_name} step name"),
            message: format!("{name:?}"),
        });
    }

    let mut commands = Vec::new();
    if let Some(decls) = value.get("commands") {
        for command in as_array(decls, "commands")? {
            // Command payloads are never coerced.
            let text = command.as_str().ok_or_else(|| ConfigError::InvalidValue {
                field: format!("job {job_name} step {name} commands"),
                message: "commands must be strings".to_string(),
            })?;
            commands.push(text.to_string());
        }
    }
    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "job {job_name} step {name} commands"
        )));
    }

    let mut depends = Vec::new();
    if let Some(deps) = value.get("depends") {
        for dep in as_array(deps, "depends")? {
            let text = dep.as_str().ok_or_else(|| ConfigError::InvalidValue {
                field: format!("job {job_name} step {name} depends"),
                message: "step dependencies must be strings".to_string(),
            })?;
            depends.push(text.to_string());
        }
    }

    Ok(StepDef {
        name,
        commands,
        depends,
    })
}

/// Each step of a sequential job depends on its predecessor.
fn inject_sequential_dependencies(steps: &mut [StepDef]) {
    for i in 1..steps.len() {
        let previous = steps[i - 1].name.clone();
        if !steps[i].depends.contains(&previous) {
            steps[i].depends.push(previous);
        }
    }
}

fn validate(definition: &BuildDefinition) -> ConfigResult<()> {
    let limits = limits();
    if definition.job_count() > limits.max_jobs_per_build {
        return Err(ConfigError::LimitExceeded(format!(
            "{} jobs exceeds the maximum of {}",
            definition.job_count(),
            limits.max_jobs_per_build
        )));
    }
    for workflow in &definition.workflows {
        let mut job_names = HashSet::new();
        for job in &workflow.jobs {
            if !job_names.insert(job.name.as_str()) {
                return Err(ConfigError::Duplicate(format!(
                    "job {} in workflow {:?}",
                    job.name, workflow.name
                )));
            }
            if job.steps.len() > limits.max_steps_per_job {
                return Err(ConfigError::LimitExceeded(format!(
                    "job {} has {} steps, maximum is {}",
                    job.name,
                    job.steps.len(),
                    limits.max_steps_per_job
                )));
            }
            let mut step_names = HashSet::new();
            for step in &job.steps {
                if !step_names.insert(step.name.as_str()) {
                    return Err(ConfigError::Duplicate(format!(
                        "step {} in job {}",
                        step.name, job.name
                    )));
                }
            }
            for step in &job.steps {
                for dep in &step.depends {
                    if !step_names.contains(dep.as_str()) {
                        return Err(ConfigError::InvalidReference(format!(
                            "step {} depends on unknown step {}",
                            step.name, dep
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn require<'a>(value: &'a Value, field: &str) -> ConfigResult<&'a Value> {
    value
        .get(field)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn as_array<'a>(value: &'a Value, field: &str) -> ConfigResult<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected an array".to_string(),
    })
}

/// Scalar-to-string coercion, applied only at the metadata layer.
fn coerce_string(value: &Value, field: &str) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a scalar".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_job(name: &str) -> Value {
        json!({
            "name": name,
            "type": "exec",
            "steps": [{ "name": "main", "commands": ["true"] }],
        })
    }

    #[test]
    fn default_workflow_collects_plain_jobs() {
        let tree = json!({ "version": 1, "jobs": [minimal_job("lint")] });
        let def = build_definition(&tree).unwrap();
        assert_eq!(def.workflows.len(), 1);
        assert_eq!(def.workflows[0].name, "");
        assert_eq!(def.workflows[0].jobs[0].name, "lint");
    }

    #[test]
    fn dotted_top_level_names_route_to_workflows() {
        let tree = json!({ "version": 1, "jobs": [minimal_job("build.compile")] });
        let def = build_definition(&tree).unwrap();
        let build = def.workflow("build").unwrap();
        assert_eq!(build.jobs[0].name, "compile");
    }

    #[test]
    fn dotted_names_inside_workflows_are_rejected() {
        let tree = json!({
            "version": 1,
            "workflows": [{ "name": "build", "jobs": [minimal_job("x.y")] }],
        });
        assert!(build_definition(&tree).is_err());
    }

    #[test]
    fn sequential_jobs_chain_their_steps() {
        let tree = json!({
            "version": 1,
            "jobs": [{
                "name": "release",
                "type": "exec",
                "step_execution": "sequential",
                "steps": [
                    { "name": "a", "commands": ["true"] },
                    { "name": "b", "commands": ["true"] },
                    { "name": "c", "commands": ["true"], "depends": ["a"] },
                ],
            }],
        });
        let def = build_definition(&tree).unwrap();
        let steps = &def.workflows[0].jobs[0].steps;
        assert!(steps[1].depends.contains(&"a".to_string()));
        assert!(steps[2].depends.contains(&"b".to_string()));
        // Explicit dependencies are kept.
        assert!(steps[2].depends.contains(&"a".to_string()));
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let tree = json!({
            "version": 1,
            "jobs": [minimal_job("lint"), minimal_job("lint")],
        });
        assert!(matches!(
            build_definition(&tree),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn unknown_step_dependency_is_rejected() {
        let tree = json!({
            "version": 1,
            "jobs": [{
                "name": "j",
                "type": "exec",
                "steps": [{ "name": "a", "commands": ["true"], "depends": ["ghost"] }],
            }],
        });
        assert!(matches!(
            build_definition(&tree),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn job_type_defaults_follow_image() {
        let tree = json!({
            "version": 1,
            "jobs": [
                { "name": "a", "image": "alpine", "steps": [{ "name": "s", "commands": ["true"] }] },
                { "name": "b", "steps": [{ "name": "s", "commands": ["true"] }] },
            ],
        });
        let def = build_definition(&tree).unwrap();
        assert_eq!(def.workflows[0].jobs[0].job_type, JobType::Docker);
        assert_eq!(def.workflows[0].jobs[1].job_type, JobType::Exec);
    }
}
