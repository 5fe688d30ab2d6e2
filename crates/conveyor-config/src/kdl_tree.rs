//! Conversion of a KDL build definition into the normalized JSON tree the
//! version sub-parsers consume.
//!
//! Scalar coercion happens here, at the metadata layer only: node
//! arguments that name things (versions, workflow/job/step names, env
//! values) accept integers, floats, and booleans and become strings.
//! Command payloads (`run` arguments) must already be strings.

use kdl::{KdlDocument, KdlNode, KdlValue};
use serde_json::{Map, Value, json};

use crate::{ConfigError, ConfigResult};

/// Coerce a KDL scalar to a string. `None` for null.
fn scalar_string(value: &KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        Some(s.to_string())
    } else if let Some(i) = value.as_integer() {
        Some(i.to_string())
    } else if let Some(f) = value.as_float() {
        Some(f.to_string())
    } else {
        value.as_bool().map(|b| b.to_string())
    }
}

fn first_arg_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    let entry = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    scalar_string(entry.value()).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected a scalar value".to_string(),
    })
}

fn arg_strings(node: &KdlNode) -> ConfigResult<Vec<String>> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| {
            scalar_string(e.value()).ok_or_else(|| ConfigError::InvalidValue {
                field: node.name().value().to_string(),
                message: "expected a scalar value".to_string(),
            })
        })
        .collect()
}

/// Convert a parsed KDL document into the normalized definition tree:
/// `{version, workflows: [{name, jobs: [...]}], jobs: [...]}`.
pub fn document_to_tree(doc: &KdlDocument) -> ConfigResult<Value> {
    let mut root = Map::new();
    let mut workflows: Vec<Value> = Vec::new();
    let mut jobs: Vec<Value> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "version" => {
                let entry = node
                    .entries()
                    .iter()
                    .find(|e| e.name().is_none())
                    .ok_or_else(|| ConfigError::MissingField("version".to_string()))?;
                let value = if let Some(i) = entry.value().as_integer() {
                    json!(i as i64)
                } else if let Some(s) = entry.value().as_string() {
                    json!(s)
                } else {
                    return Err(ConfigError::InvalidValue {
                        field: "version".to_string(),
                        message: "expected an integer or string".to_string(),
                    });
                };
                root.insert("version".to_string(), value);
            }
            "workflow" => {
                let name = first_arg_string(node, "workflow name")?;
                let mut workflow_jobs: Vec<Value> = Vec::new();
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "job" => workflow_jobs.push(job_to_tree(child)?),
                            other => {
                                return Err(ConfigError::InvalidValue {
                                    field: format!("workflow {name}"),
                                    message: format!("unexpected node {other:?}"),
                                });
                            }
                        }
                    }
                }
                workflows.push(json!({ "name": name, "jobs": workflow_jobs }));
            }
            "job" => jobs.push(job_to_tree(node)?),
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "config".to_string(),
                    message: format!("unexpected top-level node {other:?}"),
                });
            }
        }
    }

    root.insert("workflows".to_string(), Value::Array(workflows));
    root.insert("jobs".to_string(), Value::Array(jobs));
    Ok(Value::Object(root))
}

fn job_to_tree(node: &KdlNode) -> ConfigResult<Value> {
    let name = first_arg_string(node, "job name")?;
    let mut job = Map::new();
    job.insert("name".to_string(), json!(name));
    let mut depends: Vec<Value> = Vec::new();
    let mut env = Map::new();
    let mut steps: Vec<Value> = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "type" => {
                    job.insert("type".to_string(), json!(first_arg_string(child, "type")?));
                }
                "image" => {
                    job.insert("image".to_string(), json!(first_arg_string(child, "image")?));
                }
                "step-execution" => {
                    job.insert(
                        "step_execution".to_string(),
                        json!(first_arg_string(child, "step-execution")?),
                    );
                }
                "depends" => {
                    depends.extend(arg_strings(child)?.into_iter().map(Value::String));
                }
                "env" => {
                    let args = arg_strings(child)?;
                    if args.len() != 2 {
                        return Err(ConfigError::InvalidValue {
                            field: format!("job {name} env"),
                            message: "expected a key and a value".to_string(),
                        });
                    }
                    env.insert(args[0].clone(), json!(args[1]));
                }
                "step" => steps.push(step_to_tree(child, &name)?),
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("job {name}"),
                        message: format!("unexpected node {other:?}"),
                    });
                }
            }
        }
    }

    job.insert("depends".to_string(), Value::Array(depends));
    job.insert("env".to_string(), Value::Object(env));
    job.insert("steps".to_string(), Value::Array(steps));
    Ok(Value::Object(job))
}

fn step_to_tree(node: &KdlNode, job_name: &str) -> ConfigResult<Value> {
    let name = first_arg_string(node, "step name")?;
    let mut commands: Vec<Value> = Vec::new();
    let mut depends: Vec<Value> = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    // Commands are never coerced: a command is a string or
                    // the config is invalid.
                    for entry in child.entries().iter().filter(|e| e.name().is_none()) {
                        let text = entry.value().as_string().ok_or_else(|| {
                            ConfigError::InvalidValue {
                                field: format!("job {job_name} step {name} run"),
                                message: "commands must be strings".to_string(),
                            }
                        })?;
                        commands.push(json!(text));
                    }
                }
                "depends" => {
                    depends.extend(arg_strings(child)?.into_iter().map(Value::String));
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("step {name}"),
                        message: format!("unexpected node {other:?}"),
                    });
                }
            }
        }
    }

    Ok(json!({ "name": name, "commands": commands, "depends": depends }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_a_small_document() {
        let doc: KdlDocument = r#"
version 1
workflow "build" {
    job "compile" {
        type "docker"
        image "rust:1.85"
        step "build" {
            run "cargo build --release"
        }
    }
}
job "lint" {
    type "exec"
    step "check" {
        run "cargo clippy"
    }
}
"#
        .parse()
        .unwrap();
        let tree = document_to_tree(&doc).unwrap();
        assert_eq!(tree["version"], 1);
        assert_eq!(tree["workflows"][0]["name"], "build");
        assert_eq!(tree["workflows"][0]["jobs"][0]["name"], "compile");
        assert_eq!(tree["jobs"][0]["name"], "lint");
        assert_eq!(
            tree["jobs"][0]["steps"][0]["commands"][0],
            "cargo clippy"
        );
    }

    #[test]
    fn metadata_scalars_coerce_but_commands_do_not() {
        let doc: KdlDocument = r#"
version 1
job 42 {
    step "s" {
        run 7
    }
}
"#
        .parse()
        .unwrap();
        let err = document_to_tree(&doc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let doc: KdlDocument = r#"
version 1
job 42 {
    step "s" {
        run "echo ok"
    }
}
"#
        .parse()
        .unwrap();
        let tree = document_to_tree(&doc).unwrap();
        // Numeric job name coerced to a string at the metadata layer.
        assert_eq!(tree["jobs"][0]["name"], "42");
    }
}
