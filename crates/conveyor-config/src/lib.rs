//! Build definition parsing for the Conveyor CI control plane.
//!
//! Three dialects are accepted: KDL (the structured-tree form), plain
//! JSON, and templated JSON (`${...}` interpolation before parsing). All
//! three normalize to one tree that a version-routed sub-parser turns into
//! the build graph skeleton.

pub mod definition;
pub mod error;
pub mod kdl_tree;
pub mod reference;
pub mod template;
mod v1;

pub use definition::{BuildDefinition, JobDef, StepDef, WorkflowDef};
pub use error::{ConfigError, ConfigResult};
pub use reference::{DependencyRef, parse_job_name};
pub use template::TemplateContext;

use conveyor_core::limits;
use serde_json::Value;

/// Content-type tag accompanying a raw build definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Kdl,
    Json,
    TemplatedJson,
}

impl ConfigFormat {
    /// Infer the format from a definition file name, using the configured
    /// allow-list.
    pub fn from_file_name(name: &str) -> Option<ConfigFormat> {
        if !limits().config_file_names.iter().any(|n| n == name) {
            return None;
        }
        if name.ends_with(".kdl") {
            Some(ConfigFormat::Kdl)
        } else if name.ends_with(".jsont") {
            Some(ConfigFormat::TemplatedJson)
        } else if name.ends_with(".json") {
            Some(ConfigFormat::Json)
        } else {
            None
        }
    }
}

/// Parse a raw build definition into a graph skeleton.
///
/// Routes on the top-level `version` field; unknown versions are rejected.
pub fn parse_definition(
    bytes: &[u8],
    format: ConfigFormat,
    ctx: &TemplateContext,
) -> ConfigResult<BuildDefinition> {
    let max = limits().max_config_bytes;
    if bytes.len() > max {
        return Err(ConfigError::LimitExceeded(format!(
            "config is {} bytes, maximum is {max}",
            bytes.len()
        )));
    }
    let text = std::str::from_utf8(bytes)?;

    let tree: Value = match format {
        ConfigFormat::Json => serde_json::from_str(text)?,
        ConfigFormat::TemplatedJson => serde_json::from_str(&ctx.interpolate(text))?,
        ConfigFormat::Kdl => {
            let doc: kdl::KdlDocument = text.parse()?;
            kdl_tree::document_to_tree(&doc)?
        }
    };

    match version_of(&tree)? {
        1 => v1::build_definition(&tree),
        other => Err(ConfigError::UnsupportedVersion(other.to_string())),
    }
}

/// The top-level version field, accepting an integer or a numeric string
/// (metadata-layer coercion).
fn version_of(tree: &Value) -> ConfigResult<u64> {
    let value = tree
        .get("version")
        .ok_or_else(|| ConfigError::MissingField("version".to_string()))?;
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| ConfigError::InvalidValue {
            field: "version".to_string(),
            message: format!("{n}"),
        }),
        Value::String(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
            field: "version".to_string(),
            message: format!("{s:?}"),
        }),
        _ => Err(ConfigError::InvalidValue {
            field: "version".to_string(),
            message: "expected an integer".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KDL: &str = r#"
version 1
workflow "build" {
    job "compile" {
        image "rust:1.85"
        step "build" {
            run "cargo build --release"
        }
    }
}
"#;

    #[test]
    fn parses_kdl_dialect() {
        let def = parse_definition(KDL.as_bytes(), ConfigFormat::Kdl, &TemplateContext::default())
            .unwrap();
        assert_eq!(def.version, 1);
        assert_eq!(def.workflow("build").unwrap().jobs.len(), 1);
    }

    #[test]
    fn parses_json_dialect() {
        let json = r#"{
            "version": "1",
            "jobs": [
                { "name": "lint", "steps": [{ "name": "s", "commands": ["cargo clippy"] }] }
            ]
        }"#;
        let def = parse_definition(
            json.as_bytes(),
            ConfigFormat::Json,
            &TemplateContext::default(),
        )
        .unwrap();
        assert_eq!(def.workflows[0].jobs[0].name, "lint");
    }

    #[test]
    fn templated_json_interpolates_before_parsing() {
        let json = r#"{
            "version": 1,
            "jobs": [
                { "name": "tag", "steps": [{ "name": "s", "commands": ["echo ${commit.short_sha}"] }] }
            ]
        }"#;
        let ctx = TemplateContext::new("0123456789abcdef", "main");
        let def =
            parse_definition(json.as_bytes(), ConfigFormat::TemplatedJson, &ctx).unwrap();
        assert_eq!(
            def.workflows[0].jobs[0].steps[0].commands[0],
            "echo 0123456"
        );
    }

    #[test]
    fn unknown_version_is_rejected() {
        let json = r#"{"version": 9, "jobs": []}"#;
        let err = parse_definition(
            json.as_bytes(),
            ConfigFormat::Json,
            &TemplateContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(_)));
    }

    #[test]
    fn oversized_config_is_rejected() {
        let huge = vec![b' '; limits().max_config_bytes + 1];
        let err = parse_definition(&huge, ConfigFormat::Json, &TemplateContext::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::LimitExceeded(_)));
    }

    #[test]
    fn format_from_file_name_uses_allow_list() {
        assert_eq!(
            ConfigFormat::from_file_name(".conveyor.kdl"),
            Some(ConfigFormat::Kdl)
        );
        assert_eq!(
            ConfigFormat::from_file_name(".conveyor.json"),
            Some(ConfigFormat::Json)
        );
        assert_eq!(ConfigFormat::from_file_name("random.yaml"), None);
    }
}
