//! Variable interpolation for the templated-JSON dialect.
//!
//! Supports variables like:
//! - `${commit.sha}` - full commit SHA
//! - `${commit.short_sha}` - short (7 char) commit SHA
//! - `${commit.ref}` - branch or tag name
//! - `${build.id}` - build ID
//! - `${tenant}` - owning tenant ID
//! - `${env.VAR_NAME}` - environment variable supplied with the build
//!
//! Interpolation runs over the raw document before JSON parsing; unknown
//! variables are preserved verbatim.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Variables available to a templated build definition.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub commit_sha: String,
    pub ref_name: String,
    pub build_id: String,
    pub tenant: String,
    pub env: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new(commit_sha: impl Into<String>, ref_name: impl Into<String>) -> Self {
        Self {
            commit_sha: commit_sha.into(),
            ref_name: ref_name.into(),
            ..Self::default()
        }
    }

    fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();
        match parts.as_slice() {
            ["commit", "sha"] => Some(self.commit_sha.clone()),
            ["commit", "short_sha"] => Some(self.commit_sha.chars().take(7).collect()),
            ["commit", "ref"] => Some(self.ref_name.clone()),
            ["build", "id"] => Some(self.build_id.clone()),
            ["tenant"] => Some(self.tenant.clone()),
            ["env", name] => self.env.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all `${...}` variables in a document. Unresolved
    /// variables pass through unchanged.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{var_name}}}"))
            })
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_commit_variables() {
        let ctx = TemplateContext::new("abc1234567890", "main");
        let out = ctx.interpolate(r#"{"tag": "${commit.short_sha}", "ref": "${commit.ref}"}"#);
        assert_eq!(out, r#"{"tag": "abc1234", "ref": "main"}"#);
    }

    #[test]
    fn unknown_variables_pass_through() {
        let ctx = TemplateContext::default();
        assert_eq!(ctx.interpolate("${mystery.var}"), "${mystery.var}");
    }

    #[test]
    fn env_lookup() {
        let mut ctx = TemplateContext::new("abc", "main");
        ctx.env.insert("TARGET".to_string(), "release".to_string());
        assert_eq!(ctx.interpolate("build-${env.TARGET}"), "build-release");
    }
}
