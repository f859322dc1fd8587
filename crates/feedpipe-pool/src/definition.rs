//! Built-in transform definitions.
//!
//! - [`IdentityDefinition`]: copies the input unchanged
//! - [`RewriteDefinition`]: ordered regex substitutions whose replacement
//!   text may reference request parameters as `{{name}}`

use std::borrow::Cow;
use std::sync::Arc;

use feedpipe_core::config::{DefinitionKind, DefinitionSection, RuleSection};
use feedpipe_core::{ParamValue, Params};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::engine::{
    Engine, EngineError, EngineSink, EngineSource, TransformDefinition, TransformFuture,
};

/// Build the definition described by a `[definition]` config section.
pub fn from_section(
    section: &DefinitionSection,
) -> Result<Arc<dyn TransformDefinition>, EngineError> {
    match section.kind {
        DefinitionKind::Identity => Ok(Arc::new(IdentityDefinition::new(&section.name))),
        DefinitionKind::Rewrite => Ok(Arc::new(RewriteDefinition::compile(
            &section.name,
            &section.rules,
        )?)),
    }
}

// ── Identity ────────────────────────────────────────────────────────

pub struct IdentityDefinition {
    name: String,
}

impl IdentityDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl TransformDefinition for IdentityDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(IdentityEngine {
            params: Params::new(),
        }))
    }
}

struct IdentityEngine {
    params: Params,
}

impl Engine for IdentityEngine {
    fn set_parameter(&mut self, name: &str, value: ParamValue) {
        self.params.insert(name, value);
    }

    fn clear_parameters(&mut self) {
        self.params = Params::new();
    }

    fn transform<'a>(
        &'a mut self,
        source: EngineSource<'a>,
        sink: EngineSink<'a>,
    ) -> TransformFuture<'a> {
        Box::pin(async move {
            tokio::io::copy(source, &mut *sink).await?;
            sink.flush().await?;
            Ok(())
        })
    }
}

// ── Rewrite ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled substitution rule.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: Vec<Segment>,
}

impl RewriteRule {
    pub fn compile(definition: &str, rule: &RuleSection) -> Result<Self, EngineError> {
        let pattern = Regex::new(&rule.pattern).map_err(|e| EngineError::Compile {
            name: definition.to_string(),
            reason: e.to_string(),
        })?;
        let replacement = parse_template(&rule.replacement).map_err(|reason| EngineError::Compile {
            name: definition.to_string(),
            reason,
        })?;
        Ok(Self {
            pattern,
            replacement,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Parameter names referenced by the replacement template.
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.replacement.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render the replacement with `params` substituted.
    ///
    /// Parameter values are escaped so a `$` in a value is never read as a
    /// capture group reference.
    fn expand(&self, params: &Params) -> Result<String, EngineError> {
        let mut out = String::new();
        for segment in &self.replacement {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| EngineError::MissingParameter(name.clone()))?;
                    out.push_str(&value.to_string().replace('$', "$$"));
                }
            }
        }
        Ok(out)
    }
}

fn parse_template(template: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unclosed placeholder in {template:?}"))?;
        let name = after[..end].trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!("invalid parameter name {name:?} in {template:?}"));
        }
        segments.push(Segment::Param(name.to_string()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

/// Ordered regex substitutions over a UTF-8 document.
///
/// The rules are compiled once in [`compile`](RewriteDefinition::compile)
/// and shared by every engine through an `Arc`.
pub struct RewriteDefinition {
    name: String,
    rules: Arc<[RewriteRule]>,
}

impl RewriteDefinition {
    pub fn compile(name: &str, rules: &[RuleSection]) -> Result<Self, EngineError> {
        if rules.is_empty() {
            return Err(EngineError::Compile {
                name: name.to_string(),
                reason: "no rules".to_string(),
            });
        }
        let rules = rules
            .iter()
            .map(|rule| RewriteRule::compile(name, rule))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(%name, rules = rules.len(), "compiled rewrite definition");
        Ok(Self {
            name: name.to_string(),
            rules: rules.into(),
        })
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }
}

impl TransformDefinition for RewriteDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(RewriteEngine {
            rules: Arc::clone(&self.rules),
            params: Params::new(),
        }))
    }
}

struct RewriteEngine {
    rules: Arc<[RewriteRule]>,
    params: Params,
}

impl Engine for RewriteEngine {
    fn set_parameter(&mut self, name: &str, value: ParamValue) {
        self.params.insert(name, value);
    }

    fn clear_parameters(&mut self) {
        self.params = Params::new();
    }

    fn transform<'a>(
        &'a mut self,
        source: EngineSource<'a>,
        sink: EngineSink<'a>,
    ) -> TransformFuture<'a> {
        Box::pin(async move {
            let mut input = Vec::new();
            source.read_to_end(&mut input).await?;
            let mut text = String::from_utf8(input)
                .map_err(|e| EngineError::Malformed(format!("input is not UTF-8: {e}")))?;

            for rule in self.rules.iter() {
                let replacement = rule.expand(&self.params)?;
                let rewritten = match rule.pattern.replace_all(&text, replacement.as_str()) {
                    Cow::Borrowed(_) => None,
                    Cow::Owned(out) => Some(out),
                };
                if let Some(out) = rewritten {
                    text = out;
                }
            }

            sink.write_all(text.as_bytes()).await?;
            sink.flush().await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, replacement: &str) -> RuleSection {
        RuleSection {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }

    async fn run(engine: &mut dyn Engine, input: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut source = input;
        let mut sink = Vec::new();
        engine.transform(&mut source, &mut sink).await?;
        Ok(sink)
    }

    #[test]
    fn template_parsing() {
        assert_eq!(
            parse_template("href=\"{{ correct_url }}/$1\"").unwrap(),
            vec![
                Segment::Literal("href=\"".into()),
                Segment::Param("correct_url".into()),
                Segment::Literal("/$1\"".into()),
            ]
        );
        assert_eq!(parse_template("").unwrap(), vec![]);
        assert!(parse_template("{{unclosed").is_err());
        assert!(parse_template("{{ }}").is_err());
        assert!(parse_template("{{bad name}}").is_err());
    }

    #[test]
    fn compile_rejects_bad_regex() {
        let err = RewriteDefinition::compile("broken", &[rule("(unclosed", "x")])
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Compile { .. }));
    }

    #[test]
    fn compile_rejects_empty_rules() {
        assert!(RewriteDefinition::compile("empty", &[]).is_err());
    }

    #[test]
    fn rule_lists_parameters() {
        let def = RewriteDefinition::compile("p", &[rule("a", "{{x}}-{{y}}")]).unwrap();
        let names: Vec<_> = def.rules()[0].parameters().collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(def.rules()[0].pattern(), "a");
    }

    #[tokio::test]
    async fn identity_copies_bytes() {
        let def = IdentityDefinition::new("identity");
        let mut engine = def.instantiate().unwrap();
        let out = run(engine.as_mut(), b"<entry/>").await.unwrap();
        assert_eq!(out, b"<entry/>");
        assert_eq!(def.name(), "identity");
    }

    #[tokio::test]
    async fn rewrite_substitutes_parameters_and_captures() {
        let def = RewriteDefinition::compile(
            "external-href",
            &[rule(r#"href="https?://[^/"]+/([^"]*)""#, r#"href="{{correct_url}}/$1""#)],
        )
        .unwrap();
        let mut engine = def.instantiate().unwrap();
        engine.set_parameter("correct_url", "https://feeds.example.com".into());

        let input = br#"<feed><link href="http://internal:8080/feed/1"/></feed>"#;
        let out = run(engine.as_mut(), input).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"<feed><link href="https://feeds.example.com/feed/1"/></feed>"#
        );
    }

    #[tokio::test]
    async fn rewrite_escapes_dollar_in_values() {
        let def = RewriteDefinition::compile("d", &[rule("X", "{{v}}")]).unwrap();
        let mut engine = def.instantiate().unwrap();
        engine.set_parameter("v", "$1".into());
        let out = run(engine.as_mut(), b"aXb").await.unwrap();
        assert_eq!(out, b"a$1b");
    }

    #[tokio::test]
    async fn rewrite_applies_rules_in_order() {
        let def = RewriteDefinition::compile("o", &[rule("a", "b"), rule("b", "c")]).unwrap();
        let mut engine = def.instantiate().unwrap();
        let out = run(engine.as_mut(), b"ab").await.unwrap();
        assert_eq!(out, b"cc");
    }

    #[tokio::test]
    async fn rewrite_missing_parameter_fails() {
        let def = RewriteDefinition::compile("m", &[rule("x", "{{needed}}")]).unwrap();
        let mut engine = def.instantiate().unwrap();
        let err = run(engine.as_mut(), b"x").await.unwrap_err();
        assert!(matches!(err, EngineError::MissingParameter(ref n) if n == "needed"));
    }

    #[tokio::test]
    async fn rewrite_rejects_non_utf8() {
        let def = RewriteDefinition::compile("u", &[rule("x", "y")]).unwrap();
        let mut engine = def.instantiate().unwrap();
        let err = run(engine.as_mut(), &[0xff, 0xfe, b'<']).await.unwrap_err();
        assert!(matches!(err, EngineError::Malformed(_)));
    }

    #[tokio::test]
    async fn cleared_parameters_do_not_leak() {
        let def = RewriteDefinition::compile("c", &[rule("x", "{{p}}")]).unwrap();
        let mut engine = def.instantiate().unwrap();
        engine.set_parameter("p", "first".into());
        assert_eq!(run(engine.as_mut(), b"x").await.unwrap(), b"first");

        engine.clear_parameters();
        assert!(run(engine.as_mut(), b"x").await.is_err());
    }

    #[test]
    fn from_section_builds_both_kinds() {
        let identity = from_section(&DefinitionSection::default()).unwrap();
        assert_eq!(identity.name(), "identity");

        let section = DefinitionSection {
            name: "href".into(),
            kind: DefinitionKind::Rewrite,
            rules: vec![rule("a", "b")],
        };
        assert_eq!(from_section(&section).unwrap().name(), "href");
    }
}
