//! `{placeholder}` substitution restricted to an allow-list.
//!
//! A template that references anything outside the allow-list is rejected as
//! a whole; nothing is rendered partially.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::domain::ContextLookup;
use crate::error::{EngineError, Result};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([^{}]*)\}").unwrap_or_else(|e| panic!("Invalid placeholder regex: {e}"))
    })
}

/// Placeholder names in order of appearance (trimmed, may repeat)
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_pattern()
        .captures_iter(template)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

/// Verify every placeholder in every template is allowed.
///
/// All offending names across all templates are reported together, sorted.
pub fn check_placeholders(templates: &[&str], allowed: &[&str]) -> Result<()> {
    let mut unknown: Vec<String> = templates
        .iter()
        .flat_map(|t| placeholders(t))
        .filter(|name| !allowed.contains(&name.as_str()))
        .collect();

    if unknown.is_empty() {
        return Ok(());
    }
    unknown.sort();
    unknown.dedup();
    Err(EngineError::TemplateVariablesNotAllowed(unknown))
}

/// Render a template. Allowed fields missing from the context render empty.
pub fn render<C: ContextLookup + ?Sized>(template: &str, ctx: &C, allowed: &[&str]) -> Result<String> {
    check_placeholders(&[template], allowed)?;

    let rendered = placeholder_pattern().replace_all(template, |cap: &regex::Captures<'_>| {
        let name = cap.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        match ctx.lookup(name) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContextSnapshot, TEMPLATE_FIELDS};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx() -> ContextSnapshot {
        let mut values = BTreeMap::new();
        values.insert("event_id".to_string(), json!(42));
        values.insert("from_domain".to_string(), json!("example.com"));
        ContextSnapshot(values)
    }

    #[test]
    fn test_render_allowed_placeholders() {
        let out = render("Mail {event_id} from { from_domain }", &ctx(), TEMPLATE_FIELDS).unwrap();
        assert_eq!(out, "Mail 42 from example.com");
    }

    #[test]
    fn test_missing_allowed_field_renders_empty() {
        let out = render("Entity: {entity_id}.", &ctx(), TEMPLATE_FIELDS).unwrap();
        assert_eq!(out, "Entity: .");
    }

    #[test]
    fn test_unknown_placeholder_rejects_whole_template() {
        let err = render("Hi {sender_name}, re {event_id}", &ctx(), TEMPLATE_FIELDS).unwrap_err();
        assert_eq!(err.code(), "template_variables_not_allowed");
        match err {
            EngineError::TemplateVariablesNotAllowed(names) => assert_eq!(names, vec!["sender_name"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_tenant_id_is_not_a_template_field() {
        assert!(render("{tenant_id}", &ctx(), TEMPLATE_FIELDS).is_err());
    }

    #[test]
    fn test_check_collects_across_templates() {
        let err = check_placeholders(&["{b} {a}", "{a} {event_id}"], TEMPLATE_FIELDS).unwrap_err();
        match err {
            EngineError::TemplateVariablesNotAllowed(names) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_no_placeholders() {
        assert_eq!(render("plain text", &ctx(), TEMPLATE_FIELDS).unwrap(), "plain text");
        assert!(placeholders("no braces").is_empty());
    }
}
