//! Label templates and validity predicates.
//!
//! A template is text with `{{expr}}` placeholders. Each expression is
//! evaluated against a [`Context`] of named JSON values (the pipeline binds
//! `record` and `api`) and substituted by its text form. Unresolved paths
//! render as the empty string.
//!
//! ```
//! use geolabel_core::template::{Context, Template};
//! use serde_json::json;
//!
//! let api = json!({"country": "JP", "city": "Tokyo"});
//! let ctx = Context::new().bind("api", &api);
//! let label = Template::parse("{{api.country}} {{api.city}}").render(&ctx).unwrap();
//! assert_eq!(label, "JP Tokyo");
//! ```

mod expr;

use serde_json::Value;
use tracing::debug;

use expr::{display, truthy, Expr};

/// Template evaluation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    /// Expression could not be parsed.
    #[error("cannot parse expression `{expr}` at offset {position}: {message}")]
    Parse {
        expr: String,
        position: usize,
        message: String,
    },

    /// Expression parsed but failed to evaluate.
    #[error("cannot evaluate expression `{expr}`: {message}")]
    Eval { expr: String, message: String },
}

/// Named values visible to expressions.
#[derive(Debug, Clone, Default)]
pub struct Context<'v> {
    bindings: Vec<(&'v str, &'v Value)>,
}

impl<'v> Context<'v> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`. Later bindings shadow earlier ones.
    pub fn bind(mut self, name: &'v str, value: &'v Value) -> Self {
        self.bindings.push((name, value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&'v Value> {
        self.bindings
            .iter()
            .rev()
            .find(|(bound, _)| *bound == name)
            .map(|(_, value)| *value)
    }

    /// Resolve a bare field name against the bound objects in binding order,
    /// preferring the first truthy hit.
    fn fallback(&self, field: &str) -> Option<&'v Value> {
        let mut first = None;
        for (_, value) in &self.bindings {
            if let Some(hit) = value.get(field) {
                if truthy(hit) {
                    return Some(hit);
                }
                first.get_or_insert(hit);
            }
        }
        first
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Placeholder {
        source: String,
        expr: Result<Expr, TemplateError>,
    },
}

/// A parsed `{{expr}}` template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Split `source` into literals and placeholders.
    ///
    /// Never fails: a malformed expression is kept and reported by
    /// [`Template::render`], so the failure lands on the record being
    /// rendered. An unterminated `{{` is literal text.
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            let Some(close) = rest[open + 2..].find("}}") else {
                break;
            };
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let inner = rest[open + 2..open + 2 + close].trim();
            segments.push(Segment::Placeholder {
                source: inner.to_string(),
                expr: Expr::parse(inner),
            });
            rest = &rest[open + 2 + close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Self {
            source: source.to_string(),
            segments,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against `ctx`.
    pub fn render(&self, ctx: &Context<'_>) -> Result<String, TemplateError> {
        self.render_with(ctx, |text, out| out.push_str(text))
    }

    /// Render with every substituted value escaped for a quoted string literal.
    fn render_escaped(&self, ctx: &Context<'_>) -> Result<String, TemplateError> {
        self.render_with(ctx, |text, out| {
            for ch in text.chars() {
                if matches!(ch, '\\' | '\'' | '"') {
                    out.push('\\');
                }
                out.push(ch);
            }
        })
    }

    fn render_with(
        &self,
        ctx: &Context<'_>,
        mut emit: impl FnMut(&str, &mut String),
    ) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { source, expr } => {
                    let expr = expr.as_ref().map_err(Clone::clone)?;
                    let value = expr.eval(ctx).map_err(|message| TemplateError::Eval {
                        expr: source.clone(),
                        message,
                    })?;
                    emit(&display(&value), &mut out);
                }
            }
        }
        Ok(out)
    }
}

/// Boolean validity rule over the same context as label templates.
///
/// Placeholders are substituted first (escaped so they stay inside string
/// literals), then the resulting text is evaluated as one expression:
/// `"{{api.countryCode || api.aso}}".length > 0`. Plain expressions without
/// placeholders work too: `api.status == 'success'`.
#[derive(Debug, Clone)]
pub struct Predicate {
    template: Template,
}

impl Predicate {
    pub fn new(source: &str) -> Self {
        Self {
            template: Template::parse(source),
        }
    }

    pub fn source(&self) -> &str {
        self.template.source()
    }

    /// Evaluate, propagating errors. An empty predicate accepts everything.
    pub fn evaluate(&self, ctx: &Context<'_>) -> Result<bool, TemplateError> {
        let rendered = self.template.render_escaped(ctx)?;
        if rendered.trim().is_empty() {
            return Ok(true);
        }
        let expr = Expr::parse(&rendered)?;
        let value = expr.eval(ctx).map_err(|message| TemplateError::Eval {
            expr: rendered.clone(),
            message,
        })?;
        Ok(truthy(&value))
    }

    /// Evaluate; any error counts as "invalid".
    pub fn check(&self, ctx: &Context<'_>) -> bool {
        match self.evaluate(ctx) {
            Ok(valid) => valid,
            Err(e) => {
                debug!(predicate = %self.source(), error = %e, "validity predicate failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_without_placeholders_is_identity() {
        let t = Template::parse("static label");
        assert_eq!(t.render(&Context::new()).unwrap(), "static label");
    }

    #[test]
    fn test_render_null_and_missing_as_empty() {
        let api = json!({"country": "JP", "city": null});
        let ctx = Context::new().bind("api", &api);
        let t = Template::parse("{{api.country}}|{{api.city}}|{{ api.region.name }}");
        assert_eq!(t.render(&ctx).unwrap(), "JP||");
    }

    #[test]
    fn test_render_mixed_record_and_api() {
        let record = json!({"name": "hk-01", "server": "1.2.3.4"});
        let api = json!({"countryCode": "HK", "aso": "Example Net"});
        let ctx = Context::new().bind("record", &record).bind("api", &api);
        let t = Template::parse("{{api.countryCode}} {{api.aso}} - {{record.name}}");
        assert_eq!(t.render(&ctx).unwrap(), "HK Example Net - hk-01");
    }

    #[test]
    fn test_render_indexed_paths() {
        let record = json!({"tags": ["edge", "v6"]});
        let ctx = Context::new().bind("record", &record);
        let t = Template::parse("{{record.tags[0]}}|{{record.tags[5]}}|{{record.tags[-1]}}");
        assert_eq!(t.render(&ctx).unwrap(), "edge||");
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let api = json!({"a": 1});
        let ctx = Context::new().bind("api", &api);
        assert_eq!(
            Template::parse("{{api.a}} and {{api.a").render(&ctx).unwrap(),
            "1 and {{api.a"
        );
    }

    #[test]
    fn test_malformed_placeholder_errors_on_render() {
        let t = Template::parse("{{api.country ||}}");
        let err = t.render(&Context::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Parse { .. }));
    }

    #[test]
    fn test_predicate_quoted_placeholder() {
        let predicate = Predicate::new("is_ip('{{api.ip || api.query}}')");

        let good = json!({"query": "1.2.3.4"});
        assert!(predicate.check(&Context::new().bind("api", &good)));

        let bad = json!({"message": "private range"});
        assert!(!predicate.check(&Context::new().bind("api", &bad)));
    }

    #[test]
    fn test_predicate_length_form() {
        let predicate = Predicate::new("\"{{api.countryCode || api.aso}}\".length > 0");
        let hit = json!({"countryCode": "", "aso": "Example"});
        let miss = json!({"countryCode": "", "aso": ""});
        assert!(predicate.check(&Context::new().bind("api", &hit)));
        assert!(!predicate.check(&Context::new().bind("api", &miss)));
    }

    #[test]
    fn test_predicate_escapes_quotes_in_values() {
        let predicate = Predicate::new("'{{api.org}}'.length > 0");
        let api = json!({"org": "O'Reilly \"Media\""});
        assert_eq!(
            predicate.evaluate(&Context::new().bind("api", &api)),
            Ok(true)
        );
    }

    #[test]
    fn test_predicate_error_is_invalid() {
        let predicate = Predicate::new("api.country ==");
        let api = json!({"country": "JP"});
        let ctx = Context::new().bind("api", &api);
        assert!(predicate.evaluate(&ctx).is_err());
        assert!(!predicate.check(&ctx));
    }

    #[test]
    fn test_predicate_plain_expression_and_empty() {
        let api = json!({"status": "success"});
        let ctx = Context::new().bind("api", &api);
        assert!(Predicate::new("api.status == 'success'").check(&ctx));
        assert!(Predicate::new("  ").check(&ctx));
    }
}
