//! Macro Resolver (spec §4.3)
//!
//! Expands `$name$` / `$a.b.c$`-style tokens against an ordered list of
//! named resolvers. `$$` is a literal dollar sign. Resolution always
//! yields text (array-valued leaves are joined by `;`); callers that need
//! a typed value should resolve through the resolver directly instead.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::checkable::CheckResult;
use crate::error::{CoreError, CoreResult};

/// What a single resolver entry in the list can be: a plain JSON-ish
/// dictionary, or a callable evaluated against the remaining resolvers
/// and (optionally) the check result driving this resolution.
#[derive(Clone)]
pub enum MacroResolver {
    Dict(JsonValue),
    Function(Arc<dyn Fn(&[(String, MacroResolver)], Option<&CheckResult>) -> Option<JsonValue> + Send + Sync>),
}

impl fmt::Debug for MacroResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacroResolver::Dict(v) => f.debug_tuple("Dict").field(v).finish(),
            MacroResolver::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A named resolver, checked in the order given.
pub type ResolverList = Vec<(String, MacroResolver)>;

fn token_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\$|\$([^$]+)\$").unwrap())
}

/// A template is valid iff its dollar signs pair up (an escaped `$$`
/// counts as two characters of a single literal, still balancing).
pub fn validate_macro_string(template: &str) -> bool {
    template.chars().filter(|c| *c == '$').count() % 2 == 0
}

fn walk_path(value: &JsonValue, path: &[&str]) -> Option<JsonValue> {
    let mut current = value.clone();
    for segment in path {
        current = match current {
            JsonValue::Object(ref map) => map.get(*segment)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(";"),
        JsonValue::Null => String::new(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

fn resolve_one(
    name: &str,
    resolvers: &ResolverList,
    cr: Option<&CheckResult>,
) -> Option<JsonValue> {
    let segments: Vec<&str> = name.split('.').collect();

    for (resolver_name, resolver) in resolvers {
        let dict = match resolver {
            MacroResolver::Dict(v) => v.clone(),
            MacroResolver::Function(f) => f(resolvers, cr)?,
        };

        if segments.len() > 1 && segments[0] == resolver_name.as_str() {
            if let Some(v) = walk_path(&dict, &segments[1..]) {
                return Some(v);
            }
        }
        if let Some(v) = walk_path(&dict, &segments) {
            return Some(v);
        }
    }
    None
}

/// Expand every `$...$` token in `template`. Missing macros resolve to
/// empty text and are pushed to `missing_out` when given; with no
/// `missing_out`, the caller has opted into "resolve to empty" silently.
pub fn resolve_macros(
    template: &str,
    resolvers: &ResolverList,
    cr: Option<&CheckResult>,
    mut missing_out: Option<&mut Vec<String>>,
) -> CoreResult<String> {
    if !validate_macro_string(template) {
        return Err(CoreError::MacroSyntaxError {
            template: template.to_string(),
            message: "unmatched '$'".to_string(),
        });
    }

    let mut out = String::with_capacity(template.len());
    let mut last_end = 0;
    for m in token_regex().find_iter(template) {
        out.push_str(&template[last_end..m.start()]);
        last_end = m.end();

        if m.as_str() == "$$" {
            out.push('$');
            continue;
        }

        let name = &m.as_str()[1..m.as_str().len() - 1];
        match resolve_one(name, resolvers, cr) {
            Some(value) => out.push_str(&stringify(&value)),
            None => {
                warn!(macro_name = name, "macro did not resolve; using empty string");
                if let Some(missing) = missing_out.as_mut() {
                    missing.push(name.to_string());
                }
            }
        }
    }
    out.push_str(&template[last_end..]);
    Ok(out)
}

/// One entry of an argument spec passed to [`resolve_arguments`].
#[derive(Debug, Clone)]
pub struct ArgSpec {
    /// The flag text emitted before the value, e.g. `"-f"`.
    pub key: String,
    /// Macro template for the value; `None` means a bare flag with no value.
    pub value: Option<String>,
    /// Macro template gating whether this argument is emitted at all; an
    /// empty or missing resolution is treated as false.
    pub set_if: Option<String>,
    /// Emit the key once per array element instead of joining with `;`.
    pub repeat_key: bool,
    /// Lower sorts first; ties keep declaration order.
    pub order: i64,
}

/// Turn a base command plus an ordered argument spec into a flat argv,
/// resolving every macro template against `resolvers`.
pub fn resolve_arguments(
    command: &[String],
    arg_spec: &[ArgSpec],
    resolvers: &ResolverList,
    cr: Option<&CheckResult>,
) -> CoreResult<Vec<String>> {
    let mut specs: Vec<&ArgSpec> = arg_spec.iter().collect();
    specs.sort_by_key(|s| s.order);

    let mut argv = command.to_vec();
    for spec in specs {
        if let Some(gate) = &spec.set_if {
            let resolved = resolve_macros(gate, resolvers, cr, None)?;
            if resolved.is_empty() || resolved == "0" || resolved == "false" {
                continue;
            }
        }

        match &spec.value {
            None => argv.push(spec.key.clone()),
            Some(template) => {
                let resolved = resolve_macros(template, resolvers, cr, None)?;
                if spec.repeat_key {
                    for part in resolved.split(';').filter(|p| !p.is_empty()) {
                        argv.push(spec.key.clone());
                        argv.push(part.to_string());
                    }
                } else {
                    argv.push(spec.key.clone());
                    argv.push(resolved);
                }
            }
        }
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolvers() -> ResolverList {
        vec![
            (
                "macrosA".to_string(),
                MacroResolver::Dict(json!({"testA": 7, "testB": "hello"})),
            ),
            (
                "macrosB".to_string(),
                MacroResolver::Dict(json!({"testA": 3, "testC": "world", "testD": [3, "test"]})),
            ),
        ]
    }

    #[test]
    fn resolves_prefixed_and_bare_tokens() {
        let r = resolvers();
        assert_eq!(
            resolve_macros("$macrosA.testB$ $macrosB.testC$", &r, None, None).unwrap(),
            "hello world"
        );
        assert_eq!(resolve_macros("$testA$", &r, None, None).unwrap(), "7");
        assert_eq!(resolve_macros("$testA$$testB$", &r, None, None).unwrap(), "7hello");
    }

    #[test]
    fn array_leaf_joins_with_semicolon() {
        let r = resolvers();
        assert_eq!(resolve_macros("$testD$", &r, None, None).unwrap(), "3;test");
    }

    #[test]
    fn missing_macro_resolves_empty_and_is_reported() {
        let r = resolvers();
        let mut missing = Vec::new();
        let out = resolve_macros("$nope$", &r, None, Some(&mut missing)).unwrap();
        assert_eq!(out, "");
        assert_eq!(missing, vec!["nope".to_string()]);
    }

    #[test]
    fn unmatched_dollar_is_a_syntax_error() {
        let r = resolvers();
        let err = resolve_macros("$host.address", &r, None, None).unwrap_err();
        assert!(matches!(err, CoreError::MacroSyntaxError { .. }));
    }

    #[test]
    fn double_dollar_is_a_literal_dollar_sign() {
        let r = resolvers();
        assert_eq!(resolve_macros("$$test $testA$", &r, None, None).unwrap(), "$test 7");
    }

    #[test]
    fn validate_macro_string_matches_source_test_vectors() {
        assert!(!validate_macro_string("$host.address"));
        assert!(!validate_macro_string("host.vars.test$"));
        assert!(!validate_macro_string("$template::test$abc$"));
        assert!(validate_macro_string("$$test $host.vars.test$"));
        assert!(validate_macro_string("test $host.vars.test$"));
    }

    #[test]
    fn resolve_arguments_orders_and_gates_flags() {
        let r: ResolverList = vec![(
            "x".to_string(),
            MacroResolver::Dict(json!({"x": "foo", "y": "bar", "enabled": true})),
        )];

        let spec = vec![
            ArgSpec {
                key: "-a".to_string(),
                value: Some("$x.y$".to_string()),
                set_if: None,
                repeat_key: false,
                order: 2,
            },
            ArgSpec {
                key: "-f".to_string(),
                value: Some("$x.x$".to_string()),
                set_if: Some("$x.enabled$".to_string()),
                repeat_key: false,
                order: 1,
            },
        ];

        let argv = resolve_arguments(&["check_test".to_string()], &spec, &r, None).unwrap();
        assert_eq!(argv, vec!["check_test", "-f", "foo", "-a", "bar"]);
    }
}
