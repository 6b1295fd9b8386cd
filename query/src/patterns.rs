use context_core::{EngineError, Result};
use globset::{Glob, GlobMatcher};

const ALIAS_KEYS: &[&str] = &["env", "src", "ver", "branch"];

/// One predicate over dataset names. Patterns compose by union into a
/// `PatternSet`; this stays extensible where a single regex would rot.
#[derive(Debug)]
pub enum DatasetPattern {
    /// Matches every dataset (`*` or an absent selector).
    Any,
    Exact(String),
    Glob(GlobMatcher),
    /// Named predicate like `env:dev` or `branch:main`.
    Alias { key: String, value: String },
}

impl DatasetPattern {
    pub fn exact(name: impl Into<String>) -> Self {
        DatasetPattern::Exact(name.into())
    }

    pub fn any() -> Self {
        DatasetPattern::Any
    }

    pub fn glob(expr: &str) -> Result<Self> {
        let matcher = Glob::new(expr)
            .map_err(|e| {
                EngineError::validation(
                    format!("invalid glob '{expr}': {e}"),
                    vec!["use * and ? wildcards, e.g. github-*".to_string()],
                )
            })?
            .compile_matcher();
        Ok(DatasetPattern::Glob(matcher))
    }

    pub fn alias(expr: &str) -> Result<Self> {
        let (key, value) = expr.split_once(':').ok_or_else(|| {
            EngineError::validation(
                format!("'{expr}' is not an alias"),
                ALIAS_KEYS.iter().map(|k| format!("{k}:<value>")).collect(),
            )
        })?;
        if !ALIAS_KEYS.contains(&key) {
            return Err(EngineError::validation(
                format!("unknown alias key '{key}'"),
                ALIAS_KEYS.iter().map(|k| format!("{k}:<value>")).collect(),
            ));
        }
        if value.is_empty() {
            return Err(EngineError::validation(
                format!("alias '{key}:' has no value"),
                vec![format!("{key}:dev")],
            ));
        }
        Ok(DatasetPattern::Alias {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse one selector token into the right predicate.
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(EngineError::validation(
                "empty dataset pattern",
                vec!["*".to_string()],
            ));
        }
        if token == "*" {
            return Ok(DatasetPattern::Any);
        }
        if token.contains(':') {
            return Self::alias(token);
        }
        if token.contains('*') || token.contains('?') {
            return Self::glob(token);
        }
        Ok(DatasetPattern::Exact(token.to_string()))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            DatasetPattern::Any => true,
            DatasetPattern::Exact(exact) => name == exact,
            DatasetPattern::Glob(matcher) => matcher.is_match(name),
            DatasetPattern::Alias { key, value } => alias_matches(key, value, name),
        }
    }
}

/// Alias semantics. `env`, `ver` and `branch` select by suffix
/// (`api-dev`, `github-main`); `src` selects the broad content family.
fn alias_matches(key: &str, value: &str, name: &str) -> bool {
    match key {
        "env" | "ver" | "branch" => name == value || name.ends_with(&format!("-{value}")),
        "src" => match value {
            "code" => {
                name == "code"
                    || name == "src"
                    || name == "local"
                    || name.contains("code")
                    || name.starts_with("src-")
            }
            "docs" => name.contains("doc") || name.contains("wiki"),
            other => name.contains(other),
        },
        _ => false,
    }
}

/// Union of patterns: a dataset is selected when any member matches.
pub struct PatternSet {
    patterns: Vec<DatasetPattern>,
}

impl PatternSet {
    pub fn new(patterns: Vec<DatasetPattern>) -> Self {
        Self { patterns }
    }

    /// Parse a full selector. `None` selects everything accessible.
    pub fn parse(tokens: Option<&[String]>) -> Result<Self> {
        let patterns = match tokens {
            None => vec![DatasetPattern::Any],
            Some(tokens) => tokens
                .iter()
                .map(|t| DatasetPattern::parse(t))
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(Self::new(patterns))
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// Whether the selector could only ever match by exact name — used
    /// to produce suggestions when nothing matched.
    pub fn exact_names(&self) -> Vec<&str> {
        self.patterns
            .iter()
            .filter_map(|p| match p {
                DatasetPattern::Exact(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATASETS: &[&str] = &[
        "local",
        "docs",
        "api-dev",
        "api-prod",
        "db-dev",
        "db-prod",
        "github-main",
        "github-dev",
    ];

    fn expand(selector: &[&str]) -> Vec<String> {
        let tokens: Vec<String> = selector.iter().map(|s| s.to_string()).collect();
        let set = PatternSet::parse(Some(&tokens)).unwrap();
        DATASETS
            .iter()
            .filter(|name| set.matches(name))
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn env_alias_selects_suffix_matches() {
        assert_eq!(expand(&["env:dev"]), vec!["api-dev", "db-dev", "github-dev"]);
    }

    #[test]
    fn glob_selects_prefix_family() {
        assert_eq!(expand(&["github-*"]), vec!["github-main", "github-dev"]);
    }

    #[test]
    fn star_selects_everything() {
        assert_eq!(expand(&["*"]).len(), DATASETS.len());
        let all = PatternSet::parse(None).unwrap();
        assert!(all.matches("anything"));
    }

    #[test]
    fn exact_and_union() {
        assert_eq!(expand(&["docs"]), vec!["docs"]);
        assert_eq!(expand(&["docs", "local"]), vec!["local", "docs"]);
    }

    #[test]
    fn branch_alias() {
        assert_eq!(expand(&["branch:main"]), vec!["github-main"]);
    }

    #[test]
    fn src_alias_families() {
        assert_eq!(expand(&["src:docs"]), vec!["docs"]);
        assert!(expand(&["src:code"]).contains(&"local".to_string()));
    }

    #[test]
    fn question_mark_glob() {
        assert_eq!(expand(&["api-de?"]), vec!["api-dev"]);
    }

    #[test]
    fn unknown_alias_key_is_validation_error() {
        let err = DatasetPattern::parse("region:eu").unwrap_err();
        match err {
            EngineError::Validation { suggestions, .. } => {
                assert!(suggestions.iter().any(|s| s.starts_with("env:")));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn exact_names_surface_for_suggestions() {
        let set = PatternSet::parse(Some(&["docs".to_string(), "github-*".to_string()])).unwrap();
        assert_eq!(set.exact_names(), vec!["docs"]);
    }
}
