use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid cache pattern `{pattern}`: {source}")]
pub struct PatternError {
    pattern: String,
    #[source]
    source: regex::Error,
}

/// Key selector for [`CacheManager::invalidate`](crate::CacheManager::invalidate).
#[derive(Debug, Clone)]
pub enum Pattern {
    Exact(String),
    /// `*` matches any run of characters; everything else is literal.
    Glob(String),
    Regex(Regex),
}

impl Pattern {
    pub fn exact(key: impl Into<String>) -> Self {
        Pattern::Exact(key.into())
    }

    pub fn glob(glob: impl Into<String>) -> Self {
        Pattern::Glob(glob.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        Regex::new(pattern)
            .map(Pattern::Regex)
            .map_err(|source| PatternError {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub(crate) fn matcher(&self) -> Result<Matcher<'_>, PatternError> {
        match self {
            Pattern::Exact(key) => Ok(Matcher::Exact(key)),
            Pattern::Glob(glob) => {
                let source = format!("^{}$", regex::escape(glob).replace(r"\*", ".*"));
                Regex::new(&source)
                    .map(Matcher::Owned)
                    .map_err(|source| PatternError {
                        pattern: glob.clone(),
                        source,
                    })
            }
            Pattern::Regex(re) => Ok(Matcher::Borrowed(re)),
        }
    }
}

pub(crate) enum Matcher<'a> {
    Exact(&'a str),
    Owned(Regex),
    Borrowed(&'a Regex),
}

impl Matcher<'_> {
    pub(crate) fn is_match(&self, key: &str) -> bool {
        match self {
            Matcher::Exact(expected) => *expected == key,
            Matcher::Owned(re) => re.is_match(key),
            Matcher::Borrowed(re) => re.is_match(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_any_run() {
        let pattern = Pattern::glob("ocr:*:eng");
        let m = pattern.matcher().unwrap();
        assert!(m.is_match("ocr:abc123:eng"));
        assert!(m.is_match("ocr::eng"));
        assert!(!m.is_match("ocr:abc:jpn"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let pattern = Pattern::glob("a.b*");
        let m = pattern.matcher().unwrap();
        assert!(m.is_match("a.bcd"));
        assert!(!m.is_match("axbcd"));
    }

    #[test]
    fn bad_regex_is_reported() {
        assert!(Pattern::regex("(unclosed").is_err());
        assert!(Pattern::regex("^translate:").is_ok());
    }
}
