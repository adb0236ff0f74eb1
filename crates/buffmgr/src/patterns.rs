//! Include/exclude path patterns.
//!
//! Patterns are regular expressions with search semantics: a pattern matches
//! if it is found anywhere in the relative path.

use regex::RegexSet;

#[derive(Debug, Clone)]
pub struct PathPatterns {
    include: RegexSet,
    exclude: RegexSet,
}

impl Default for PathPatterns {
    fn default() -> Self {
        Self {
            include: RegexSet::empty(),
            exclude: RegexSet::empty(),
        }
    }
}

impl PathPatterns {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, regex::Error>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            include: RegexSet::new(include)?,
            exclude: RegexSet::new(exclude)?,
        })
    }

    pub fn exclude_only<E>(exclude: E) -> Result<Self, regex::Error>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Self::new(std::iter::empty::<&str>(), exclude)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude.is_match(path)
    }

    /// An empty include list admits everything.
    pub fn is_included(&self, path: &str) -> bool {
        self.include.is_empty() || self.include.is_match(path)
    }

    pub fn accepts(&self, path: &str) -> bool {
        self.is_included(path) && !self.is_excluded(path)
    }

    /// Exclude patterns that match `path`, for logging.
    pub fn excluded_by<'a>(&'a self, path: &str) -> Vec<&'a str> {
        let patterns = self.exclude.patterns();
        self.exclude
            .matches(path)
            .into_iter()
            .map(|i| patterns[i].as_str())
            .collect()
    }
}
