use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::JobHandler;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid type pattern {0:?}")]
    InvalidPattern(String),

    #[error("Type pattern {0} is registered more than once")]
    DuplicatePattern(TypePattern),

    #[error("Handler declares no type patterns")]
    NoPatterns,
}

/// A job type pattern a handler answers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypePattern {
    /// Matches one job type exactly
    Exact(String),
    /// Matches every type that starts with the literal prefix and has at least
    /// one more character. `Job.SendEmail.*` is stored as `Job.SendEmail.`,
    /// a lone `*` as the empty prefix.
    Prefix(String),
}

impl TypePattern {
    pub fn parse(pattern: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidPattern(pattern.to_string());

        if pattern.is_empty() || pattern.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        match pattern.strip_suffix(WILDCARD) {
            Some(prefix) => {
                let well_formed =
                    (prefix.is_empty() || prefix.ends_with('.')) && !prefix.contains(WILDCARD);
                if well_formed {
                    Ok(TypePattern::Prefix(prefix.to_string()))
                } else {
                    Err(invalid())
                }
            }
            None if pattern.contains(WILDCARD) => Err(invalid()),
            None => Ok(TypePattern::Exact(pattern.to_string())),
        }
    }

    pub fn matches(&self, job_type: &str) -> bool {
        match self {
            TypePattern::Exact(exact) => exact == job_type,
            TypePattern::Prefix(prefix) => {
                job_type.len() > prefix.len() && job_type.starts_with(prefix.as_str())
            }
        }
    }
}

impl FromStr for TypePattern {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TypePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypePattern::Exact(exact) => f.write_str(exact),
            TypePattern::Prefix(prefix) => write!(f, "{prefix}{WILDCARD}"),
        }
    }
}

/// Handler chosen for a job type
#[derive(Clone)]
pub struct ResolvedHandler {
    pub handler: Arc<dyn JobHandler>,
    pub pattern: TypePattern,
    /// Overrides the queue-wide per-job timeout when set
    pub timeout: Option<Duration>,
}

impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("pattern", &self.pattern)
            .field("timeout", &self.timeout)
            .finish()
    }
}

struct Registration {
    handler: Arc<dyn JobHandler>,
    timeout: Option<Duration>,
}

/// Immutable map from job types to handlers.
///
/// Resolution order: an exact pattern beats any wildcard; among wildcards the
/// longest literal prefix wins. A pattern can only be registered once, so the
/// winner is always unique.
pub struct HandlerRegistry {
    exact: HashMap<String, ResolvedHandler>,
    /// Sorted by descending prefix length
    prefixes: Vec<(String, ResolvedHandler)>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn resolve(&self, job_type: &str) -> Option<ResolvedHandler> {
        if let Some(found) = self.exact.get(job_type) {
            return Some(found.clone());
        }

        self.prefixes
            .iter()
            .find(|(prefix, _)| job_type.len() > prefix.len() && job_type.starts_with(prefix.as_str()))
            .map(|(_, found)| found.clone())
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.resolve(job_type).is_some()
    }

    /// Registered patterns, exact ones first, each group sorted.
    pub fn patterns(&self) -> Vec<TypePattern> {
        let mut exact: Vec<TypePattern> = self
            .exact
            .keys()
            .map(|k| TypePattern::Exact(k.clone()))
            .collect();
        exact.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

        exact.extend(self.prefixes.iter().map(|(_, r)| r.pattern.clone()));
        exact
    }

    /// Largest per-registration timeout override, if any handler set one.
    pub fn longest_timeout(&self) -> Option<Duration> {
        self.exact
            .values()
            .chain(self.prefixes.iter().map(|(_, r)| r))
            .filter_map(|r| r.timeout)
            .max()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects handlers at startup; [`HandlerRegistryBuilder::build`] validates
/// every pattern and freezes the result.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registrations: Vec<Registration>,
}

impl HandlerRegistryBuilder {
    pub fn register<H: JobHandler>(self, handler: H) -> Self {
        self.register_arc(Arc::new(handler), None)
    }

    /// Register with a timeout that replaces the queue-wide one for these types.
    pub fn register_with_timeout<H: JobHandler>(self, handler: H, timeout: Duration) -> Self {
        self.register_arc(Arc::new(handler), Some(timeout))
    }

    pub fn register_arc(mut self, handler: Arc<dyn JobHandler>, timeout: Option<Duration>) -> Self {
        self.registrations.push(Registration { handler, timeout });
        self
    }

    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut exact = HashMap::new();
        let mut prefixes: Vec<(String, ResolvedHandler)> = Vec::new();

        for registration in self.registrations {
            let patterns = registration.handler.patterns();
            if patterns.is_empty() {
                return Err(RegistryError::NoPatterns);
            }

            for raw in patterns {
                let pattern = TypePattern::parse(&raw)?;
                let resolved = ResolvedHandler {
                    handler: Arc::clone(&registration.handler),
                    pattern: pattern.clone(),
                    timeout: registration.timeout,
                };

                match &pattern {
                    TypePattern::Exact(job_type) => {
                        if exact.insert(job_type.clone(), resolved).is_some() {
                            return Err(RegistryError::DuplicatePattern(pattern));
                        }
                    }
                    TypePattern::Prefix(prefix) => {
                        if prefixes.iter().any(|(p, _)| p == prefix) {
                            return Err(RegistryError::DuplicatePattern(pattern));
                        }
                        prefixes.push((prefix.clone(), resolved));
                    }
                }
            }
        }

        prefixes.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(HandlerRegistry { exact, prefixes })
    }
}
