//! Job-type vocabulary.
//!
//! Built once at process startup and shared immutably afterwards. Holds the
//! canonical type names, a flat alias table (alias -> canonical) and the subset
//! of types that run through the legacy default path instead of a registered
//! handler.

use std::collections::{BTreeSet, HashMap};

use crate::error::{DomainError, DomainResult};

/// Longest accepted job-type identifier.
pub const MAX_JOB_TYPE_LEN: usize = 64;

/// Registered job-type identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTypes {
    canonical: BTreeSet<String>,
    aliases: HashMap<String, String>,
    legacy: BTreeSet<String>,
}

impl JobTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a canonical type name.
    pub fn register(&mut self, job_type: impl Into<String>) -> DomainResult<()> {
        let job_type = normalize(job_type.into())?;
        if self.aliases.contains_key(&job_type) {
            return Err(DomainError::validation(format!(
                "job type '{job_type}' is already registered as an alias"
            )));
        }
        self.canonical.insert(job_type);
        Ok(())
    }

    /// Add a canonical type that the scheduler runs through the legacy path.
    pub fn register_legacy(&mut self, job_type: impl Into<String>) -> DomainResult<()> {
        let job_type = normalize(job_type.into())?;
        self.register(job_type.clone())?;
        self.legacy.insert(job_type);
        Ok(())
    }

    /// Map `alias` onto an already registered canonical type.
    pub fn alias(
        &mut self,
        alias: impl Into<String>,
        canonical: impl Into<String>,
    ) -> DomainResult<()> {
        let alias = normalize(alias.into())?;
        let canonical = normalize(canonical.into())?;
        if !self.canonical.contains(&canonical) {
            return Err(DomainError::validation(format!(
                "cannot alias '{alias}' to unregistered job type '{canonical}'"
            )));
        }
        if self.canonical.contains(&alias) {
            return Err(DomainError::validation(format!(
                "alias '{alias}' collides with a canonical job type"
            )));
        }
        self.aliases.insert(alias, canonical);
        Ok(())
    }

    /// Resolve a name (canonical or alias) to its canonical form.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if let Some(canonical) = self.canonical.get(name) {
            return Some(canonical.as_str());
        }
        self.aliases.get(name).map(String::as_str)
    }

    /// Resolve or fail with a validation error.
    pub fn require(&self, name: &str) -> DomainResult<&str> {
        self.resolve(name)
            .ok_or_else(|| DomainError::validation(format!("unregistered job type '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn is_legacy(&self, name: &str) -> bool {
        self.resolve(name)
            .is_some_and(|canonical| self.legacy.contains(canonical))
    }

    pub fn canonical(&self) -> impl Iterator<Item = &str> {
        self.canonical.iter().map(String::as_str)
    }

    pub fn legacy(&self) -> impl Iterator<Item = &str> {
        self.legacy.iter().map(String::as_str)
    }
}

fn normalize(raw: String) -> DomainResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("job type must not be empty"));
    }
    if trimmed.len() > MAX_JOB_TYPE_LEN {
        return Err(DomainError::validation(format!(
            "job type exceeds {MAX_JOB_TYPE_LEN} characters"
        )));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err(DomainError::validation(format!(
            "job type '{trimmed}' contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}
