use super::{Parameter, ParameterStatus};
use crate::errors::{RslikeError, RslikeResult};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr};

/// How [`ParameterCollection::concatenate`] resolves parameters sharing a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Keep the parameter seen first.
    KeepFirst,
    /// Later parameters replace earlier ones, keeping the original position.
    Replace,
    /// Duplicate names are an error.
    Error,
}

/// Ordered set of parameters with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterCollection {
    params: IndexMap<String, Parameter>,
}

/// Translate a shell-style glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> RslikeResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| RslikeError::Configuration(format!("invalid pattern '{}': {}", pattern, e)))
}

impl ParameterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter.
    ///
    /// Returns an error if a parameter with the same name already exists.
    pub fn insert(&mut self, param: Parameter) -> RslikeResult<()> {
        if self.params.contains_key(param.name()) {
            return Err(RslikeError::Configuration(format!(
                "parameter '{}' is declared twice",
                param.name()
            )));
        }
        self.params.insert(param.name().to_string(), param);
        Ok(())
    }

    /// Add or replace a parameter, keeping the position of a replaced one.
    pub fn set(&mut self, param: Parameter) {
        self.params.insert(param.name().to_string(), param);
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    /// Look up a parameter, failing with [`RslikeError::UnknownParameter`].
    pub fn try_get(&self, name: &str) -> RslikeResult<&Parameter> {
        self.get(name)
            .ok_or_else(|| RslikeError::UnknownParameter(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.get_index_of(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.values_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    fn filter<F: Fn(&Parameter) -> bool>(&self, predicate: F) -> Self {
        Self {
            params: self
                .params
                .iter()
                .filter(|(_, p)| predicate(p))
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    /// Parameters matching any of the glob `patterns` (on full name or basename)
    /// and, if given, having the requested status.
    ///
    /// An empty pattern list matches every name.
    pub fn select(&self, patterns: &[&str], status: Option<ParameterStatus>) -> RslikeResult<Self> {
        let regexes = patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<RslikeResult<Vec<_>>>()?;
        Ok(self.filter(|p| {
            let name_match = regexes.is_empty()
                || regexes
                    .iter()
                    .any(|r| r.is_match(p.name()) || r.is_match(p.basename()));
            name_match && status.map_or(true, |s| p.status == s)
        }))
    }

    pub fn varied(&self) -> Self {
        self.filter(|p| p.is_varied())
    }

    pub fn sampled(&self) -> Self {
        self.filter(|p| p.is_sampled())
    }

    pub fn solved(&self) -> Self {
        self.filter(|p| p.is_solved())
    }

    pub fn fixed(&self) -> Self {
        self.filter(|p| p.is_fixed())
    }

    pub fn derived(&self) -> Self {
        self.filter(|p| p.is_derived())
    }

    /// Parameters present in both collections, in the order of `self`.
    pub fn intersection(&self, other: &Self) -> Self {
        self.filter(|p| other.contains(p.name()))
    }

    /// Parameters of `self` followed by those of `other` not already present.
    pub fn union(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for param in other.iter() {
            if !result.contains(param.name()) {
                result.set(param.clone());
            }
        }
        result
    }

    /// Concatenate collections, resolving duplicate names with `conflict`.
    pub fn concatenate<'a, I>(collections: I, conflict: Conflict) -> RslikeResult<Self>
    where
        I: IntoIterator<Item = &'a ParameterCollection>,
    {
        let mut result = Self::new();
        for collection in collections {
            for param in collection.iter() {
                match (result.contains(param.name()), conflict) {
                    (false, _) | (true, Conflict::Replace) => result.set(param.clone()),
                    (true, Conflict::KeepFirst) => {}
                    (true, Conflict::Error) => result.insert(param.clone())?,
                }
            }
        }
        Ok(result)
    }
}

impl FromIterator<Parameter> for ParameterCollection {
    /// Later parameters replace earlier ones with the same name.
    fn from_iter<T: IntoIterator<Item = Parameter>>(iter: T) -> Self {
        let mut collection = Self::new();
        for param in iter {
            collection.set(param);
        }
        collection
    }
}

impl BitAnd for &ParameterCollection {
    type Output = ParameterCollection;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersection(rhs)
    }
}

impl BitOr for &ParameterCollection {
    type Output = ParameterCollection;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}
