use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

use super::pattern::Pattern;

type PatternFactory = Arc<dyn Fn() -> Box<dyn Pattern> + Send + Sync>;

struct RegisteredPattern {
    factory: PatternFactory,
    in_default: bool,
}

static PATTERN_REGISTRY: Lazy<RwLock<BTreeMap<String, RegisteredPattern>>> =
    Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Makes a user pattern selectable by `name` alongside the built-ins.
///
/// `in_default` adds it to [`PatternsLevel::Default`]; every registered
/// pattern is part of [`PatternsLevel::All`]. Registering a name twice
/// replaces the factory. Built-in names cannot be reused.
pub fn register_pattern<P, F>(name: impl Into<String>, in_default: bool, factory: F) -> Result<()>
where
    P: Pattern + 'static,
    F: Fn() -> P + Send + Sync + 'static,
{
    let name = name.into();
    if PatternType::from_name(&name).is_some() {
        return Err(Error::config(format!(
            "Pattern name '{name}' is already used by a built-in pattern"
        )));
    }
    let factory: PatternFactory = Arc::new(move || Box::new(factory()) as Box<dyn Pattern>);
    PATTERN_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name, RegisteredPattern { factory, in_default });
    Ok(())
}

pub fn registered_patterns() -> Vec<String> {
    PATTERN_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect()
}

fn is_registered(name: &str) -> bool {
    PATTERN_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(name)
}

/// Instantiates the registered pattern called `name`.
pub(crate) fn create_registered(name: &str) -> Option<Box<dyn Pattern>> {
    let factory = PATTERN_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .map(|entry| Arc::clone(&entry.factory))?;
    Some(factory())
}

/// Preset pattern selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternsLevel {
    None,
    #[default]
    Default,
    All,
}

/// Every rewrite the pipeline knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatternType {
    ConstExprFold,
    PostNRepl,
    OpToIdentity,
    SubtractArg1GradOp,
    MulArgGradOp,
    ReciprocalGradOp,
    SqrtGradOp,
    DivArg0GradOp,
    DivArg1GradOp,
    ExpGradOp,
    InPlace,
}

impl PatternType {
    pub const ALL: [PatternType; 11] = [
        PatternType::ConstExprFold,
        PatternType::PostNRepl,
        PatternType::OpToIdentity,
        PatternType::SubtractArg1GradOp,
        PatternType::MulArgGradOp,
        PatternType::ReciprocalGradOp,
        PatternType::SqrtGradOp,
        PatternType::DivArg0GradOp,
        PatternType::DivArg1GradOp,
        PatternType::ExpGradOp,
        PatternType::InPlace,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PatternType::ConstExprFold => "ConstExprFold",
            PatternType::PostNRepl => "PostNRepl",
            PatternType::OpToIdentity => "OpToIdentity",
            PatternType::SubtractArg1GradOp => "SubtractArg1GradOp",
            PatternType::MulArgGradOp => "MulArgGradOp",
            PatternType::ReciprocalGradOp => "ReciprocalGradOp",
            PatternType::SqrtGradOp => "SqrtGradOp",
            PatternType::DivArg0GradOp => "DivArg0GradOp",
            PatternType::DivArg1GradOp => "DivArg1GradOp",
            PatternType::ExpGradOp => "ExpGradOp",
            PatternType::InPlace => "InPlace",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn in_default(&self) -> bool {
        !matches!(self, PatternType::ExpGradOp)
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The set of enabled patterns.
///
/// Registered user patterns are tracked by name and resolved when the
/// pipeline is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patterns {
    enabled: BTreeSet<PatternType>,
    registered: BTreeSet<String>,
}

impl Default for Patterns {
    fn default() -> Self {
        Self::new(PatternsLevel::Default)
    }
}

impl Patterns {
    pub fn new(level: PatternsLevel) -> Self {
        let enabled = match level {
            PatternsLevel::None => BTreeSet::new(),
            PatternsLevel::Default => PatternType::ALL
                .into_iter()
                .filter(PatternType::in_default)
                .collect(),
            PatternsLevel::All => PatternType::ALL.into_iter().collect(),
        };
        let registered = match level {
            PatternsLevel::None => BTreeSet::new(),
            PatternsLevel::Default | PatternsLevel::All => PATTERN_REGISTRY
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|(_, entry)| level == PatternsLevel::All || entry.in_default)
                .map(|(name, _)| name.clone())
                .collect(),
        };
        Self {
            enabled,
            registered,
        }
    }

    /// Enables exactly the named patterns, built-in or registered.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut patterns = Self::new(PatternsLevel::None);
        for name in names {
            patterns = patterns.enable_named(name.as_ref(), true)?;
        }
        Ok(patterns)
    }

    /// Like [`Patterns::enable`], but accepts any known pattern name.
    pub fn enable_named(mut self, name: &str, on: bool) -> Result<Self> {
        if let Some(pattern) = PatternType::from_name(name) {
            return Ok(self.enable(pattern, on));
        }
        if !is_registered(name) {
            return Err(Error::config(format!("Unknown pattern name '{name}'")));
        }
        if on {
            self.registered.insert(name.to_string());
        } else {
            self.registered.remove(name);
        }
        Ok(self)
    }

    pub fn enable(mut self, pattern: PatternType, on: bool) -> Self {
        if on {
            self.enabled.insert(pattern);
        } else {
            self.enabled.remove(&pattern);
        }
        self
    }

    pub fn is_enabled(&self, pattern: PatternType) -> bool {
        self.enabled.contains(&pattern)
    }

    pub fn enabled(&self) -> impl Iterator<Item = PatternType> + '_ {
        self.enabled.iter().copied()
    }

    pub fn is_in_place_enabled(&self) -> bool {
        self.is_enabled(PatternType::InPlace)
    }

    pub fn is_registered_enabled(&self, name: &str) -> bool {
        self.registered.contains(name)
    }

    pub fn registered_enabled(&self) -> impl Iterator<Item = &str> + '_ {
        self.registered.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_leaves_out_exp_grad() {
        let patterns = Patterns::new(PatternsLevel::Default);
        assert!(!patterns.is_enabled(PatternType::ExpGradOp));
        assert!(patterns.is_enabled(PatternType::ConstExprFold));
        assert!(Patterns::new(PatternsLevel::All).is_enabled(PatternType::ExpGradOp));
        assert_eq!(Patterns::new(PatternsLevel::None).enabled().count(), 0);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = Patterns::from_names(&["PostNRepl", "NotAPattern"]).unwrap_err();
        assert_eq!(err.to_string(), "Unknown pattern name 'NotAPattern'");
    }
}
