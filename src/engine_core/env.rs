// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Environment resolution and readiness checks.
//!
//! A server is ready when every variable it declares as required resolves
//! to a non-empty value. The same rules decide which variables are injected
//! into the child at spawn time.

use std::collections::{BTreeMap, HashMap};

use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::{Readiness, ServerDescriptor};
use crate::engine_core::traits::EnvResolver;

/// Reads the current process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvResolver for ProcessEnv {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed name/value map. Used for overrides and tests.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }
}

impl FromIterator<(String, String)> for MapEnv {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

impl EnvResolver for MapEnv {
    fn resolve(&self, name: &str) -> Option<String> {
        self.vars.get(name).filter(|v| !v.is_empty()).cloned()
    }
}

/// Report which required variables of `descriptor` are missing.
///
/// A declared default satisfies the requirement.
pub fn check_readiness(descriptor: &ServerDescriptor, env: &dyn EnvResolver) -> Readiness {
    let mut missing_env = Vec::new();
    let mut present_env = Vec::new();

    for (name, requirement) in &descriptor.environment {
        if !requirement.required {
            continue;
        }
        let satisfied = env.resolve(name).is_some()
            || requirement.default.as_deref().is_some_and(|d| !d.is_empty());
        if satisfied {
            present_env.push(name.clone());
        } else {
            missing_env.push(name.clone());
        }
    }

    Readiness {
        server: descriptor.name.clone(),
        ready: missing_env.is_empty(),
        missing_env,
        present_env,
    }
}

/// Compute the variables to add on top of the inherited process environment.
///
/// Resolution order per declared variable: explicit override, resolver,
/// declared default. A required variable with no value is a configuration
/// error rather than a process failure.
pub fn resolve_launch_env(
    descriptor: &ServerDescriptor,
    env: &dyn EnvResolver,
    overrides: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, CatalogError> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();

    for (name, requirement) in &descriptor.environment {
        let value = overrides
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| env.resolve(name))
            .or_else(|| requirement.default.clone().filter(|d| !d.is_empty()));

        match value {
            Some(v) => {
                resolved.insert(name.clone(), v);
            }
            None if requirement.required => missing.push(name.clone()),
            None => {}
        }
    }

    if !missing.is_empty() {
        return Err(CatalogError::Configuration {
            server: descriptor.name.clone(),
            reason: format!("missing required environment variables: {}", missing.join(", ")),
        });
    }

    // Undeclared overrides are passed through as-is.
    for (name, value) in overrides {
        resolved.entry(name.clone()).or_insert_with(|| value.clone());
    }

    Ok(resolved)
}
