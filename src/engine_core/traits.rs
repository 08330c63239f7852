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

//! Collaborator interfaces consumed by the catalog core.
//!
//! Configuration loading lives outside the core; it is reached only through
//! these two traits.

use crate::engine_core::models::ServerDescriptor;

/// Name → present/absent lookup over some environment.
pub trait EnvResolver: Send + Sync {
    /// Returns the value of `name`, or `None` when unset or empty.
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Source of server descriptors keyed by logical name.
pub trait DescriptorSource: Send + Sync {
    /// All descriptors, in a stable order.
    fn descriptors(&self) -> Vec<ServerDescriptor>;

    fn descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        self.descriptors().into_iter().find(|d| d.name == name)
    }
}
