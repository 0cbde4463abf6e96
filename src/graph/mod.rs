//! Resource graph module.
//!
//! This module turns a desired-state document into a DAG of concrete
//! resource instances:
//! - Addresses and their text form
//! - `${...}` expressions and reference binding
//! - Expansion of `count` and `for_each`
//! - Dependency edges and cycle detection

mod address;
mod builder;
mod dag;
mod expr;

pub use address::{Address, InstanceKey};
pub use builder::GraphBuilder;
pub use dag::Dag;
pub use expr::{render, render_attributes, Rendered};

pub(crate) use address::{is_identifier, Segment};
pub(crate) use expr::{collect_bodies, lookup, lookup_value, parse_reference, Reference};

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{LifecyclePolicy, ProvisionerConfig, ResourceKind};

/// Attribute map of a resource: name to JSON value.
pub type Attributes = BTreeMap<String, Value>;

/// A reference bound to the instances it reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BoundReference {
    /// Instances read by the reference, in address order.
    pub targets: Vec<Address>,
    /// Attribute path inside each target.
    pub path: Vec<Segment>,
    /// The reference named an expanded declaration and yields a list.
    pub splat: bool,
}

impl BoundReference {
    /// Resolves the reference, returning `None` if any target is unknown.
    fn resolve<F>(&self, attributes_of: &mut F) -> Option<Value>
    where
        F: FnMut(&Address) -> Option<Attributes>,
    {
        let mut read = |address: &Address| {
            let attributes = attributes_of(address)?;
            if self.path.is_empty() {
                Some(Value::Object(attributes.into_iter().collect()))
            } else {
                lookup(&attributes, &self.path)
            }
        };

        if self.splat {
            self.targets
                .iter()
                .map(&mut read)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array)
        } else {
            self.targets.first().and_then(read)
        }
    }
}

/// A concrete, addressed resource instance.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInstance {
    /// Unique address.
    pub address: Address,
    /// Managed resource or trigger.
    pub kind: ResourceKind,
    /// Desired attributes after expansion; may still contain references.
    pub attributes: Attributes,
    /// Explicit and implicit dependencies.
    pub dependencies: BTreeSet<Address>,
    /// Lifecycle policy.
    pub lifecycle: LifecyclePolicy,
    /// Ordered provisioners.
    pub provisioners: Vec<ProvisionerConfig>,
    #[serde(skip)]
    pub(crate) references: BTreeMap<String, BoundReference>,
}

impl ResourceInstance {
    /// Renders the desired attributes, reading referenced instances through `attributes_of`.
    ///
    /// Expressions whose targets are unknown are left in place and listed
    /// in [`Rendered::unresolved`].
    pub fn render<F>(&self, mut attributes_of: F) -> Rendered<Attributes>
    where
        F: FnMut(&Address) -> Option<Attributes>,
    {
        render_attributes(&self.attributes, &mut |body: &str| {
            self.references.get(body)?.resolve(&mut attributes_of)
        })
    }

    /// Returns true if the instance is a trigger.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.kind == ResourceKind::Trigger
    }
}

/// The validated, acyclic graph of resource instances.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    instances: BTreeMap<Address, ResourceInstance>,
    dag: Dag<Address>,
    order: Vec<Address>,
}

impl ResourceGraph {
    /// Returns the instance at an address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&ResourceInstance> {
        self.instances.get(address)
    }

    /// Returns true if the graph contains the address.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.instances.contains_key(address)
    }

    /// Returns the number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Addresses with dependencies before dependents.
    #[must_use]
    pub fn order(&self) -> &[Address] {
        &self.order
    }

    /// Instances in topological order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceInstance> {
        self.order.iter().filter_map(|a| self.instances.get(a))
    }

    /// Instances that directly depend on `address`.
    pub fn dependents_of(&self, address: &Address) -> impl Iterator<Item = &Address> {
        self.dag.dependents_of(address)
    }

    /// The underlying dependency graph.
    #[must_use]
    pub const fn dag(&self) -> &Dag<Address> {
        &self.dag
    }
}
