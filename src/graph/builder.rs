//! Builds a [`ResourceGraph`] from a desired-state document.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::config::{DesiredDocument, ModuleDeclaration, ProvisionerConfig, ResourceDeclaration};
use crate::error::{ConfigError, GraphError, Result};

use super::{
    collect_bodies, is_identifier, lookup_value, parse_reference, render, render_attributes,
    Address, BoundReference, Dag, InstanceKey, Reference, ResourceGraph, ResourceInstance,
};

/// An expanded instance waiting for its references to be bound.
struct Pending {
    instance: ResourceInstance,
    depends_on: Vec<String>,
}

/// One expansion of a declaration.
struct Expansion<'a> {
    key: Option<InstanceKey>,
    index: Option<u64>,
    each: Option<(&'a str, &'a Value)>,
}

impl Expansion<'_> {
    fn substitute(&self, body: &str) -> Option<Value> {
        match parse_reference(body).ok()? {
            Reference::CountIndex => self.index.map(Value::from),
            Reference::EachKey => self.each.map(|(k, _)| Value::String(k.to_string())),
            Reference::EachValue(path) => self.each.and_then(|(_, v)| lookup_value(v, &path)),
            _ => None,
        }
    }
}

/// Resource graph builder.
pub struct GraphBuilder {
    /// Declaration base address -> whether it uses `count` or `for_each`.
    declarations: BTreeMap<Address, bool>,
    pending: Vec<Pending>,
}

impl GraphBuilder {
    /// Expands, binds and validates a document into a graph.
    ///
    /// # Errors
    ///
    /// Returns an error on address conflicts, unknown references,
    /// malformed addresses or dependency cycles.
    pub fn build(document: &DesiredDocument) -> Result<ResourceGraph> {
        let mut builder = Self {
            declarations: BTreeMap::new(),
            pending: Vec::new(),
        };

        builder.expand_module(&[], &document.resources, &document.modules)?;

        let known: BTreeSet<Address> = builder
            .pending
            .iter()
            .map(|p| p.instance.address.clone())
            .collect();

        let mut instances = BTreeMap::new();
        let mut dag = Dag::new();

        for Pending {
            mut instance,
            depends_on,
        } in std::mem::take(&mut builder.pending)
        {
            builder.bind(&mut instance, &depends_on, &known)?;

            dag.add_node(instance.address.clone());
            for dependency in &instance.dependencies {
                dag.add_edge(instance.address.clone(), dependency.clone());
            }
            instances.insert(instance.address.clone(), instance);
        }

        let order = dag.topological_order().map_err(|cycle| GraphError::Cycle {
            cycle: cycle.iter().map(ToString::to_string).collect(),
        })?;

        info!(
            "Built resource graph: {} instances from {} declarations",
            instances.len(),
            builder.declarations.len()
        );

        Ok(ResourceGraph {
            instances,
            dag,
            order,
        })
    }

    fn expand_module(
        &mut self,
        module: &[String],
        resources: &[ResourceDeclaration],
        modules: &[ModuleDeclaration],
    ) -> Result<()> {
        for declaration in resources {
            self.expand_declaration(module, declaration)?;
        }

        for child in modules {
            ensure_identifier("module name", &child.name)?;
            let mut path = module.to_vec();
            path.push(child.name.clone());
            self.expand_module(&path, &child.resources, &child.modules)?;
        }

        Ok(())
    }

    fn expand_declaration(
        &mut self,
        module: &[String],
        declaration: &ResourceDeclaration,
    ) -> Result<()> {
        ensure_identifier("resource type", &declaration.resource_type)?;
        ensure_identifier("resource name", &declaration.name)?;
        let base = Address::new(&declaration.resource_type, &declaration.name).in_module(module);

        if declaration.count.is_some() && declaration.for_each.is_some() {
            return Err(ConfigError::validation(
                "count and for_each cannot be used together",
                base.to_string(),
            )
            .into());
        }

        let repeated = declaration.count.is_some() || declaration.for_each.is_some();
        if self.declarations.insert(base.clone(), repeated).is_some() {
            return Err(GraphError::AddressConflict {
                address: base.to_string(),
            }
            .into());
        }

        let each_entries = declaration
            .for_each
            .as_ref()
            .map(crate::config::ForEach::entries)
            .unwrap_or_default();

        let expansions: Vec<Expansion<'_>> = match (declaration.count, &declaration.for_each) {
            (Some(count), _) => (0..count)
                .map(|i| Expansion {
                    key: Some(InstanceKey::Index(i)),
                    index: Some(i),
                    each: None,
                })
                .collect(),
            (None, Some(_)) => each_entries
                .iter()
                .map(|(k, v)| Expansion {
                    key: Some(InstanceKey::Key(k.clone())),
                    index: None,
                    each: Some((k.as_str(), v)),
                })
                .collect(),
            (None, None) => vec![Expansion {
                key: None,
                index: None,
                each: None,
            }],
        };

        for expansion in expansions {
            let address = match &expansion.key {
                Some(key) => base.clone().with_key(key.clone()),
                None => base.clone(),
            };

            let mut substitute = |body: &str| expansion.substitute(body);
            let attributes = render_attributes(&declaration.attributes, &mut substitute).value;
            let provisioners = declaration
                .provisioners
                .iter()
                .map(|p| substitute_provisioner(&address, p, &mut substitute))
                .collect::<Result<Vec<_>>>()?;

            debug!("Expanded {}", address);

            self.pending.push(Pending {
                instance: ResourceInstance {
                    address,
                    kind: declaration.kind,
                    attributes,
                    dependencies: BTreeSet::new(),
                    lifecycle: declaration.lifecycle.clone(),
                    provisioners,
                    references: BTreeMap::new(),
                },
                depends_on: declaration.depends_on.clone(),
            });
        }

        Ok(())
    }

    /// Binds attribute references and explicit dependencies of one instance.
    fn bind(
        &self,
        instance: &mut ResourceInstance,
        depends_on: &[String],
        known: &BTreeSet<Address>,
    ) -> Result<()> {
        let unknown = |reference: &str| GraphError::UnknownReference {
            from: instance.address.to_string(),
            reference: reference.to_string(),
        };

        let mut bodies = Vec::new();
        for value in instance.attributes.values() {
            collect_bodies(value, &mut bodies);
        }

        let mut dependencies = BTreeSet::new();
        let mut references = BTreeMap::new();

        for body in bodies {
            let Ok(Reference::Resource { target, path }) = parse_reference(&body) else {
                return Err(unknown(&body).into());
            };
            let (targets, splat) = self
                .resolve_target(&instance.address.module, &target, known)
                .ok_or_else(|| unknown(&body))?;

            dependencies.extend(targets.iter().cloned());
            references.insert(
                body,
                BoundReference {
                    targets,
                    path,
                    splat,
                },
            );
        }

        for entry in depends_on {
            let target: Address = entry.parse()?;
            let (targets, _) = self
                .resolve_target(&instance.address.module, &target, known)
                .ok_or_else(|| unknown(entry))?;
            dependencies.extend(targets);
        }

        instance.dependencies = dependencies;
        instance.references = references;
        Ok(())
    }

    /// Resolves a target relative to `module` first, then from the root.
    fn resolve_target(
        &self,
        module: &[String],
        target: &Address,
        known: &BTreeSet<Address>,
    ) -> Option<(Vec<Address>, bool)> {
        let mut candidates = Vec::with_capacity(2);
        if target.is_root_module() && !module.is_empty() {
            candidates.push(target.clone().in_module(module));
        }
        candidates.push(target.clone());

        for candidate in candidates {
            if candidate.key.is_some() {
                if known.contains(&candidate) {
                    return Some((vec![candidate], false));
                }
            } else if let Some(&repeated) = self.declarations.get(&candidate) {
                let targets = known
                    .iter()
                    .filter(|a| a.base() == candidate)
                    .cloned()
                    .collect();
                return Some((targets, repeated));
            }
        }

        None
    }
}

/// Applies count/each substitution to a provisioner block.
/// Rejects names that would not survive an address round trip.
fn ensure_identifier(what: &str, text: &str) -> Result<()> {
    if is_identifier(text) {
        Ok(())
    } else {
        Err(ConfigError::validation(
            format!("{what} '{text}' may only contain letters, digits, '_' and '-'"),
            text,
        )
        .into())
    }
}

fn substitute_provisioner<F>(
    address: &Address,
    provisioner: &ProvisionerConfig,
    substitute: &mut F,
) -> Result<ProvisionerConfig>
where
    F: FnMut(&str) -> Option<Value>,
{
    let invalid = |e: serde_json::Error| {
        ConfigError::validation(
            format!("invalid provisioner after expansion: {e}"),
            address.to_string(),
        )
    };

    let value = serde_json::to_value(provisioner).map_err(invalid)?;
    let rendered = render(&value, substitute).value;
    Ok(serde_json::from_value(rendered).map_err(invalid)?)
}
