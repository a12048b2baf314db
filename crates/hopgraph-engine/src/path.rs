//! Join-path discovery over the relationship graph.
//!
//! Relationships are traversable from both sides. A direct relationship is
//! always preferred; otherwise an iterative depth-first search returns the
//! first complete chain it reaches. That chain is not guaranteed to be the
//! shortest one when several exist.

use hopgraph_core::{HoppingPath, SchemaRegistry};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct PathFinder {
    registry: Arc<SchemaRegistry>,
}

impl PathFinder {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Single hop from `from` to `to`, with cardinality expressed in that direction.
    pub fn find_path(&self, from: &str, to: &str) -> Option<HoppingPath> {
        let src = self.registry.get_schema(from)?;
        let dst = self.registry.get_schema(to)?;
        if let Some(r) = src.relationships.iter().find(|r| r.target == to) {
            return Some(HoppingPath {
                from: from.to_string(),
                to: to.to_string(),
                source_field: r.field.clone(),
                via: r.via.clone().unwrap_or_else(|| dst.id_field.clone()),
                cardinality: r.cardinality,
            });
        }
        dst.relationships
            .iter()
            .find(|r| r.target == from)
            .map(|r| HoppingPath {
                from: from.to_string(),
                to: to.to_string(),
                source_field: r.via.clone().unwrap_or_else(|| src.id_field.clone()),
                via: r.field.clone(),
                cardinality: r.cardinality.inverse(),
            })
    }

    /// Ordered hops connecting `from` to `to`; empty when unrelated, unknown, or equal.
    pub fn find_chain(&self, from: &str, to: &str) -> Vec<HoppingPath> {
        if from == to
            || self.registry.get_schema(from).is_none()
            || self.registry.get_schema(to).is_none()
        {
            return Vec::new();
        }
        if let Some(p) = self.find_path(from, to) {
            return vec![p];
        }
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, Vec<HoppingPath>)> = vec![(from.to_string(), Vec::new())];
        while let Some((current, chain)) = stack.pop() {
            if current == to {
                tracing::debug!(from, to, hops = chain.len(), "hop chain found");
                return chain;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            let neighbours = self.registry.get_related_collections(&current);
            // reversed so the first declared neighbour is explored first
            for next in neighbours.into_iter().rev() {
                if visited.contains(&next) {
                    continue;
                }
                if let Some(edge) = self.find_path(&current, &next) {
                    let mut extended = chain.clone();
                    extended.push(edge);
                    stack.push((next, extended));
                }
            }
        }
        Vec::new()
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }
}
