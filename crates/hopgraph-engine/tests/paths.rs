use hopgraph_core::{Cardinality, CollectionSchema, FieldDefinition, FieldType, SchemaRegistry};
use hopgraph_engine::PathFinder;
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

fn cardinality() -> impl Strategy<Value = Cardinality> {
    prop_oneof![
        Just(Cardinality::OneToOne),
        Just(Cardinality::OneToMany),
        Just(Cardinality::ManyToOne),
        Just(Cardinality::ManyToMany),
    ]
}

/// Up to eight collections with relationships declared on the lower-numbered side.
fn graph() -> impl Strategy<Value = (usize, BTreeMap<(usize, usize), Cardinality>)> {
    (2usize..8).prop_flat_map(|n| {
        let edge = (0..n, 0..n, cardinality());
        (
            Just(n),
            prop::collection::vec(edge, 0..12).prop_map(|edges| {
                edges
                    .into_iter()
                    .filter(|(a, b, _)| a < b)
                    .map(|(a, b, c)| ((a, b), c))
                    .collect()
            }),
        )
    })
}

fn name(i: usize) -> String {
    format!("c{i}")
}

fn build(n: usize, edges: &BTreeMap<(usize, usize), Cardinality>) -> PathFinder {
    let schemas = (0..n)
        .map(|i| {
            let mut s = CollectionSchema::new(name(i));
            for ((_, b), card) in edges.iter().filter(|((a, _), _)| *a == i) {
                let field = format!("{}Id", name(*b));
                s = s
                    .field_def(FieldDefinition::new(field.clone(), FieldType::Identifier))
                    .relate(&field, &name(*b), *card, None);
            }
            s
        })
        .collect();
    PathFinder::new(Arc::new(SchemaRegistry::new(schemas).unwrap()))
}

proptest! {
    #[test]
    fn declared_relationships_resolve_both_ways((n, edges) in graph()) {
        let finder = build(n, &edges);
        for ((a, b), card) in &edges {
            let fwd = finder.find_path(&name(*a), &name(*b)).unwrap();
            let back = finder.find_path(&name(*b), &name(*a)).unwrap();
            prop_assert_eq!(fwd.cardinality, *card);
            prop_assert_eq!(back.cardinality, card.inverse());
            prop_assert_eq!(&fwd.source_field, &back.via);
            prop_assert_eq!(&fwd.via, &back.source_field);
        }
    }

    #[test]
    fn chains_are_connected_and_acyclic((n, edges) in graph(), from in 0usize..8, to in 0usize..8) {
        let finder = build(n, &edges);
        let (from, to) = (name(from % n), name(to % n));
        let chain = finder.find_chain(&from, &to);
        prop_assert_eq!(&chain, &finder.find_chain(&from, &to));
        if chain.is_empty() {
            return Ok(());
        }
        prop_assert_eq!(&chain[0].from, &from);
        prop_assert_eq!(&chain[chain.len() - 1].to, &to);
        let mut visited = HashSet::new();
        visited.insert(chain[0].from.clone());
        for pair in chain.windows(2) {
            prop_assert_eq!(&pair[0].to, &pair[1].from);
        }
        for hop in &chain {
            prop_assert!(visited.insert(hop.to.clone()), "collection revisited: {}", hop.to);
        }
    }
}
