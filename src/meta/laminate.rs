use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::meta::{Item, Meta, MetaProvider, Value};
use crate::name::{IntoName, Name};

/// An ordered stack of [`Meta`] layers.
///
/// Lookups go through the layers in declared order and stop at the first
/// layer defining the key. The order is fixed at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Laminate {
    layers: Arc<[Meta]>,
}

impl Laminate {
    pub fn new(layers: impl IntoIterator<Item = Meta>) -> Self {
        Self {
            layers: layers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }

    pub fn layers(&self) -> &[Meta] {
        &self.layers
    }

    /// A laminate of the child nodes at `key` in every layer defining one.
    pub fn node(&self, key: impl IntoName) -> Option<Laminate> {
        let name = key.into_name().ok()?;
        let layers: Vec<Meta> = self
            .layers
            .iter()
            .filter_map(|layer| layer.node_by_name(&name).cloned())
            .collect();

        (!layers.is_empty()).then(|| Laminate::new(layers))
    }

    /// Flattens the stack into a single tree.
    ///
    /// Values come from the first layer defining them. A key holding a single
    /// child node in several layers is merged recursively with the same rule,
    /// repeated node lists are taken whole from the first layer.
    pub fn merge(&self) -> Meta {
        let layers: Vec<&Meta> = self.layers.iter().collect();
        merge_layers(&layers)
    }
}

fn merge_layers(layers: &[&Meta]) -> Meta {
    match layers {
        [] => return Meta::empty(),
        [single] => return (*single).clone(),
        _ => {}
    }

    let keys: BTreeSet<&str> = layers.iter().flat_map(|layer| layer.keys()).collect();
    let mut items = BTreeMap::new();

    for key in keys {
        let defined: Vec<&Item> = layers.iter().filter_map(|layer| layer.raw(key)).collect();

        let item = match defined[0] {
            Item::Nodes(nodes) if nodes.len() == 1 => {
                let children: Vec<&Meta> = defined
                    .iter()
                    .filter_map(|item| match item {
                        Item::Nodes(nodes) if nodes.len() == 1 => Some(&nodes[0]),
                        _ => None,
                    })
                    .collect();
                Item::Nodes(vec![merge_layers(&children)])
            }
            first => first.clone(),
        };

        items.insert(key.to_string(), item);
    }

    Meta {
        items: Arc::new(items),
    }
}

impl MetaProvider for Laminate {
    fn value(&self, name: &Name) -> Option<&Value> {
        self.layers.iter().find_map(|layer| layer.value(name))
    }
}

impl From<Meta> for Laminate {
    fn from(meta: Meta) -> Self {
        Laminate::new([meta])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(json: serde_json::Value) -> Meta {
        Meta::from_json(&json).unwrap()
    }

    #[test]
    fn test_first_layer_wins() {
        let laminate = Laminate::new([
            meta(serde_json::json!({ "a": 1 })),
            meta(serde_json::json!({ "a": 2, "b": 3 })),
            meta(serde_json::json!({ "a": 4, "b": 5, "c": 6 })),
        ]);

        assert_eq!(laminate.get_i64("a"), Some(1));
        assert_eq!(laminate.get_i64("b"), Some(3));
        assert_eq!(laminate.get_i64("c"), Some(6));
        assert_eq!(laminate.get_i64("d"), None);
    }

    #[test]
    fn test_first_layer_wins_for_every_key() {
        let layers: Vec<Meta> = (0..5)
            .map(|i| {
                let mut builder = Meta::builder();
                for key in 0..=i {
                    builder.set(format!("k{key}"), i).unwrap();
                }
                builder.build()
            })
            .collect();

        let laminate = Laminate::new(layers);
        for key in 0..5 {
            assert_eq!(laminate.get_i64(format!("k{key}")), Some(key));
        }
    }

    #[test]
    fn test_nested_lookup_falls_through() {
        let laminate = Laminate::new([
            meta(serde_json::json!({ "cache": { "dir": "a" } })),
            meta(serde_json::json!({ "cache": { "dir": "b", "enabled": true } })),
        ]);

        assert_eq!(laminate.get_str("cache.dir"), Some("a"));
        assert_eq!(laminate.get_bool("cache.enabled"), Some(true));

        let cache = laminate.node("cache").unwrap();
        assert_eq!(cache.layers().len(), 2);
        assert_eq!(cache.get_str("dir"), Some("a"));
    }

    #[test]
    fn test_merge() {
        let laminate = Laminate::new([
            meta(serde_json::json!({ "cache": { "dir": "a" }, "list": [{"x": 1}] })),
            meta(serde_json::json!({
                "cache": { "dir": "b", "enabled": true },
                "list": [{"x": 2}, {"x": 3}],
                "extra": "yes",
            })),
        ]);

        let merged = laminate.merge();
        assert_eq!(merged.get_str("cache.dir"), Some("a"));
        assert_eq!(merged.get_bool("cache.enabled"), Some(true));
        assert_eq!(merged.nodes("list").len(), 1);
        assert_eq!(merged.get_str("extra"), Some("yes"));
    }

    #[test]
    fn test_empty() {
        let laminate = Laminate::default();
        assert!(laminate.get("a").is_none());
        assert!(laminate.node("a").is_none());
        assert!(laminate.merge().is_empty());
    }
}
