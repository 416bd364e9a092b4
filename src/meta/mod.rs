//! Immutable configuration trees and layered overrides.

mod laminate;
mod value;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::Hash32;
use crate::error::{ConfigError, NameError};
use crate::name::{IntoName, Name, Token};

pub use laminate::Laminate;
pub use value::Value;

/// Entry stored under one key of a [`Meta`] node.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Value(Value),
    /// Child nodes. A single child is a list of one.
    Nodes(Vec<Meta>),
}

/// An immutable configuration tree keyed by [`Name`] segments.
///
/// Cloning is cheap, the tree is shared. Use [`Meta::edit`] or
/// [`MetaBuilder`] to derive a modified copy.
#[derive(Clone, Default, PartialEq)]
pub struct Meta {
    items: Arc<BTreeMap<String, Item>>,
}

enum Found<'a> {
    Value(&'a Value),
    Nodes(&'a [Meta], Option<usize>),
}

impl Meta {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> MetaBuilder {
        MetaBuilder::default()
    }

    /// Starts a builder pre-filled with this tree.
    pub fn edit(&self) -> MetaBuilder {
        MetaBuilder {
            items: (*self.items).clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &Item)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn raw(&self, key: &str) -> Option<&Item> {
        self.items.get(key)
    }

    fn find(&self, name: &Name) -> Option<Found<'_>> {
        let mut node = self;
        let (last, path) = name.tokens().split_last()?;

        for token in path {
            match node.items.get(token.body())? {
                Item::Nodes(nodes) => node = nodes.get(token.index().unwrap_or(0))?,
                Item::Value(_) => return None,
            }
        }

        match node.items.get(last.body())? {
            Item::Value(Value::List(list)) if last.index().is_some() => {
                list.get(last.index()?).map(Found::Value)
            }
            Item::Value(_) if last.index().is_some() => None,
            Item::Value(value) => Some(Found::Value(value)),
            Item::Nodes(nodes) => Some(Found::Nodes(nodes, last.index())),
        }
    }

    /// Child node at `key`. An index selects among repeated nodes, the first
    /// one is used otherwise.
    pub fn node(&self, key: impl IntoName) -> Option<&Meta> {
        let name = key.into_name().ok()?;
        self.node_by_name(&name)
    }

    pub(crate) fn node_by_name(&self, name: &Name) -> Option<&Meta> {
        match self.find(name)? {
            Found::Nodes(nodes, index) => nodes.get(index.unwrap_or(0)),
            Found::Value(_) => None,
        }
    }

    /// All repeated child nodes at `key`, empty when absent.
    pub fn nodes(&self, key: impl IntoName) -> &[Meta] {
        let Ok(name) = key.into_name() else {
            return &[];
        };
        match self.find(&name) {
            Some(Found::Nodes(nodes, None)) => nodes,
            Some(Found::Nodes(nodes, Some(i))) => nodes.get(i..=i).unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn contains(&self, key: impl IntoName) -> bool {
        key.into_name()
            .ok()
            .and_then(|name| self.find(&name))
            .is_some()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .items
            .iter()
            .map(|(key, item)| {
                let json = match item {
                    Item::Value(value) => value.to_json(),
                    Item::Nodes(nodes) if nodes.len() == 1 => nodes[0].to_json(),
                    Item::Nodes(nodes) => {
                        serde_json::Value::Array(nodes.iter().map(Meta::to_json).collect())
                    }
                };
                (key.clone(), json)
            })
            .collect();

        serde_json::Value::Object(map)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self, ConfigError> {
        let object = json.as_object().ok_or(ConfigError::NotAnObject)?;
        let mut items = BTreeMap::new();

        for (key, value) in object {
            let item = match value {
                serde_json::Value::Object(_) => Item::Nodes(vec![Meta::from_json(value)?]),
                serde_json::Value::Array(array)
                    if !array.is_empty() && array.iter().all(serde_json::Value::is_object) =>
                {
                    Item::Nodes(
                        array
                            .iter()
                            .map(Meta::from_json)
                            .collect::<Result<_, _>>()?,
                    )
                }
                other => Item::Value(Value::from_json_scalar(other).ok_or(ConfigError::NotAnObject)?),
            };
            items.insert(key.clone(), item);
        }

        Ok(Self {
            items: Arc::new(items),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        Self::from_json(&json)
    }

    /// Deterministic string form, keys sorted at every level.
    pub fn canonical(&self) -> String {
        self.to_json().to_string()
    }

    /// BLAKE3 digest of [`Meta::canonical`], hex encoded.
    pub fn digest(&self) -> String {
        Hash32::hash(self.canonical()).to_hex()
    }
}

impl std::fmt::Debug for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Meta({})", self.canonical())
    }
}

impl Serialize for Meta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Meta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Meta::from_json(&json).map_err(serde::de::Error::custom)
    }
}

/// Read access shared by [`Meta`] and [`Laminate`].
///
/// A missing key is `None`. The `require_*` variants turn absence or a type
/// mismatch into a [`ConfigError`] for callers with no sensible default.
pub trait MetaProvider {
    fn value(&self, name: &Name) -> Option<&Value>;

    fn get(&self, key: impl IntoName) -> Option<&Value> {
        let name = key.into_name().ok()?;
        self.value(&name)
    }

    fn get_bool(&self, key: impl IntoName) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    fn get_i64(&self, key: impl IntoName) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    fn get_f64(&self, key: impl IntoName) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    fn get_str(&self, key: impl IntoName) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Strings under `key`, accepting both a single string and a list.
    fn get_strings(&self, key: impl IntoName) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .to_list()
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn require(&self, key: impl IntoName) -> Result<&Value, ConfigError> {
        let name = key.into_name()?;
        self.value(&name).ok_or(ConfigError::Missing(name))
    }

    fn require_bool(&self, key: impl IntoName) -> Result<bool, ConfigError> {
        let name = key.into_name()?;
        typed(self.value(&name), &name, "a boolean", Value::as_bool)
    }

    fn require_i64(&self, key: impl IntoName) -> Result<i64, ConfigError> {
        let name = key.into_name()?;
        typed(self.value(&name), &name, "an integer", Value::as_i64)
    }

    fn require_f64(&self, key: impl IntoName) -> Result<f64, ConfigError> {
        let name = key.into_name()?;
        typed(self.value(&name), &name, "a number", Value::as_f64)
    }

    fn require_str(&self, key: impl IntoName) -> Result<&str, ConfigError> {
        let name = key.into_name()?;
        let value = self.value(&name);
        typed(value, &name, "a string", Value::as_str)
    }
}

fn typed<'a, T>(
    value: Option<&'a Value>,
    name: &Name,
    expected: &'static str,
    cast: impl Fn(&'a Value) -> Option<T>,
) -> Result<T, ConfigError> {
    let value = value.ok_or_else(|| ConfigError::Missing(name.clone()))?;
    cast(value).ok_or_else(|| ConfigError::WrongType {
        key: name.clone(),
        expected,
        found: value.type_name(),
    })
}

impl MetaProvider for Meta {
    fn value(&self, name: &Name) -> Option<&Value> {
        match self.find(name)? {
            Found::Value(value) => Some(value),
            Found::Nodes(..) => None,
        }
    }
}

/// Mutable staging area for a [`Meta`].
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    items: BTreeMap<String, Item>,
}

impl MetaBuilder {
    pub fn set(
        &mut self,
        key: impl IntoName,
        value: impl Into<Value>,
    ) -> Result<&mut Self, NameError> {
        let name = key.into_name()?;
        put(&mut self.items, name.tokens(), Item::Value(value.into()));
        Ok(self)
    }

    pub fn with(mut self, key: impl IntoName, value: impl Into<Value>) -> Result<Self, NameError> {
        self.set(key, value)?;
        Ok(self)
    }

    /// Replaces whatever is stored at `key` with a single child node.
    pub fn set_node(&mut self, key: impl IntoName, node: Meta) -> Result<&mut Self, NameError> {
        let name = key.into_name()?;
        put(&mut self.items, name.tokens(), Item::Nodes(vec![node]));
        Ok(self)
    }

    pub fn with_node(mut self, key: impl IntoName, node: Meta) -> Result<Self, NameError> {
        self.set_node(key, node)?;
        Ok(self)
    }

    /// Appends a node to the repeated list at `key`.
    pub fn push_node(&mut self, key: impl IntoName, node: Meta) -> Result<&mut Self, NameError> {
        let name = key.into_name()?;
        let Some((last, path)) = name.tokens().split_last() else {
            return Ok(self);
        };
        let parent = descend(&mut self.items, path);

        match parent.get_mut(last.body()) {
            Some(Item::Nodes(nodes)) => nodes.push(node),
            _ => {
                parent.insert(last.body().to_string(), Item::Nodes(vec![node]));
            }
        }

        Ok(self)
    }

    pub fn remove(&mut self, key: impl IntoName) -> Result<&mut Self, NameError> {
        let name = key.into_name()?;
        if let Some((last, path)) = name.tokens().split_last() {
            descend(&mut self.items, path).remove(last.body());
        }
        Ok(self)
    }

    pub fn build(self) -> Meta {
        Meta {
            items: Arc::new(self.items),
        }
    }
}

impl From<MetaBuilder> for Meta {
    fn from(builder: MetaBuilder) -> Self {
        builder.build()
    }
}

/// Walks `path`, creating empty nodes where needed, and returns the map of
/// the innermost node.
fn descend<'a>(
    mut items: &'a mut BTreeMap<String, Item>,
    path: &[Token],
) -> &'a mut BTreeMap<String, Item> {
    for token in path {
        let index = token.index().unwrap_or(0);
        let entry = items
            .entry(token.body().to_string())
            .or_insert_with(|| Item::Nodes(Vec::new()));

        if !matches!(entry, Item::Nodes(_)) {
            *entry = Item::Nodes(Vec::new());
        }

        let Item::Nodes(nodes) = entry else {
            unreachable!("entry was just replaced with nodes");
        };

        if nodes.len() <= index {
            nodes.resize_with(index + 1, Meta::default);
        }

        items = Arc::make_mut(&mut nodes[index].items);
    }

    items
}

fn put(items: &mut BTreeMap<String, Item>, tokens: &[Token], item: Item) {
    let Some((last, path)) = tokens.split_last() else {
        return;
    };
    let parent = descend(items, path);

    match (last.index(), item) {
        (Some(index), Item::Value(value)) => {
            let mut list = match parent.remove(last.body()) {
                Some(Item::Value(Value::List(list))) => list,
                _ => Vec::new(),
            };
            if list.len() <= index {
                list.resize(index + 1, Value::Null);
            }
            list[index] = value;
            parent.insert(last.body().to_string(), Item::Value(Value::List(list)));
        }
        (Some(index), Item::Nodes(mut new)) => {
            let mut nodes = match parent.remove(last.body()) {
                Some(Item::Nodes(nodes)) => nodes,
                _ => Vec::new(),
            };
            if nodes.len() <= index {
                nodes.resize_with(index + 1, Meta::default);
            }
            if let Some(node) = new.pop() {
                nodes[index] = node;
            }
            parent.insert(last.body().to_string(), Item::Nodes(nodes));
        }
        (None, item) => {
            parent.insert(last.body().to_string(), item);
        }
    }
}
