use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DurationValue {
    pub raw: String,
    pub millis: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Duration(DurationValue),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Self::Duration(value) => Some(value.millis),
            Self::Integer(value) if *value >= 0 => Some(*value as u64),
            _ => None,
        }
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Duration(value) => value.raw.clone(),
        }
    }
}

/// Attribute bag shared by graphs, nodes, and edges. Tracks which keys were
/// written explicitly so DOT default-attribute inheritance can tell a user
/// value apart from an inherited one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
    explicit_keys: BTreeSet<String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn set_inherited(&mut self, key: impl Into<String>, value: AttrValue) {
        self.values.insert(key.into(), value);
    }

    pub fn set_explicit(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        self.explicit_keys.insert(key.clone());
        self.values.insert(key, value);
    }

    pub fn merge_inherited(&mut self, other: &Attributes) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn merge_with_explicit_tracking(&mut self, other: &Attributes) {
        for (key, value) in &other.values {
            if other.explicit_keys.contains(key) {
                self.explicit_keys.insert(key.clone());
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_i64)
    }

    pub fn get_millis(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(AttrValue::as_millis)
    }

    pub fn is_explicit(&self, key: &str) -> bool {
        self.explicit_keys.contains(key)
    }

    pub fn without_explicit(&self) -> Self {
        Self {
            values: self.values.clone(),
            explicit_keys: BTreeSet::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub attrs: Attributes,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: Attributes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub attrs: Attributes,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing, skip_deserializing)]
    pub source_dot: Option<String>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            source_dot: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    pub fn start_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| {
                node.attrs.get_str("shape") == Some("Mdiamond")
                    || node.attrs.get_str("type") == Some("start")
                    || node.id.eq_ignore_ascii_case("start")
            })
            .collect()
    }

    pub fn terminal_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| {
                node.attrs.get_str("shape") == Some("Msquare")
                    || node.attrs.get_str("type") == Some("exit")
                    || matches!(node.id.to_ascii_lowercase().as_str(), "exit" | "end")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_explicit_tracking_survives_merge() {
        let mut defaults = Attributes::new();
        defaults.set_inherited("timeout", AttrValue::Integer(500));

        let mut explicit = Attributes::new();
        explicit.set_explicit("prompt", AttrValue::String("do work".to_string()));

        let mut merged = defaults.without_explicit();
        merged.merge_with_explicit_tracking(&explicit);

        assert!(merged.is_explicit("prompt"));
        assert!(!merged.is_explicit("timeout"));
        assert_eq!(merged.get_i64("timeout"), Some(500));
    }

    #[test]
    fn attr_value_as_millis_accepts_duration_and_integer() {
        let duration = AttrValue::Duration(DurationValue {
            raw: "2s".to_string(),
            millis: 2_000,
        });
        assert_eq!(duration.as_millis(), Some(2_000));
        assert_eq!(AttrValue::Integer(250).as_millis(), Some(250));
        assert_eq!(AttrValue::Integer(-1).as_millis(), None);
    }

    #[test]
    fn start_candidates_match_shape_type_and_id() {
        let mut graph = Graph::new("g");
        let mut by_shape = Node::new("begin");
        by_shape
            .attrs
            .set_explicit("shape", AttrValue::String("Mdiamond".to_string()));
        graph.nodes.insert("begin".to_string(), by_shape);
        graph.nodes.insert("start".to_string(), Node::new("start"));

        assert_eq!(graph.start_candidates().len(), 2);
    }
}
