use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::config::SimError;

//
// A tree of named statistic nodes. Each node holds scalar values and child
// nodes; snapshots of the whole tree are appended over the run and written
// out as YAML at the end.
//

#[derive(Serialize, Clone)]
#[serde(untagged)]
pub enum StatValue {
    Int(u64),
    Float(f64),
}

#[derive(Serialize, Clone, Default)]
pub struct StatsNode {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    values: BTreeMap<String, StatValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, StatsNode>,
}

impl StatsNode {
    pub fn new() -> StatsNode {
        StatsNode::default()
    }

    pub fn node(&mut self, name: &str) -> &mut StatsNode {
        self.children.entry(name.to_string()).or_default()
    }

    pub fn add(&mut self, name: &str, value: u64) {
        self.values.insert(name.to_string(), StatValue::Int(value));
    }

    pub fn addfloat(&mut self, name: &str, value: f64) {
        self.values
            .insert(name.to_string(), StatValue::Float(value));
    }

    /// Record the non-zero buckets of a histogram, keyed by bucket index.
    pub fn add_histogram(&mut self, name: &str, values: &[u64]) {
        let node = self.node(name);
        for (i, &v) in values.iter().enumerate() {
            if v != 0 {
                node.add(&i.to_string(), v);
            }
        }
    }

    pub fn add_named_histogram(&mut self, name: &str, names: &[&str], values: &[u64]) {
        let node = self.node(name);
        for (label, &v) in names.iter().zip(values.iter()) {
            if v != 0 {
                node.add(label, v);
            }
        }
    }

    pub fn get(&self, path: &[&str]) -> Option<u64> {
        let (last, dirs) = path.split_last()?;
        let mut node = self;
        for dir in dirs {
            node = node.children.get(*dir)?;
        }
        match node.values.get(*last)? {
            StatValue::Int(v) => Some(*v),
            StatValue::Float(v) => Some(*v as u64),
        }
    }
}

/// Accumulates one StatsNode tree per snapshot interval plus the final one.
pub struct StatsStore {
    snapshots: Vec<(String, StatsNode)>,
}

impl StatsStore {
    pub fn new() -> StatsStore {
        StatsStore {
            snapshots: Vec::new(),
        }
    }

    pub fn record(&mut self, name: String, root: StatsNode) {
        self.snapshots.push((name, root));
    }

    pub fn write(&self, path: &Path) -> Result<(), SimError> {
        let map: BTreeMap<&str, &StatsNode> = self
            .snapshots
            .iter()
            .map(|(name, node)| (name.as_str(), node))
            .collect();
        let mut file = File::create(path)?;
        let text = serde_yaml::to_string(&map)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_building() {
        let mut root = StatsNode::new();
        root.node("summary").add("cycles", 100);
        root.node("summary").addfloat("ipc", 1.5);
        root.node("fetch").add_histogram("width", &[0, 3, 0, 7]);
        assert_eq!(root.get(&["summary", "cycles"]), Some(100));
        assert_eq!(root.get(&["fetch", "width", "3"]), Some(7));
        assert_eq!(root.get(&["fetch", "width", "2"]), None);
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut root = StatsNode::new();
        root.node("commit").add("uops", 42);
        let text = serde_yaml::to_string(&root).unwrap();
        assert!(text.contains("uops: 42"));
    }
}
