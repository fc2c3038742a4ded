use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, RexecError};

const UTAH_SUFFIX: &str = ".utah.cloudlab.us";
const EMULAB_SUFFIX: &str = ".apt.emulab.net";
const UTAH_TYPES: [&str; 4] = ["xl170", "d6515", "c6525-100g", "m510"];
const EMULAB_TYPES: [&str; 1] = ["r320"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: String,
    pub descriptor: String,
    pub node_type: String,
}

pub fn parse_node_file(path: &Path) -> Result<Vec<NodeRecord>> {
    let raw = fs::read_to_string(path)?;
    parse_nodes(path, &raw)
}

pub fn parse_nodes(path: &Path, raw: &str) -> Result<Vec<NodeRecord>> {
    let mut nodes = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(RexecError::MalformedNodeFile {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: format!("expected 3 comma separated fields, found {}", fields.len()),
            });
        }
        if fields.iter().any(|f| f.is_empty()) {
            return Err(RexecError::MalformedNodeFile {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: "empty field".to_string(),
            });
        }
        nodes.push(NodeRecord {
            id: fields[0].to_string(),
            descriptor: fields[1].to_string(),
            node_type: fields[2].to_string(),
        });
    }
    Ok(nodes)
}

pub fn testbed_label(nodefile: &Path) -> String {
    nodefile
        .file_name()
        .and_then(|s| s.to_str())
        .and_then(|s| s.split('.').next())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct DomainTable {
    suffixes: BTreeMap<String, String>,
}

impl Default for DomainTable {
    fn default() -> Self {
        let mut suffixes = BTreeMap::new();
        for t in UTAH_TYPES {
            suffixes.insert(t.to_string(), UTAH_SUFFIX.to_string());
        }
        for t in EMULAB_TYPES {
            suffixes.insert(t.to_string(), EMULAB_SUFFIX.to_string());
        }
        Self { suffixes }
    }
}

impl DomainTable {
    pub fn empty() -> Self {
        Self {
            suffixes: BTreeMap::new(),
        }
    }

    pub fn with_entries(mut self, entries: &BTreeMap<String, String>) -> Self {
        for (node_type, suffix) in entries {
            self.suffixes.insert(node_type.clone(), suffix.clone());
        }
        self
    }

    pub fn suffix(&self, node_type: &str) -> Option<&str> {
        self.suffixes.get(node_type).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: String,
    pub hostname: String,
}

/// Resolved hosts in node file order, one per id. Offline nodes are never present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSet {
    hosts: Vec<Host>,
}

impl HostSet {
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, id: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn active(&self, count: Option<usize>) -> &[Host] {
        let n = count.unwrap_or(self.hosts.len()).min(self.hosts.len());
        &self.hosts[..n]
    }
}

pub fn resolve(
    nodes: &[NodeRecord],
    offline: &BTreeSet<String>,
    table: &DomainTable,
) -> Result<HostSet> {
    let mut hosts: Vec<Host> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if offline.contains(&node.id) {
            continue;
        }
        let suffix = table
            .suffix(&node.node_type)
            .ok_or_else(|| RexecError::UnknownNodeType {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
            })?;
        let hostname = format!("{}{}", node.descriptor, suffix);
        // A repeated id keeps its first position and takes the later hostname.
        match hosts.iter_mut().find(|h| h.id == node.id) {
            Some(existing) => {
                debug!("node {} listed again, now {}", node.id, hostname);
                existing.hostname = hostname;
            }
            None => hosts.push(Host {
                id: node.id.clone(),
                hostname,
            }),
        }
    }
    Ok(HostSet { hosts })
}
