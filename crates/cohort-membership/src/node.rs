//! Cluster nodes.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug)]
struct NodeData {
    id: Uuid,
    name: String,
    domain: String,
    address: String,
    properties: BTreeMap<String, String>,
}

/// An immutable cluster node, compared by id.
///
/// Cloning is cheap: the attributes are shared.
#[derive(Clone)]
pub struct Node {
    data: Arc<NodeData>,
}

impl Node {
    /// Create a node with a random id.
    pub fn new(name: impl Into<String>, domain: impl Into<String>, address: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name, domain, address, BTreeMap::new())
    }

    pub fn with_id(
        id: Uuid,
        name: impl Into<String>,
        domain: impl Into<String>,
        address: impl Into<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            data: Arc::new(NodeData {
                id,
                name: name.into(),
                domain: domain.into(),
                address: address.into(),
                properties,
            }),
        }
    }

    /// Return a copy of this node with an extra property.
    pub fn with_property(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut properties = self.data.properties.clone();
        properties.insert(key.into(), value.into());
        Self::with_id(
            self.data.id,
            self.data.name.clone(),
            self.data.domain.clone(),
            self.data.address.clone(),
            properties,
        )
    }

    pub fn id(&self) -> Uuid {
        self.data.id
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn domain(&self) -> &str {
        &self.data.domain
    }

    /// Transport address, also used as the connection key.
    pub fn address(&self) -> &str {
        &self.data.address
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.data.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.data.properties.get(key).map(String::as_str)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.data.id == other.data.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.data.id)
            .field("name", &self.data.name)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.data.name, self.data.address)
    }
}
