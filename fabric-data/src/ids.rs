//! Identifiers and interaction paths.

use serde::{Deserialize, Serialize};

/// An addressable sub-device on a node.
pub type EndpointId = u16;
/// A grouping of related attributes, commands and events on an endpoint.
pub type ClusterId = u32;
/// A named, typed field on a cluster.
pub type AttributeId = u32;
/// A command exposed by a cluster.
pub type CommandId = u32;
/// An event emitted by a cluster.
pub type EventId = u32;
/// A remote node in the fabric.
pub type NodeId = u64;
/// Monotonic counter bumped by the node on any attribute change in a cluster.
pub type DataVersion = u32;

/// Addresses one attribute on one cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributePath {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub attribute: AttributeId,
}

impl AttributePath {
    pub fn new(endpoint: EndpointId, cluster: ClusterId, attribute: AttributeId) -> Self {
        Self {
            endpoint,
            cluster,
            attribute,
        }
    }

    /// The cluster instance this attribute lives on.
    pub fn cluster_path(&self) -> ClusterPath {
        ClusterPath::new(self.endpoint, self.cluster)
    }
}

impl std::fmt::Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{:#06x}/{:#06x}",
            self.endpoint, self.cluster, self.attribute
        )
    }
}

/// Addresses one cluster instance on one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterPath {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
}

impl ClusterPath {
    pub fn new(endpoint: EndpointId, cluster: ClusterId) -> Self {
        Self { endpoint, cluster }
    }

    pub fn attribute(&self, attribute: AttributeId) -> AttributePath {
        AttributePath::new(self.endpoint, self.cluster, attribute)
    }
}

impl std::fmt::Display for ClusterPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:#06x}", self.endpoint, self.cluster)
    }
}

/// Addresses one command on one cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandPath {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub command: CommandId,
}

impl CommandPath {
    pub fn new(endpoint: EndpointId, cluster: ClusterId, command: CommandId) -> Self {
        Self {
            endpoint,
            cluster,
            command,
        }
    }
}

impl std::fmt::Display for CommandPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{:#06x}/cmd {:#04x}",
            self.endpoint, self.cluster, self.command
        )
    }
}

/// Addresses one event source on one cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPath {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub event: EventId,
}

impl EventPath {
    pub fn new(endpoint: EndpointId, cluster: ClusterId, event: EventId) -> Self {
        Self {
            endpoint,
            cluster,
            event,
        }
    }
}

impl std::fmt::Display for EventPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{:#06x}/evt {:#04x}",
            self.endpoint, self.cluster, self.event
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_path_projects_cluster_path() {
        let path = AttributePath::new(1, 0x0006, 0);
        assert_eq!(path.cluster_path(), ClusterPath::new(1, 0x0006));
        assert_eq!(path.cluster_path().attribute(0), path);
    }

    #[test]
    fn paths_order_by_endpoint_first() {
        let a = AttributePath::new(0, 0xFFFF_FFFF, 0xFFFF_FFFF);
        let b = AttributePath::new(1, 0, 0);
        assert!(a < b);
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(AttributePath::new(0, 0x1D, 3).to_string(), "0/0x001d/0x0003");
    }
}
