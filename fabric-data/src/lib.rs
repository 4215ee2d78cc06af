//! Data model for the fabric device shadow.
//!
//! This crate holds the plain-data vocabulary shared by the controller and
//! its per-node device shadows: endpoint/cluster/attribute identifiers,
//! interaction paths, the self-describing [`DataValue`] carried in reports
//! and writes, and the per-cluster [`ClusterData`] unit of persistence.
//! There is no I/O and no async here; everything is `serde`-encodable so
//! the storage layer can pick its own on-disk format.

pub mod cluster;
pub mod ids;
pub mod status;
pub mod value;
pub mod well_known;

pub use cluster::{ClusterData, DataVersionFilter};
pub use ids::{
    AttributeId, AttributePath, ClusterId, ClusterPath, CommandId, CommandPath, DataVersion,
    EndpointId, EventId, EventPath, NodeId,
};
pub use status::Status;
pub use value::DataValue;
