//! Well-known cluster and attribute identifiers the shadow special-cases.

use crate::ids::{AttributeId, ClusterId};

/// Describes the endpoint composition of a node.
pub const CLUSTER_DESCRIPTOR: ClusterId = 0x001D;
/// Power source metering.
pub const CLUSTER_POWER_SOURCE: ClusterId = 0x002F;
/// General diagnostics counters.
pub const CLUSTER_GENERAL_DIAGNOSTICS: ClusterId = 0x0033;
/// Operational credential (NOC) storage.
pub const CLUSTER_OPERATIONAL_CREDENTIALS: ClusterId = 0x003E;
/// Time synchronization.
pub const CLUSTER_TIME_SYNCHRONIZATION: ClusterId = 0x0038;

/// Descriptor: list of device types on the endpoint.
pub const DESCRIPTOR_DEVICE_TYPE_LIST: AttributeId = 0x0000;
/// Descriptor: clusters served by the endpoint.
pub const DESCRIPTOR_SERVER_LIST: AttributeId = 0x0001;
/// Descriptor: endpoints composed beneath this one.
pub const DESCRIPTOR_PARTS_LIST: AttributeId = 0x0003;

/// Global attribute: commands the cluster accepts.
pub const GLOBAL_ACCEPTED_COMMAND_LIST: AttributeId = 0xFFF9;
/// Global attribute: attributes the cluster serves.
pub const GLOBAL_ATTRIBUTE_LIST: AttributeId = 0xFFFB;
/// Global attribute: cluster feature bitmap.
pub const GLOBAL_FEATURE_MAP: AttributeId = 0xFFFC;
/// Global attribute: cluster revision.
pub const GLOBAL_CLUSTER_REVISION: AttributeId = 0xFFFD;

/// General diagnostics: seconds since boot.
pub const GENERAL_DIAGNOSTICS_UP_TIME: AttributeId = 0x0002;
/// General diagnostics: lifetime operational hours.
pub const GENERAL_DIAGNOSTICS_TOTAL_OPERATIONAL_HOURS: AttributeId = 0x0003;
/// Operational credentials: the NOC list.
pub const OPERATIONAL_CREDENTIALS_NOCS: AttributeId = 0x0000;
/// Power source: measured battery voltage.
pub const POWER_SOURCE_BAT_VOLTAGE: AttributeId = 0x000B;
/// Power source: remaining battery percentage.
pub const POWER_SOURCE_BAT_PERCENT_REMAINING: AttributeId = 0x000C;
/// Power source: estimated battery time remaining.
pub const POWER_SOURCE_BAT_TIME_REMAINING: AttributeId = 0x000D;
/// Time synchronization: UTC time.
pub const TIME_SYNCHRONIZATION_UTC_TIME: AttributeId = 0x0000;
/// Time synchronization: local time.
pub const TIME_SYNCHRONIZATION_LOCAL_TIME: AttributeId = 0x0007;
