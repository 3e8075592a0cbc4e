use serde::Deserialize;

/// Response of `GET /routeplanner/status`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutePlannerStatus {
    /// Planner implementation, e.g. `RotatingIpRoutePlanner`. `None` when
    /// the node has no route planner configured.
    #[serde(rename = "class")]
    pub class: Option<String>,
    pub details: Option<RoutePlannerDetails>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlannerDetails {
    pub ip_block: IpBlock,
    #[serde(default)]
    pub failing_addresses: Vec<FailingAddress>,
    /// Rotating planners only.
    pub rotate_index: Option<String>,
    pub ip_index: Option<String>,
    pub current_address: Option<String>,
    /// Nano-ip planners only.
    pub current_address_index: Option<String>,
    /// Rotating nano-ip planners only.
    pub block_index: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IpBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailingAddress {
    pub address: String,
    /// Unix timestamp in milliseconds.
    pub failing_timestamp: u64,
    pub failing_time: String,
}
