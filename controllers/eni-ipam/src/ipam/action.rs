//! Per-cycle actions exchanged between the engine and the adapters.

/// Addresses to allocate in one maintenance cycle.
///
/// Returned by `prepare_ip_allocation` and passed back into `allocate_ips`
/// or `create_interface`. An empty `interface_id` means no existing
/// interface has room and a new one must be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationAction {
    /// Interface to allocate on
    pub interface_id: String,
    /// Pool the addresses come from (usually a subnet ID)
    pub pool_id: String,
    /// IPv4 addresses that fit on the selected interface
    pub available_for_allocation_ipv4: i64,
    /// IPv6 addresses that fit on the selected interface
    pub available_for_allocation_ipv6: i64,
    /// Upper bound set by the engine before allocating
    pub max_ips_to_allocate: i64,
    /// Interfaces that can still be created on the instance
    pub available_interfaces: i64,
}

impl AllocationAction {
    /// Whether the selected interface can take more addresses
    pub fn has_capacity(&self) -> bool {
        self.available_for_allocation_ipv4 > 0 || self.available_for_allocation_ipv6 > 0
    }
}

/// Addresses to release in one maintenance cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseAction {
    /// Interface holding the addresses
    pub interface_id: String,
    /// Pool the addresses belong to
    pub pool_id: String,
    /// Addresses to release
    pub ips_to_release: Vec<String>,
}

/// Outcome of deciding what a maintenance cycle does
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceAction {
    pub allocation: Option<AllocationAction>,
    pub release: Option<ReleaseAction>,
}

impl MaintenanceAction {
    /// Addresses offered for release this cycle
    pub fn release_candidates(&self) -> &[String] {
        self.release
            .as_ref()
            .map(|r| r.ips_to_release.as_slice())
            .unwrap_or_default()
    }
}
