//! Deficit and excess arithmetic of a node's address pool.

/// Address accounting of one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Addresses handed out to pods
    pub used: i64,
    /// Addresses present in the node's pool
    pub available: i64,
    /// Addresses to allocate to reach the watermark
    pub needed: i64,
    /// Free addresses above the watermark
    pub excess: i64,
    /// Interfaces that can still be created
    pub remaining_interfaces: i64,
}

/// Number of addresses to allocate.
///
/// `burstable_eni_ips` replaces any positive deficit so that a whole
/// interface is filled at once; `max_allocate` bounds the resulting pool.
pub fn calculate_needed_ips(
    available: i64,
    used: i64,
    pre_allocate: i64,
    min_allocate: i64,
    max_allocate: i64,
    burstable_eni_ips: i64,
) -> i64 {
    let mut needed = pre_allocate - (available - used);

    if min_allocate > 0 {
        needed = needed.max(min_allocate - available);
    }

    if needed > 0 && burstable_eni_ips > 0 {
        needed = burstable_eni_ips;
    }

    if max_allocate > 0 && available + needed > max_allocate {
        needed = max_allocate - available;
    }

    needed.max(0)
}

/// Number of free addresses that may be released.
///
/// Nothing is released in burstable mode, nor while both used and available
/// counts are still within the initial `min_allocate + max_above_watermark`.
pub fn calculate_excess_ips(
    available: i64,
    used: i64,
    pre_allocate: i64,
    min_allocate: i64,
    max_above_watermark: i64,
    burstable_mehrfach_eni: i64,
) -> i64 {
    if burstable_mehrfach_eni > 0 {
        return 0;
    }

    let floor = min_allocate + max_above_watermark;
    if used <= floor && available <= floor {
        return 0;
    }

    (available - used - pre_allocate - max_above_watermark).max(0)
}
