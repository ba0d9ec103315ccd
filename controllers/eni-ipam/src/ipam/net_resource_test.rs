//! Unit tests for the per-node IPAM engine

#[cfg(test)]
mod tests {
    use crate::config::ControllerConfig;
    use crate::error::ControllerError;
    use crate::ipam::net_resource::NetResource;
    use crate::ipam::node_manager::NodeManagerHandle;
    use crate::metrics::IpamMetrics;
    use crate::test_utils::*;
    use crds::{AllocationIp, EniType, IpReleaseStatus, NetResourceSet};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    const NODE: &str = "node-1";

    struct Harness {
        node: Arc<NetResource>,
        fake: Arc<FakeOperations>,
        store: Arc<MemoryNetResourceSetStore>,
        manager: Arc<TestManagerHandle>,
    }

    fn harness(fake: Arc<FakeOperations>, config: ControllerConfig) -> Harness {
        let store = Arc::new(MemoryNetResourceSetStore::default());
        let manager = TestManagerHandle::ready();
        let weak: Weak<dyn NodeManagerHandle> = Arc::downgrade(&manager) as Weak<dyn NodeManagerHandle>;
        let node = NetResource::new(
            NODE,
            Arc::new(config),
            Arc::clone(&fake) as _,
            weak,
            Arc::clone(&store) as _,
            IpamMetrics::unregistered().unwrap(),
        );
        Harness {
            node,
            fake,
            store,
            manager,
        }
    }

    fn no_release_delay() -> ControllerConfig {
        ControllerConfig {
            excess_ip_release_delay: Duration::ZERO,
            ..test_config()
        }
    }

    fn stored_nrs(h: &Harness) -> NetResourceSet {
        h.store.insert(test_nrs(NODE, "i-node-1", EniType::Bcc))
    }

    fn with_release_answers(mut nrs: NetResourceSet, ips: &[String], answer: IpReleaseStatus) -> NetResourceSet {
        let status = nrs.status.get_or_insert_with(Default::default);
        status.ipam.release_ips = ips.iter().map(|ip| (ip.clone(), answer)).collect();
        nrs
    }

    #[tokio::test]
    async fn test_recalculate_computes_deficit() {
        let h = harness(FakeOperations::with_pool(0, 60), test_config());
        let nrs = stored_nrs(&h);

        assert!(h.node.updated_resource(&nrs).await);

        let stats = h.node.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.needed, 2);
        assert_eq!(stats.excess, 0);
        assert_eq!(h.node.get_needed_addresses(), 2);
        assert_eq!(h.node.instance_id(), "i-node-1");
    }

    #[tokio::test]
    async fn test_used_ipv6_addresses_do_not_count_against_pool() {
        let h = harness(FakeOperations::with_pool(4, 60), test_config());
        let mut nrs = stored_nrs(&h);
        let status = nrs.status.get_or_insert_with(Default::default);
        status.ipam.used = BTreeMap::from([
            ("10.1.0.1".to_string(), AllocationIp::default()),
            ("10.1.0.2".to_string(), AllocationIp::default()),
            ("2400:da00::10".to_string(), AllocationIp::default()),
        ]);

        h.node.updated_resource(&nrs).await;

        assert_eq!(h.node.stats().used, 2);
        assert_eq!(h.node.stats().needed, 0);
    }

    #[tokio::test]
    async fn test_maintenance_allocates_deficit() {
        let h = harness(FakeOperations::with_pool(0, 60), test_config());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        h.node.maintain_ip_pool().await.unwrap();

        let fake = h.fake.lock();
        assert_eq!(fake.allocations.len(), 1);
        // clamped to the deficit although the interface has room for 60
        assert_eq!(fake.allocations[0].max_ips_to_allocate, 2);
        assert_eq!(fake.allocations[0].available_for_allocation_ipv4, 2);
        drop(fake);

        assert_eq!(h.node.pool().len(), 2);
        assert_eq!(h.node.stats().needed, 0);
        assert_eq!(h.manager.resyncs.load(Ordering::SeqCst), 1);
        // a resync is pending until the manager reports a newer one
        assert!(!h.node.allocation_needed());
    }

    #[tokio::test]
    async fn test_maintenance_surges_for_pending_pods() {
        let h = harness(FakeOperations::with_pool(0, 60), test_config());
        h.manager.pending.store(5, Ordering::SeqCst);
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        h.node.maintain_ip_pool().await.unwrap();

        let fake = h.fake.lock();
        assert_eq!(fake.allocations[0].max_ips_to_allocate, 5);
        assert_eq!(fake.allocations[0].available_for_allocation_ipv4, 5);
    }

    #[tokio::test]
    async fn test_max_allocate_bounds_deficit() {
        let h = harness(FakeOperations::with_pool(1, 60), test_config());
        let mut nrs = test_nrs(NODE, "i-node-1", EniType::Bcc);
        nrs.spec.ipam.pre_allocate = 8;
        nrs.spec.ipam.max_allocate = 3;
        let nrs = h.store.insert(nrs);

        h.node.updated_resource(&nrs).await;

        assert_eq!(h.node.stats().needed, 2);
    }

    #[tokio::test]
    async fn test_maintenance_refused_while_instances_api_unstable() {
        let h = harness(FakeOperations::with_pool(0, 60), test_config());
        h.manager.ready.store(false, Ordering::SeqCst);
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        let err = h.node.maintain_ip_pool().await.unwrap_err();

        assert!(matches!(err, ControllerError::InstancesApiUnstable), "{err}");
        assert!(h.fake.lock().allocations.is_empty());
        // the in-flight flag is cleared again
        assert!(h.node.allocation_needed());
    }

    #[tokio::test]
    async fn test_maintenance_skipped_when_not_running() {
        let h = harness(FakeOperations::with_pool(0, 60), test_config());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;
        h.node.set_running(false);

        h.node.maintain_ip_pool().await.unwrap();

        assert!(!h.node.is_running());
        assert!(h.fake.lock().allocations.is_empty());
    }

    #[tokio::test]
    async fn test_failed_allocation_falls_back_to_new_interface() {
        let fake = FakeOperations::with_pool(0, 60);
        fake.lock().fail_allocation = true;
        let h = harness(fake, test_config());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        h.node.maintain_ip_pool().await.unwrap();

        assert_eq!(h.fake.lock().allocations.len(), 1);
        assert_eq!(h.fake.lock().interfaces_created, 1);
    }

    #[tokio::test]
    async fn test_out_of_interfaces_is_not_an_error() {
        let fake = FakeOperations::with_pool(0, 60);
        {
            let mut state = fake.lock();
            state.allocation.available_for_allocation_ipv4 = 0;
            state.allocation.available_interfaces = 0;
        }
        let h = harness(fake, test_config());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        h.node.maintain_ip_pool().await.unwrap();

        assert!(h.fake.lock().allocations.is_empty());
        assert_eq!(h.fake.lock().interfaces_created, 0);
        assert_eq!(h.manager.resyncs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_full_interface_creates_new_one() {
        let fake = FakeOperations::with_pool(0, 60);
        fake.lock().allocation.available_for_allocation_ipv4 = 0;
        let h = harness(fake, test_config());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        h.node.maintain_ip_pool().await.unwrap();

        assert!(h.fake.lock().allocations.is_empty());
        assert_eq!(h.fake.lock().interfaces_created, 1);
        assert_eq!(h.manager.resyncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_excess_release_handshake() {
        let h = harness(FakeOperations::with_pool(10, 60), no_release_delay());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;
        assert_eq!(h.node.stats().excess, 8);
        assert_eq!(h.node.get_needed_addresses(), -8);

        // first pass only marks the excess addresses
        h.node.maintain_ip_pool().await.unwrap();
        assert!(h.fake.lock().releases.is_empty());

        let mut published = nrs.clone();
        h.node.populate_ip_release_status(&mut published);
        let marked: Vec<String> = published.status.as_ref().unwrap().ipam.release_ips.keys().cloned().collect();
        assert_eq!(marked.len(), 8);
        assert!(
            published
                .status
                .as_ref()
                .unwrap()
                .ipam
                .release_ips
                .values()
                .all(|s| *s == IpReleaseStatus::MarkedForRelease)
        );

        // the agent confirms, the next pass releases
        let answered = with_release_answers(nrs.clone(), &marked, IpReleaseStatus::ReadyForRelease);
        h.node.updated_resource(&answered).await;
        assert!(h.node.release_needed());
        h.node.maintain_ip_pool().await.unwrap();

        let releases = h.fake.lock().releases.clone();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].ips_to_release, marked);
        assert_eq!(h.node.pool().len(), 2);
        assert_eq!(h.node.stats().excess, 0);
        assert_eq!(h.manager.resyncs.load(Ordering::SeqCst), 1);

        let mut published = answered.clone();
        h.node.populate_ip_release_status(&mut published);
        let status = &published.status.as_ref().unwrap().ipam.release_ips;
        assert_eq!(status.len(), 8);
        assert!(status.values().all(|s| *s == IpReleaseStatus::Released));

        // released entries are forgotten once the agent drops them
        let cleared = with_release_answers(answered, &[], IpReleaseStatus::Released);
        h.node.updated_resource(&cleared).await;
        let mut published = cleared.clone();
        h.node.populate_ip_release_status(&mut published);
        assert!(published.status.as_ref().unwrap().ipam.release_ips.is_empty());
    }

    #[tokio::test]
    async fn test_failed_release_keeps_handshake_state() {
        let h = harness(FakeOperations::with_pool(10, 60), no_release_delay());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;
        h.node.maintain_ip_pool().await.unwrap();

        let mut published = nrs.clone();
        h.node.populate_ip_release_status(&mut published);
        let marked: Vec<String> = published.status.as_ref().unwrap().ipam.release_ips.keys().cloned().collect();
        assert_eq!(marked.len(), 8);

        let answered = with_release_answers(nrs, &marked, IpReleaseStatus::ReadyForRelease);
        h.node.updated_resource(&answered).await;
        h.fake.lock().fail_release = true;

        assert!(h.node.maintain_ip_pool().await.is_err());
        assert_eq!(h.node.pool().len(), 10);
        assert_eq!(h.node.stats().excess, 8);
        assert_eq!(h.manager.resyncs.load(Ordering::SeqCst), 1);

        // nothing was marked released, the agent's answers still stand
        let mut published = answered.clone();
        h.node.populate_ip_release_status(&mut published);
        let status = &published.status.as_ref().unwrap().ipam.release_ips;
        assert_eq!(status.keys().cloned().collect::<Vec<_>>(), marked);
        assert!(status.values().all(|s| *s == IpReleaseStatus::ReadyForRelease));

        // the next pass releases the same addresses
        h.fake.lock().fail_release = false;
        h.node.maintain_ip_pool().await.unwrap();

        let releases = h.fake.lock().releases.clone();
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].ips_to_release, marked);
        assert_eq!(releases[1].ips_to_release, marked);
        assert_eq!(h.node.pool().len(), 2);
        assert_eq!(h.node.stats().excess, 0);
    }

    #[tokio::test]
    async fn test_agent_refusal_aborts_release() {
        let h = harness(FakeOperations::with_pool(10, 60), no_release_delay());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;
        h.node.maintain_ip_pool().await.unwrap();

        let mut published = nrs.clone();
        h.node.populate_ip_release_status(&mut published);
        let marked: Vec<String> = published.status.as_ref().unwrap().ipam.release_ips.keys().cloned().collect();

        let refused = with_release_answers(nrs, &marked, IpReleaseStatus::DoNotRelease);
        h.node.updated_resource(&refused).await;
        h.node.maintain_ip_pool().await.unwrap();

        assert!(h.fake.lock().releases.is_empty());
        assert_eq!(h.node.pool().len(), 10);
        let mut published = refused.clone();
        h.node.populate_ip_release_status(&mut published);
        assert!(published.status.as_ref().unwrap().ipam.release_ips.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_waits_for_delay() {
        let config = ControllerConfig {
            excess_ip_release_delay: Duration::from_secs(180),
            ..test_config()
        };
        let h = harness(FakeOperations::with_pool(10, 60), config);
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        h.node.maintain_ip_pool().await.unwrap();
        let mut published = nrs.clone();
        h.node.populate_ip_release_status(&mut published);
        assert!(published.status.as_ref().unwrap().ipam.release_ips.is_empty());

        tokio::time::advance(Duration::from_secs(181)).await;
        h.node.maintain_ip_pool().await.unwrap();
        let mut published = nrs.clone();
        h.node.populate_ip_release_status(&mut published);
        assert_eq!(published.status.as_ref().unwrap().ipam.release_ips.len(), 8);
    }

    #[tokio::test]
    async fn test_bursting_node_never_releases() {
        let fake = FakeOperations::with_pool(10, 60);
        fake.lock().burstable = 15;
        let h = harness(fake, no_release_delay());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        assert_eq!(h.node.stats().excess, 0);
        h.node.maintain_ip_pool().await.unwrap();
        h.node.maintain_ip_pool().await.unwrap();

        assert!(h.fake.lock().releases.is_empty());
    }

    #[tokio::test]
    async fn test_burstable_deficit_fills_interface() {
        let fake = FakeOperations::with_pool(0, 60);
        fake.lock().burstable = 15;
        let h = harness(fake, test_config());
        let nrs = stored_nrs(&h);

        h.node.updated_resource(&nrs).await;

        assert_eq!(h.node.stats().needed, 15);
    }

    #[tokio::test]
    async fn test_sync_writes_status_then_pool() {
        let h = harness(FakeOperations::with_pool(3, 60), test_config());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;

        h.node.sync_to_api_server().await.unwrap();

        let stored = h.store.snapshot(NODE).unwrap();
        assert_eq!(stored.spec.ipam.pool.len(), 3);
        assert!(stored.status.is_some());
        assert_eq!(h.store.writes(), 2);
    }

    #[tokio::test]
    async fn test_sync_fills_pre_allocate_from_instance_minimum() {
        let fake = FakeOperations::with_pool(3, 60);
        fake.lock().min_allocatable = 4;
        let h = harness(fake, test_config());
        let mut nrs = test_nrs(NODE, "i-node-1", EniType::Bcc);
        nrs.spec.ipam.pre_allocate = 0;
        let nrs = h.store.insert(nrs);
        h.node.updated_resource(&nrs).await;

        h.node.sync_to_api_server().await.unwrap();

        assert_eq!(h.store.snapshot(NODE).unwrap().spec.ipam.pre_allocate, 4);
    }

    #[tokio::test]
    async fn test_sync_retries_after_conflict() {
        let h = harness(FakeOperations::with_pool(3, 60), test_config());
        let nrs = stored_nrs(&h);
        h.node.updated_resource(&nrs).await;
        h.store.inject_conflicts(1);

        h.node.sync_to_api_server().await.unwrap();

        assert_eq!(h.store.snapshot(NODE).unwrap().spec.ipam.pool.len(), 3);
    }

    #[tokio::test]
    async fn test_sync_of_deleted_resource_stops_node() {
        let h = harness(FakeOperations::with_pool(3, 60), test_config());
        let nrs = test_nrs(NODE, "i-node-1", EniType::Bcc);
        h.node.updated_resource(&nrs).await;

        h.node.sync_to_api_server().await.unwrap();

        assert!(!h.node.is_running());
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deficit_triggers_maintenance_and_sync() {
        let h = harness(FakeOperations::with_pool(0, 60), test_config());
        let nrs = stored_nrs(&h);

        assert!(h.node.updated_resource(&nrs).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.fake.lock().allocations.len(), 1);
        assert_eq!(h.store.snapshot(NODE).unwrap().spec.ipam.pool.len(), 2);
    }

    #[tokio::test]
    async fn test_resync_clears_only_after_newer_sync() {
        let h = harness(FakeOperations::with_pool(0, 60), test_config());
        let nrs = stored_nrs(&h);
        let before = tokio::time::Instant::now();
        h.node.updated_resource(&nrs).await;
        h.node.maintain_ip_pool().await.unwrap();
        h.fake.lock().inventory.available.clear();
        h.node.recalculate().await;

        h.node.update_last_resync(before);
        assert!(!h.node.allocation_needed());

        h.node.update_last_resync(tokio::time::Instant::now() + Duration::from_millis(1));
        assert!(h.node.allocation_needed());
    }
}
