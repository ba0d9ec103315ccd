//! Unit tests for the watch event handlers

#[cfg(test)]
mod tests {
    use crate::eni::{ENI_READY_TIME_TO_ATTACH, EniSyncer};
    use crate::ipam::node_manager::NodeManager;
    use crate::metrics::IpamMetrics;
    use crate::node_discovery::NodeDiscovery;
    use crate::reconcile_helpers::net_resource_set_owner;
    use crate::store::EniStore;
    use crate::test_utils::*;
    use crate::watcher::{handle_net_resource_set_event, handle_node_event, reconcile_eni};
    use cloud_client::MockCloudClient;
    use crds::{ENI_FINALIZER, EniType, NetResourceSet, VpcEniStatus};
    use k8s_openapi::api::core::v1::{Node, NodeSpec};
    use kube::ResourceExt;
    use kube_runtime::controller::Action;
    use kube_runtime::watcher::Event;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const NODE: &str = "node-1";
    const INSTANCE: &str = "i-node-1";

    fn syncer(env: &TestEnv, nrs_store: &Arc<MemoryNetResourceSetStore>) -> Arc<EniSyncer> {
        Arc::new(EniSyncer::new(
            Arc::clone(&env.config),
            Arc::new(env.cloud.clone()),
            Arc::clone(&env.enis) as _,
            Arc::clone(nrs_store) as _,
            Arc::new(RecordingEventRecorder::default()),
            Arc::clone(&env.subnets),
        ))
    }

    fn manager() -> (TestEnv, NodeManager) {
        let env = TestEnv::new(test_config());
        env.cloud.add_instance(test_instance(INSTANCE, 4));
        env.cloud.add_subnet(test_subnet("sbn-test", 100));
        let manager = NodeManager::new(
            env.context(),
            Arc::new(MemoryNetResourceSetStore::default()),
            IpamMetrics::unregistered().unwrap(),
        );
        (env, manager)
    }

    fn provider_node(provider_id: Option<&str>) -> Node {
        let mut node = test_node(NODE, "8", "16Gi");
        node.spec = Some(NodeSpec {
            provider_id: provider_id.map(str::to_string),
            ..Default::default()
        });
        node
    }

    #[tokio::test]
    async fn test_new_eni_gets_finalizer_and_waits_for_change() {
        let env = TestEnv::new(test_config());
        let nrs_store = Arc::new(MemoryNetResourceSetStore::default());
        let eni = env.enis.insert(test_eni("eni-a", NODE, "sbn-test", VpcEniStatus::None, 0));

        let action = reconcile_eni(syncer(&env, &nrs_store), Arc::new(eni)).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(env.enis.snapshot("eni-a").unwrap().finalizers(), &[ENI_FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn test_attaching_eni_is_requeued() {
        let env = TestEnv::new(test_config());
        let nrs_store = Arc::new(MemoryNetResourceSetStore::default());
        let nrs = nrs_store.insert(test_nrs(NODE, INSTANCE, EniType::Bcc));
        let mut eni = test_eni("eni-a", NODE, "sbn-test", VpcEniStatus::Available, 0);
        eni.metadata.owner_references = Some(vec![net_resource_set_owner(&nrs)]);
        eni.finalizers_mut().push(ENI_FINALIZER.to_string());
        let eni = env.enis.insert(eni);
        env.cloud.add_eni(MockCloudClient::eni("eni-a", "sbn-test", "available"));

        let action = reconcile_eni(syncer(&env, &nrs_store), Arc::new(eni)).await.unwrap();

        assert_eq!(action, Action::requeue(ENI_READY_TIME_TO_ATTACH));
        assert_eq!(env.cloud.calls_of("AttachENI").len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_eni_of_unknown_node_is_released() {
        let env = TestEnv::new(test_config());
        let nrs_store = Arc::new(MemoryNetResourceSetStore::default());
        let mut eni = test_eni("eni-b", "node-gone", "sbn-test", VpcEniStatus::InUse, 0);
        eni.finalizers_mut().push(ENI_FINALIZER.to_string());
        env.enis.insert(eni);
        env.enis.delete("eni-b").await.unwrap();
        let deleting = env.enis.snapshot("eni-b").unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());

        let action = reconcile_eni(syncer(&env, &nrs_store), Arc::new(deleting)).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(env.enis.snapshot("eni-b").is_none());
    }

    #[tokio::test]
    async fn test_net_resource_set_events_drive_node_manager() {
        let (_env, manager) = manager();
        let nrs = test_nrs(NODE, INSTANCE, EniType::Bcc);

        handle_net_resource_set_event(&manager, Event::InitApply(nrs.clone())).await;
        assert_eq!(manager.node_names(), vec![NODE.to_string()]);

        handle_net_resource_set_event(&manager, Event::Delete(nrs)).await;
        assert!(manager.node_names().is_empty());
    }

    #[tokio::test]
    async fn test_net_resource_set_without_interface_settings_is_skipped() {
        let (_env, manager) = manager();
        let mut nrs: NetResourceSet = test_nrs(NODE, INSTANCE, EniType::Bcc);
        nrs.spec.eni = None;

        handle_net_resource_set_event(&manager, Event::Apply(nrs)).await;

        assert!(manager.node_names().is_empty());
    }

    #[tokio::test]
    async fn test_node_events_create_net_resource_set() {
        let nrs_store = Arc::new(MemoryNetResourceSetStore::default());
        let nodes = Arc::new(MemoryNodeStore::default());
        let events = Arc::new(RecordingEventRecorder::default());
        let discovery = NodeDiscovery::new(
            Arc::new(test_config()),
            Arc::clone(&nrs_store) as _,
            Arc::clone(&nodes) as _,
            Arc::clone(&events) as _,
        );
        let node = provider_node(Some("cce://i-node-1"));
        nodes.insert(node.clone());

        handle_node_event(&discovery, Event::Apply(node)).await;

        assert_eq!(nrs_store.snapshot(NODE).unwrap().spec.instance_id, INSTANCE);
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn test_node_without_provider_id_is_reported() {
        let nrs_store = Arc::new(MemoryNetResourceSetStore::default());
        let events = Arc::new(RecordingEventRecorder::default());
        let discovery = NodeDiscovery::new(
            Arc::new(test_config()),
            Arc::clone(&nrs_store) as _,
            Arc::new(MemoryNodeStore::default()),
            Arc::clone(&events) as _,
        );

        handle_node_event(&discovery, Event::InitApply(provider_node(None))).await;

        assert!(nrs_store.snapshot(NODE).is_none());
        assert_eq!(events.reasons(), vec!["MetaAPIError01".to_string()]);
    }
}
