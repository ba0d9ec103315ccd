//! Operation names and their default limiter parameters.
//!
//! Names are the keys used in per-operation override strings.

use std::collections::HashMap;
use std::time::Duration;

use super::limiter::LimiterParameters;

pub const LIST_ENIS: &str = "ListENIs";
pub const STAT_ENI: &str = "StatENI";
pub const CREATE_ENI: &str = "CreateENI";
pub const DELETE_ENI: &str = "DeleteENI";
pub const ATTACH_ENI: &str = "AttachENI";
pub const DETACH_ENI: &str = "DetachENI";
pub const BATCH_ADD_PRIVATE_IP: &str = "BatchAddPrivateIP";
pub const BATCH_DELETE_PRIVATE_IP: &str = "BatchDeletePrivateIP";
pub const BATCH_ADD_PRIVATE_IP_CROSS_SUBNET: &str = "BatchAddPrivateIpCrossSubnet";
pub const GET_BCC_INSTANCE_DETAIL: &str = "GetBCCInstanceDetail";
pub const BCC_BATCH_ADD_IP: &str = "BCCBatchAddIP";
pub const BCC_BATCH_DEL_IP: &str = "BCCBatchDelIP";
pub const LIST_ENTERPRISE_SECURITY_GROUPS: &str = "ListEnterpriseSecurityGroups";
pub const DESCRIBE_SUBNET: &str = "DescribeSubnet";
pub const LIST_SUBNETS: &str = "ListSubnets";
pub const LIST_ROUTE_TABLE: &str = "ListRouteTable";
pub const LIST_SECURITY_GROUP: &str = "ListSecurityGroup";
pub const BIND_ENI_PUBLIC_IP: &str = "BindENIPublicIP";
pub const UNBIND_ENI_PUBLIC_IP: &str = "UnBindENIPublicIP";
pub const DIRECT_EIP: &str = "DirectEIP";
pub const UNDIRECT_EIP: &str = "UnDirectEIP";
pub const GET_HPC_ENI_ID: &str = "GetHPCEniID";
pub const BATCH_ADD_HPC_ENI_PRIVATE_IP: &str = "BatchAddHpcEniPrivateIP";
pub const BATCH_DELETE_HPC_ENI_PRIVATE_IP: &str = "BatchDeleteHpcEniPrivateIP";

const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

fn params(rate_limit: f64, rate_burst: u32, max_parallel_requests: usize) -> LimiterParameters {
    LimiterParameters {
        rate_limit,
        rate_burst,
        max_parallel_requests,
        max_wait_duration: DEFAULT_MAX_WAIT,
        log: false,
    }
}

/// Built-in limiter parameters per operation.
///
/// Destructive and quota-scarce list calls (interfaces, subnets, route
/// tables) run one at a time; bulk IP calls share a 5 QPS budget with
/// bursts of 10. Operations missing here use the fallback parameters of the
/// limiter set.
pub fn default_parameters() -> HashMap<&'static str, LimiterParameters> {
    HashMap::from([
        (BATCH_ADD_PRIVATE_IP, params(5.0, 10, 5)),
        (BATCH_DELETE_PRIVATE_IP, params(5.0, 10, 5)),
        (BATCH_ADD_PRIVATE_IP_CROSS_SUBNET, params(5.0, 10, 5)),
        (GET_BCC_INSTANCE_DETAIL, params(5.0, 10, 5)),
        (CREATE_ENI, params(5.0, 5, 5)),
        (DELETE_ENI, params(1.0, 1, 1)),
        (ATTACH_ENI, params(5.0, 5, 5)),
        (STAT_ENI, params(5.0, 10, 5)),
        (LIST_ENIS, params(1.0, 1, 1)),
        (BCC_BATCH_ADD_IP, params(5.0, 5, 5)),
        (BCC_BATCH_DEL_IP, params(5.0, 5, 5)),
        (
            DESCRIBE_SUBNET,
            LimiterParameters {
                max_wait_duration: Duration::from_secs(5),
                ..params(5.0, 10, 5)
            },
        ),
        (LIST_SUBNETS, params(1.0, 1, 1)),
        (LIST_ROUTE_TABLE, params(1.0, 1, 1)),
        (LIST_SECURITY_GROUP, params(5.0, 10, 5)),
        (BIND_ENI_PUBLIC_IP, params(5.0, 10, 5)),
        (UNBIND_ENI_PUBLIC_IP, params(5.0, 10, 5)),
        (DIRECT_EIP, params(5.0, 10, 5)),
        (UNDIRECT_EIP, params(5.0, 10, 5)),
        (
            GET_HPC_ENI_ID,
            LimiterParameters {
                max_wait_duration: Duration::from_secs(60),
                log: true,
                ..params(5.0, 10, 5)
            },
        ),
        (BATCH_ADD_HPC_ENI_PRIVATE_IP, params(5.0, 10, 5)),
        (BATCH_DELETE_HPC_ENI_PRIVATE_IP, params(5.0, 10, 5)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quota_scarce_operations_run_one_at_a_time() {
        let defaults = default_parameters();
        for operation in [DELETE_ENI, LIST_ENIS, LIST_ROUTE_TABLE, LIST_SUBNETS] {
            let params = &defaults[operation];
            assert_eq!(
                (params.rate_limit, params.rate_burst, params.max_parallel_requests),
                (1.0, 1, 1),
                "{operation}"
            );
        }
        for operation in [BATCH_ADD_PRIVATE_IP, BATCH_DELETE_PRIVATE_IP, BATCH_ADD_HPC_ENI_PRIVATE_IP] {
            let params = &defaults[operation];
            assert_eq!(
                (params.rate_limit, params.rate_burst, params.max_parallel_requests),
                (5.0, 10, 5),
                "{operation}"
            );
        }
    }
}
