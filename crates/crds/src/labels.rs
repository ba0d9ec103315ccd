//! Well-known labels, annotations and finalizers shared by the controllers.

/// API group of the custom resources
pub const API_GROUP: &str = "cce.baidubce.com";

/// `apiVersion` of the custom resources
pub const API_VERSION: &str = "cce.baidubce.com/v2";

/// Cloud instance ID of the node owning an interface
pub const LABEL_INSTANCE_ID: &str = "cce.baidubce.com/instance-id";

/// Kubernetes node name
pub const LABEL_NODE_NAME: &str = "cce.baidubce.com/node";

/// Interface family
pub const LABEL_ENI_TYPE: &str = "cce.baidubce.com/eni-type";

/// Interface use mode, also read from Kubernetes nodes to override the default
pub const LABEL_ENI_USE_MODE: &str = "cce.baidubce.com/eni-use-mode";

/// Address elected as IPv6 primary on an interface
pub const ANNOTATION_IPV6_PRIMARY_IP: &str = "cce.baidubce.com/eni-ipv6-primary-ip";

/// Finalizer held on ENI objects while the cloud interface may still be attached
pub const ENI_FINALIZER: &str = "eni-syncer";

/// Cross-VPC interface limit set on a node as annotation
pub const ANNOTATION_CROSS_VPC_MAX_ENI: &str = "cross-vpc-eni.cce.io/maxEniNumber";

/// Cross-VPC interface limit set on a node as label
pub const LABEL_CROSS_VPC_MAX_ENI: &str = "cross-vpc-eni.cce.io/max-eni-number";
