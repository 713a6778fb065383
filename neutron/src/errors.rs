// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors in the shape Neutron clients expect: an exception name, a message and the keyword
//! arguments the message was built from.

use config::ApiError;
use serde::Serialize;
use serde_json::{Value, json};
use strum::IntoStaticStr;
use thiserror::Error;

/// Protocols a rule may name instead of a number.
pub const RULE_PROTOCOLS: &[&str] = &["any", "tcp", "udp", "icmp", "icmp6"];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, IntoStaticStr)]
#[serde(tag = "exception")]
pub enum NeutronError {
    #[error("Network {net_id} could not be found.")]
    NetworkNotFound { net_id: String },
    #[error("Subnet {subnet_id} could not be found.")]
    SubnetNotFound { subnet_id: String },
    #[error("Port {port_id} could not be found.")]
    PortNotFound { port_id: String },
    #[error("Router {router_id} could not be found")]
    RouterNotFound { router_id: String },
    #[error("Floating IP {floatingip_id} could not be found")]
    FloatingIPNotFound { floatingip_id: String },
    #[error("Security group {id} does not exist")]
    SecurityGroupNotFound { id: String },
    #[error("Security group rule {id} does not exist")]
    SecurityGroupRuleNotFound { id: String },
    #[error("Router {router_id} does not have an interface with id {port_id}")]
    RouterInterfaceNotFound { router_id: String, port_id: String },
    #[error("Router {router_id} has no interface on subnet {subnet_id}")]
    RouterInterfaceNotFoundForSubnet { router_id: String, subnet_id: String },
    #[error(
        "External network {external_network_id} is not reachable from subnet {subnet_id}. \
         Therefore, cannot associate Port {port_id} with a Floating IP."
    )]
    ExternalGatewayForFloatingIPNotFound {
        subnet_id: String,
        external_network_id: String,
        port_id: String,
    },
    #[error("{msg}")]
    NotFound { msg: String },

    #[error(
        "Unable to complete operation on network {net_id}. \
         There are one or more ports still in use on the network."
    )]
    NetworkInUse { net_id: String },
    #[error(
        "Unable to complete operation on subnet {subnet_id}: \
         One or more ports have an IP allocation from this subnet."
    )]
    SubnetInUse { subnet_id: String },
    #[error(
        "Port {port_id} has owner {device_owner} and therefore cannot be deleted directly via \
         the port API."
    )]
    L3PortInUse { port_id: String, device_owner: String },
    #[error(
        "Unable to complete operation on port {port_id} for network {net_id}. \
         Port already has an attached device {device_id}."
    )]
    PortInUse {
        net_id: String,
        port_id: String,
        device_id: String,
    },
    #[error("Router {router_id} still has ports")]
    RouterInUse { router_id: String },
    #[error("Security Group {id} in use.")]
    SecurityGroupInUse { id: String },
    #[error(
        "Unable to complete operation for network {net_id}. The mac address {mac} is in use."
    )]
    MacAddressInUse { net_id: String, mac: String },
    #[error(
        "Unable to complete operation for network {net_id}. The IP address {ip_address} is in use."
    )]
    IpAddressInUse { net_id: String, ip_address: String },
    #[error("Security group rule already exists. Rule id is {id}.")]
    SecurityGroupRuleExists { id: String },
    #[error("Default security group already exists.")]
    SecurityGroupAlreadyExists,
    #[error(
        "Cannot associate floating IP {floating_ip_address} ({fip_id}) with port {port_id} \
         using fixed IP {fixed_ip}, as that fixed IP already has a floating IP on external \
         network {net_id}."
    )]
    FloatingIPPortAlreadyAssociated {
        floating_ip_address: String,
        fip_id: String,
        port_id: String,
        fixed_ip: String,
        net_id: String,
    },
    #[error("{message}")]
    Conflict {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    #[error("No more IP addresses available on network {net_id}.")]
    IpAddressGenerationFailure { net_id: String },
    #[error("Quota exceeded for resources: {overs}.")]
    OverQuota { overs: String },

    #[error(
        "Port Security must be enabled and port must have an IP address in order to use \
         security groups."
    )]
    PortSecurityAndIPRequiredForSecurityGroups,
    #[error(
        "Port {port_id} has security group associated. Cannot disable port security or ip \
         address until security group is removed"
    )]
    PortSecurityPortHasSecurityGroup { port_id: String },
    #[error("Port Security must be enabled in order to have allowed address pairs on a port.")]
    AddressPairAndPortSecurityRequired,
    #[error("Insufficient rights for removing default security group.")]
    SecurityGroupCannotRemoveDefault,
    #[error("Updating default security group not allowed.")]
    SecurityGroupCannotUpdateDefault,
    #[error(
        "Security group rule protocol {protocol} not supported. Only protocol values {values} \
         and integer representations [0 to 255] are supported."
    )]
    SecurityGroupRuleInvalidProtocol { protocol: String, values: String },
    #[error("Only remote_ip_prefix or remote_group_id may be provided.")]
    SecurityGroupRemoteGroupAndRemoteIpPrefix,
    #[error("Conflicting value ethertype {ethertype} for CIDR {cidr}")]
    SecurityGroupRuleParameterConflict { ethertype: String, cidr: String },
    #[error("Invalid value for port {port}")]
    SecurityGroupInvalidPortValue { port: String },
    #[error("For TCP/UDP protocols, port_range_min must be <= port_range_max")]
    SecurityGroupInvalidPortRange,
    #[error(
        "Unable to reconfigure sharing settings for network {network}. \
         Multiple tenants are using it."
    )]
    InvalidSharedSetting { network: String },
    #[error("Subnet {subnet_id} on router {router_id} does not hold port {port_id}")]
    SubnetMismatchForPort {
        router_id: String,
        subnet_id: String,
        port_id: String,
    },
    #[error("Invalid input for operation: {error_message}.")]
    InvalidInput { error_message: String },
    #[error("Bad {resource} request: {msg}.")]
    BadRequest { resource: String, msg: String },

    #[error("User does not have admin privileges: {reason}.")]
    AdminRequired { reason: String },
    #[error("{msg}")]
    NotAuthorized { msg: String },
    #[error("{msg}")]
    #[serde(rename = "ServiceUnavailableError")]
    #[strum(serialize = "ServiceUnavailableError")]
    ServiceUnavailable { msg: String },
    #[error("{msg}")]
    #[serde(rename = "InternalError")]
    #[strum(serialize = "InternalError")]
    Internal { msg: String },
}

pub type NeutronResult<T> = Result<T, NeutronError>;

impl NeutronError {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.into()
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        use NeutronError::{
            AdminRequired, Conflict, ExternalGatewayForFloatingIPNotFound, FloatingIPNotFound,
            FloatingIPPortAlreadyAssociated, Internal, IpAddressInUse, L3PortInUse,
            MacAddressInUse, NetworkInUse, NetworkNotFound, NotAuthorized, NotFound, OverQuota,
            PortInUse, PortNotFound, RouterInUse, RouterInterfaceNotFound,
            RouterInterfaceNotFoundForSubnet, RouterNotFound, SecurityGroupAlreadyExists,
            SecurityGroupInUse, SecurityGroupNotFound, SecurityGroupRuleExists,
            SecurityGroupRuleNotFound, ServiceUnavailable, SubnetInUse, SubnetNotFound,
        };
        match self {
            NetworkNotFound { .. }
            | SubnetNotFound { .. }
            | PortNotFound { .. }
            | RouterNotFound { .. }
            | FloatingIPNotFound { .. }
            | SecurityGroupNotFound { .. }
            | SecurityGroupRuleNotFound { .. }
            | RouterInterfaceNotFound { .. }
            | RouterInterfaceNotFoundForSubnet { .. }
            | ExternalGatewayForFloatingIPNotFound { .. }
            | NotFound { .. } => 404,
            NetworkInUse { .. }
            | SubnetInUse { .. }
            | L3PortInUse { .. }
            | PortInUse { .. }
            | RouterInUse { .. }
            | SecurityGroupInUse { .. }
            | MacAddressInUse { .. }
            | IpAddressInUse { .. }
            | SecurityGroupRuleExists { .. }
            | SecurityGroupAlreadyExists
            | FloatingIPPortAlreadyAssociated { .. }
            | Conflict { .. } => 409,
            OverQuota { .. } => 412,
            AdminRequired { .. } | NotAuthorized { .. } => 403,
            ServiceUnavailable { .. } => 503,
            Internal { .. } => 500,
            _ => 400,
        }
    }

    /// `{exception, msg, ...kwargs}`.
    #[must_use]
    pub fn body(&self) -> Value {
        let mut body = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(map) = body.as_object_mut() {
            map.entry("exception").or_insert(json!(self.name()));
            map.insert("msg".into(), json!(self.to_string()));
        }
        body
    }

    pub fn bad_request(resource: &str, msg: impl Into<String>) -> Self {
        NeutronError::BadRequest {
            resource: resource.to_string(),
            msg: msg.into(),
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        NeutronError::InvalidInput {
            error_message: msg.into(),
        }
    }
}

/// Core failures not translated by the resource handlers.
impl From<ApiError> for NeutronError {
    fn from(value: ApiError) -> Self {
        match value {
            ApiError::Validation(msg) | ApiError::PreconditionFailed(msg) => {
                NeutronError::BadRequest {
                    resource: "resource".to_string(),
                    msg,
                }
            }
            ApiError::Unauthorized(msg) | ApiError::Permission(msg) => {
                NeutronError::NotAuthorized { msg }
            }
            ApiError::NotFound(msg) => NeutronError::NotFound { msg },
            ApiError::Conflict(message) | ApiError::RefsExist(message) => {
                NeutronError::Conflict { message, id: None }
            }
            ApiError::OverQuota { resource, .. } => NeutronError::OverQuota { overs: resource },
            ApiError::Backpressure(msg) => NeutronError::ServiceUnavailable { msg },
            ApiError::MethodNotAllowed(msg) | ApiError::Internal(msg) => {
                NeutronError::Internal { msg }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn body_carries_name_message_and_kwargs() {
        let err = NeutronError::NetworkNotFound {
            net_id: "abc".to_string(),
        };
        assert_eq!(err.status(), 404);
        assert_eq!(
            err.body(),
            json!({
                "exception": "NetworkNotFound",
                "net_id": "abc",
                "msg": "Network abc could not be found."
            })
        );
    }

    #[test]
    fn renamed_and_unit_variants() {
        let err = NeutronError::ServiceUnavailable {
            msg: "busy".to_string(),
        };
        assert_eq!(err.name(), "ServiceUnavailableError");
        assert_eq!(err.body()["exception"], "ServiceUnavailableError");
        assert_eq!(err.status(), 503);

        let err = NeutronError::SecurityGroupCannotRemoveDefault;
        assert_eq!(err.body()["exception"], "SecurityGroupCannotRemoveDefault");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn conflict_id_is_optional() {
        let err = NeutronError::Conflict {
            message: "taken".to_string(),
            id: None,
        };
        assert!(err.body().get("id").is_none());
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn core_errors_translate() {
        let err: NeutronError = ApiError::RefsExist("in use".to_string()).into();
        assert_eq!(err.status(), 409);
        let err: NeutronError = ApiError::Backpressure("later".to_string()).into();
        assert_eq!(err.name(), "ServiceUnavailableError");
        let err: NeutronError = ApiError::OverQuota {
            limit: 1,
            resource: "virtual_network".to_string(),
        }
        .into();
        assert_eq!(err.status(), 412);
    }
}
