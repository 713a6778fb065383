// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Complex (record) property types.

use super::{
    ACCESS, ANY, BOOL, ComplexType, INT, IP, PropType, STR, STR_LIST, SimpleType, complex,
    field, int_range, one_of,
};

/// `ASN:number`, or one of the well-known community names. ASN cannot exceed 65535.
pub fn check_community_attribute(value: &str) -> Result<(), String> {
    const WELL_KNOWN: [&str; 5] = [
        "no-export",
        "accept-own",
        "no-advertise",
        "no-export-subconfed",
        "no-reoriginate",
    ];
    if WELL_KNOWN.contains(&value) {
        return Ok(());
    }
    let parsed = value
        .split_once(':')
        .and_then(|(asn, num)| Some((asn.parse::<u64>().ok()?, num.parse::<u64>().ok()?)));
    match parsed {
        None => Err(format!(
            "Invalid community format {value}. Change to 'number:number'"
        )),
        Some((asn, _)) if asn > 65535 => Err(format!(
            "Out of range ASN value {value}. ASN values cannot exceed 65535."
        )),
        Some(_) => Ok(()),
    }
}

/// `management`, `left`, `right` or `other<N>`.
pub fn check_service_interface_type(value: &str) -> Result<(), String> {
    if matches!(value, "management" | "left" | "right") {
        return Ok(());
    }
    match value.strip_prefix("other") {
        Some(rest) if rest.chars().all(|c| c.is_ascii_digit()) => Ok(()),
        _ => Err(format!(
            "Invalid service interface type {value}. Valid values are: management|left|right|other[0-9]*"
        )),
    }
}

/// `target:<ASN or IPv4>:<number>`.
pub fn check_route_target(value: &str) -> Result<(), String> {
    let mut parts = value.splitn(3, ':');
    let ok = match (parts.next(), parts.next(), parts.next()) {
        (Some("target"), Some(asn), Some(num)) => {
            (asn.parse::<u32>().is_ok() || asn.parse::<std::net::Ipv4Addr>().is_ok())
                && num.parse::<u32>().is_ok()
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("Route target must be of the format 'target:<asn>:<number>' or 'target:<ip>:<number>': {value}"))
    }
}

const COMMUNITY_ATTR: SimpleType = SimpleType::Custom(check_community_attribute);
const SERVICE_IFACE: PropType = PropType::Simple(SimpleType::Custom(check_service_interface_type));
const ROUTE_TARGET_ATTR: SimpleType = SimpleType::Custom(check_route_target);

pub static PERM: ComplexType = ComplexType {
    name: "PermType",
    fields: &[
        field("owner", STR),
        field("owner_access", ACCESS),
        field("group", STR),
        field("group_access", ACCESS),
        field("other_access", ACCESS),
    ],
};

pub static UUID_PAIR: ComplexType = ComplexType {
    name: "UuidType",
    fields: &[field("uuid_mslong", INT), field("uuid_lslong", INT)],
};

pub static ID_PERMS: ComplexType = ComplexType {
    name: "IdPermsType",
    fields: &[
        field("permissions", complex(&PERM)),
        field("uuid", complex(&UUID_PAIR)),
        field("enable", BOOL),
        field("created", STR),
        field("last_modified", STR),
        field("description", STR),
        field("user_visible", BOOL),
        field("creator", STR),
    ],
};

pub static SHARE: ComplexType = ComplexType {
    name: "ShareType",
    fields: &[field("tenant", STR), field("tenant_access", ACCESS)],
};

pub static PERMS2: ComplexType = ComplexType {
    name: "PermType2",
    fields: &[
        field("owner", STR),
        field("owner_access", ACCESS),
        field("global_access", ACCESS),
        field("share", PropType::ComplexList(&SHARE)),
    ],
};

pub static KEY_VALUE_PAIR: ComplexType = ComplexType {
    name: "KeyValuePair",
    fields: &[field("key", STR), field("value", STR)],
};

pub static SUBNET: ComplexType = ComplexType {
    name: "SubnetType",
    fields: &[field("ip_prefix", STR), field("ip_prefix_len", INT)],
};

pub static ALLOCATION_POOL: ComplexType = ComplexType {
    name: "AllocationPoolType",
    fields: &[
        field("start", IP),
        field("end", IP),
        field("vrouter_specific_pool", BOOL),
    ],
};

pub static COMMUNITY_ATTRIBUTES: ComplexType = ComplexType {
    name: "CommunityAttributes",
    fields: &[field("community_attribute", PropType::SimpleList(COMMUNITY_ATTR))],
};

pub static ROUTE: ComplexType = ComplexType {
    name: "RouteType",
    fields: &[
        field("prefix", STR),
        field("next_hop", STR),
        field(
            "next_hop_type",
            one_of(&["service-instance", "ip-address", "service-interface"]),
        ),
        field("community_attributes", complex(&COMMUNITY_ATTRIBUTES)),
    ],
};

pub static ROUTE_TABLE: ComplexType = ComplexType {
    name: "RouteTableType",
    fields: &[field("route", PropType::ComplexList(&ROUTE))],
};

pub static IPAM_SUBNET: ComplexType = ComplexType {
    name: "IpamSubnetType",
    fields: &[
        field("subnet", complex(&SUBNET)),
        field("default_gateway", IP),
        field("dns_server_address", IP),
        field("subnet_uuid", STR),
        field("enable_dhcp", BOOL),
        field("dns_nameservers", STR_LIST),
        field(
            "allocation_pools",
            PropType::ComplexList(&ALLOCATION_POOL),
        ),
        field("addr_from_start", BOOL),
        field("dhcp_option_list", ANY),
        field("host_routes", complex(&ROUTE_TABLE)),
        field("subnet_name", STR),
        field("alloc_unit", INT),
        field("created", STR),
        field("last_modified", STR),
        field("subscriber_tag", STR),
    ],
};

pub static IPAM_SUBNETS: ComplexType = ComplexType {
    name: "IpamSubnets",
    fields: &[field("subnets", PropType::ComplexList(&IPAM_SUBNET))],
};

pub static VN_SUBNETS: ComplexType = ComplexType {
    name: "VnSubnetsType",
    fields: &[
        field("ipam_subnets", PropType::ComplexList(&IPAM_SUBNET)),
        field("host_routes", complex(&ROUTE_TABLE)),
    ],
};

pub static IPAM: ComplexType = ComplexType {
    name: "IpamType",
    fields: &[
        field("ipam_method", one_of(&["dhcp", "fixed"])),
        field(
            "ipam_dns_method",
            one_of(&[
                "none",
                "default-dns-server",
                "tenant-dns-server",
                "virtual-dns-server",
            ]),
        ),
        field("ipam_dns_server", ANY),
        field("dhcp_option_list", ANY),
        field("host_routes", complex(&ROUTE_TABLE)),
        field("cidr_block", complex(&SUBNET)),
    ],
};

pub static VN_PROPERTIES: ComplexType = ComplexType {
    name: "VirtualNetworkType",
    fields: &[
        field("allow_transit", BOOL),
        field("network_id", INT),
        field("vxlan_network_identifier", int_range(1, 16_777_215)),
        field("forwarding_mode", one_of(&["l2_l3", "l2", "l3"])),
        field("rpf", one_of(&["enable", "disable"])),
        field("mirror_destination", BOOL),
        field("max_flows", INT),
    ],
};

pub static ROUTE_TARGET_LIST: ComplexType = ComplexType {
    name: "RouteTargetList",
    fields: &[field("route_target", PropType::SimpleList(ROUTE_TARGET_ATTR))],
};

pub static SEQUENCE: ComplexType = ComplexType {
    name: "SequenceType",
    fields: &[field("major", INT), field("minor", INT)],
};

pub static VN_POLICY: ComplexType = ComplexType {
    name: "VirtualNetworkPolicyType",
    fields: &[field("sequence", complex(&SEQUENCE)), field("timer", ANY)],
};

pub static MAC_ADDRESSES: ComplexType = ComplexType {
    name: "MacAddressesType",
    fields: &[field("mac_address", PropType::SimpleList(SimpleType::MacAddress))],
};

pub static ALLOWED_ADDRESS_PAIR: ComplexType = ComplexType {
    name: "AllowedAddressPair",
    fields: &[
        field("ip", complex(&SUBNET)),
        field("mac", STR),
        field("address_mode", one_of(&["active-active", "active-standby"])),
    ],
};

pub static ALLOWED_ADDRESS_PAIRS: ComplexType = ComplexType {
    name: "AllowedAddressPairs",
    fields: &[field(
        "allowed_address_pair",
        PropType::ComplexList(&ALLOWED_ADDRESS_PAIR),
    )],
};

pub static VMI_PROPERTIES: ComplexType = ComplexType {
    name: "VirtualMachineInterfacePropertiesType",
    fields: &[
        field("service_interface_type", SERVICE_IFACE),
        field("sub_interface_vlan_tag", int_range(1, 4095)),
        field("local_preference", INT),
        field("interface_mirror", ANY),
        field("max_flows", INT),
    ],
};

pub static FAT_FLOW_PROTOCOL: ComplexType = ComplexType {
    name: "ProtocolType",
    fields: &[
        field("protocol", STR),
        field("port", INT),
        field("ignore_address", one_of(&["none", "source", "destination"])),
    ],
};

pub static PORT: ComplexType = ComplexType {
    name: "PortType",
    fields: &[
        field("start_port", int_range(-1, 65535)),
        field("end_port", int_range(-1, 65535)),
    ],
};

pub static ADDRESS: ComplexType = ComplexType {
    name: "AddressType",
    fields: &[
        field("subnet", complex(&SUBNET)),
        field("virtual_network", STR),
        field("security_group", STR),
        field("network_policy", STR),
        field("subnet_list", PropType::ComplexList(&SUBNET)),
    ],
};

pub static ACTION_LIST: ComplexType = ComplexType {
    name: "ActionListType",
    fields: &[
        field(
            "simple_action",
            one_of(&["deny", "pass", "alert", "drop", "reject", "log"]),
        ),
        field("gateway_name", STR),
        field("apply_service", STR_LIST),
        field("log", BOOL),
        field("alert", BOOL),
        field("mirror_to", ANY),
        field("qos_action", STR),
        field("assign_routing_instance", STR),
    ],
};

pub static POLICY_RULE: ComplexType = ComplexType {
    name: "PolicyRuleType",
    fields: &[
        field("rule_uuid", STR),
        field("rule_sequence", complex(&SEQUENCE)),
        field("direction", one_of(&[">", "<>"])),
        field("protocol", STR),
        field("src_addresses", PropType::ComplexList(&ADDRESS)),
        field("src_ports", PropType::ComplexList(&PORT)),
        field("dst_addresses", PropType::ComplexList(&ADDRESS)),
        field("dst_ports", PropType::ComplexList(&PORT)),
        field("action_list", complex(&ACTION_LIST)),
        field("ethertype", one_of(&["IPv4", "IPv6"])),
        field("application", STR_LIST),
        field("created", STR),
        field("last_modified", STR),
    ],
};

pub static POLICY_ENTRIES: ComplexType = ComplexType {
    name: "PolicyEntriesType",
    fields: &[field("policy_rule", PropType::ComplexList(&POLICY_RULE))],
};

pub static INSTANCE_TARGET: ComplexType = ComplexType {
    name: "InstanceTargetType",
    fields: &[field("import_export", one_of(&["import", "export"]))],
};

pub static CONNECTION: ComplexType = ComplexType {
    name: "ConnectionType",
    fields: &[field("destination_instance", STR)],
};

pub static LR_VN: ComplexType = ComplexType {
    name: "LogicalRouterVirtualNetworkType",
    fields: &[field(
        "logical_router_virtual_network_type",
        one_of(&["ExternalGateway", "InternalVirtualNetwork"]),
    )],
};

pub static FIP_POOL_SUBNETS: ComplexType = ComplexType {
    name: "FloatingIpPoolSubnetType",
    fields: &[field("subnet_uuid", STR_LIST)],
};

pub static FIREWALL_SEQUENCE: ComplexType = ComplexType {
    name: "FirewallSequence",
    fields: &[field("sequence", STR)],
};

pub static FIREWALL_SERVICE: ComplexType = ComplexType {
    name: "FirewallServiceType",
    fields: &[
        field("protocol", STR),
        field("protocol_id", INT),
        field("src_ports", complex(&PORT)),
        field("dst_ports", complex(&PORT)),
    ],
};

pub static FIREWALL_SERVICE_GROUP: ComplexType = ComplexType {
    name: "FirewallServiceGroupType",
    fields: &[field(
        "firewall_service",
        PropType::ComplexList(&FIREWALL_SERVICE),
    )],
};

pub static FIREWALL_ENDPOINT: ComplexType = ComplexType {
    name: "FirewallRuleEndpointType",
    fields: &[
        field("subnet", complex(&SUBNET)),
        field("virtual_network", STR),
        field("address_group", STR),
        field("tags", STR_LIST),
        field("tag_ids", PropType::SimpleList(SimpleType::Integer { min: None, max: None })),
        field("any", BOOL),
    ],
};

pub static FIREWALL_MATCH_TAGS: ComplexType = ComplexType {
    name: "FirewallRuleMatchTagsType",
    fields: &[field("tag_list", STR_LIST)],
};

pub static SUBNET_LIST: ComplexType = ComplexType {
    name: "SubnetListType",
    fields: &[field("subnet", PropType::ComplexList(&SUBNET))],
};

pub static BGPAAS_PARAMETERS: ComplexType = ComplexType {
    name: "BGPaaServiceParametersType",
    fields: &[
        field("port_start", int_range(0, 65535)),
        field("port_end", int_range(0, 65535)),
    ],
};

pub static ENCAPSULATION_PRIORITIES: ComplexType = ComplexType {
    name: "EncapsulationPrioritiesType",
    fields: &[field(
        "encapsulation",
        PropType::SimpleList(SimpleType::Enum(&["MPLSoGRE", "MPLSoUDP", "VXLAN"])),
    )],
};

pub static LINKLOCAL_SERVICE: ComplexType = ComplexType {
    name: "LinklocalServiceEntryType",
    fields: &[
        field("linklocal_service_name", STR),
        field("linklocal_service_ip", IP),
        field("linklocal_service_port", int_range(0, 65535)),
        field("ip_fabric_DNS_service_name", STR),
        field("ip_fabric_service_port", int_range(0, 65535)),
        field("ip_fabric_service_ip", STR_LIST),
    ],
};

pub static LINKLOCAL_SERVICES: ComplexType = ComplexType {
    name: "LinklocalServicesTypes",
    fields: &[field(
        "linklocal_service_entry",
        PropType::ComplexList(&LINKLOCAL_SERVICE),
    )],
};

/// Per-project limits. Absent or -1 means unlimited.
pub static QUOTA: ComplexType = ComplexType {
    name: "QuotaType",
    fields: &[
        field("defaults", INT),
        field("floating_ip", INT),
        field("instance_ip", INT),
        field("virtual_machine_interface", INT),
        field("virtual_network", INT),
        field("subnet", INT),
        field("network_ipam", INT),
        field("logical_router", INT),
        field("security_group", INT),
        field("security_group_rule", INT),
        field("network_policy", INT),
        field("route_table", INT),
        field("loadbalancer", INT),
        field("loadbalancer_pool", INT),
        field("loadbalancer_member", INT),
        field("loadbalancer_listener", INT),
        field("service_instance", INT),
        field("service_template", INT),
        field("bgp_router", INT),
        field("bgp_as_a_service", INT),
        field("firewall_policy", INT),
        field("firewall_rule", INT),
        field("address_group", INT),
        field("service_group", INT),
        field("application_policy_set", INT),
        field("tag", INT),
        field("virtual_port_group", INT),
        field("interface_route_table", INT),
    ],
};

pub static DOMAIN_LIMITS: ComplexType = ComplexType {
    name: "DomainLimitsType",
    fields: &[
        field("project_limit", INT),
        field("virtual_network_limit", INT),
        field("security_group_limit", INT),
    ],
};

pub static BGP_ROUTER_PARAMS: ComplexType = ComplexType {
    name: "BgpRouterParams",
    fields: &[
        field("admin_down", BOOL),
        field("vendor", STR),
        field("autonomous_system", INT),
        field("identifier", STR),
        field("address", IP),
        field("port", int_range(0, 65535)),
        field("source_port", int_range(0, 65535)),
        field("hold_time", int_range(0, 65535)),
        field(
            "router_type",
            one_of(&[
                "control-node",
                "external-control-node",
                "router",
                "bgpaas-server",
                "bgpaas-client",
            ]),
        ),
        field("local_autonomous_system", INT),
    ],
};

pub static SERVICE_TEMPLATE_INTERFACE: ComplexType = ComplexType {
    name: "ServiceTemplateInterfaceType",
    fields: &[
        field("service_interface_type", SERVICE_IFACE),
        field("shared_ip", BOOL),
        field("static_route_enable", BOOL),
    ],
};

pub static SERVICE_TEMPLATE: ComplexType = ComplexType {
    name: "ServiceTemplateType",
    fields: &[
        field("version", INT),
        field(
            "service_mode",
            one_of(&["transparent", "in-network", "in-network-nat"]),
        ),
        field(
            "service_type",
            one_of(&["firewall", "analyzer", "source-nat", "loadbalancer"]),
        ),
        field("image_name", STR),
        field(
            "interface_type",
            PropType::ComplexList(&SERVICE_TEMPLATE_INTERFACE),
        ),
        field(
            "service_virtualization_type",
            one_of(&[
                "virtual-machine",
                "network-namespace",
                "vrouter-instance",
                "physical-device",
            ]),
        ),
        field("ordered_interfaces", BOOL),
    ],
};

pub static SERVICE_INSTANCE_INTERFACE: ComplexType = ComplexType {
    name: "ServiceInstanceInterfaceType",
    fields: &[
        field("virtual_network", STR),
        field("ip_address", IP),
        field("static_routes", complex(&ROUTE_TABLE)),
        field("allowed_address_pairs", complex(&ALLOWED_ADDRESS_PAIRS)),
    ],
};

pub static SCALE_OUT: ComplexType = ComplexType {
    name: "ServiceScaleOutType",
    fields: &[field("max_instances", INT), field("auto_scale", BOOL)],
};

pub static SERVICE_INSTANCE: ComplexType = ComplexType {
    name: "ServiceInstanceType",
    fields: &[
        field("auto_policy", BOOL),
        field("availability_zone", STR),
        field("management_virtual_network", STR),
        field("left_virtual_network", STR),
        field("left_ip_address", IP),
        field("right_virtual_network", STR),
        field("right_ip_address", IP),
        field(
            "interface_list",
            PropType::ComplexList(&SERVICE_INSTANCE_INTERFACE),
        ),
        field("scale_out", complex(&SCALE_OUT)),
        field("ha_mode", one_of(&["active-active", "active-standby"])),
        field("virtual_router_id", STR),
    ],
};

pub static SERVICE_INTERFACE_TAG: ComplexType = ComplexType {
    name: "ServiceInterfaceTag",
    fields: &[field("interface_type", SERVICE_IFACE)],
};

const LB_PROTOCOLS: &[&str] = &["HTTP", "HTTPS", "TCP", "UDP", "TERMINATED_HTTPS"];

pub static LOADBALANCER: ComplexType = ComplexType {
    name: "LoadbalancerType",
    fields: &[
        field("status", STR),
        field("provisioning_status", STR),
        field("operating_status", STR),
        field("vip_subnet_id", STR),
        field("vip_address", IP),
        field("admin_state", BOOL),
    ],
};

pub static LOADBALANCER_LISTENER: ComplexType = ComplexType {
    name: "LoadbalancerListenerType",
    fields: &[
        field("protocol", one_of(LB_PROTOCOLS)),
        field("protocol_port", int_range(0, 65535)),
        field("admin_state", BOOL),
        field("connection_limit", INT),
        field("default_tls_container", STR),
        field("sni_containers", STR_LIST),
    ],
};

pub static LOADBALANCER_POOL: ComplexType = ComplexType {
    name: "LoadbalancerPoolType",
    fields: &[
        field("status", STR),
        field("status_description", STR),
        field("admin_state", BOOL),
        field("protocol", one_of(LB_PROTOCOLS)),
        field(
            "loadbalancer_method",
            one_of(&["ROUND_ROBIN", "LEAST_CONNECTIONS", "SOURCE_IP"]),
        ),
        field("subnet_id", STR),
        field(
            "session_persistence",
            one_of(&["SOURCE_IP", "HTTP_COOKIE", "APP_COOKIE"]),
        ),
        field("persistence_cookie_name", STR),
    ],
};

pub static LOADBALANCER_MEMBER: ComplexType = ComplexType {
    name: "LoadbalancerMemberType",
    fields: &[
        field("admin_state", BOOL),
        field("status", STR),
        field("status_description", STR),
        field("protocol_port", int_range(0, 65535)),
        field("weight", INT),
        field("address", IP),
        field("subnet_id", STR),
    ],
};

pub static UVE_KEYS: ComplexType = ComplexType {
    name: "UveKeysType",
    fields: &[field("uve_key", STR_LIST)],
};

pub static RBAC_PERM: ComplexType = ComplexType {
    name: "RbacPermType",
    fields: &[field("role_name", STR), field("role_crud", STR)],
};

pub static RBAC_RULE: ComplexType = ComplexType {
    name: "RbacRuleType",
    fields: &[
        field("rule_object", STR),
        field("rule_field", STR),
        field("rule_perms", PropType::ComplexList(&RBAC_PERM)),
    ],
};

pub static RBAC_RULE_ENTRIES: ComplexType = ComplexType {
    name: "RbacRuleEntriesType",
    fields: &[field("rbac_rule", PropType::ComplexList(&RBAC_RULE))],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn community_attributes() {
        assert!(check_community_attribute("no-export").is_ok());
        assert!(check_community_attribute("64512:100").is_ok());
        assert!(check_community_attribute("65536:1").is_err());
        assert!(check_community_attribute("abc").is_err());
    }

    #[test]
    fn service_interface_types() {
        assert!(check_service_interface_type("left").is_ok());
        assert!(check_service_interface_type("other12").is_ok());
        assert!(check_service_interface_type("outside").is_err());
    }

    #[test]
    fn route_targets() {
        assert!(check_route_target("target:64512:8000001").is_ok());
        assert!(check_route_target("target:10.0.0.1:10").is_ok());
        assert!(check_route_target("64512:1").is_err());
        assert!(check_route_target("target:abc:1").is_err());
    }
}
