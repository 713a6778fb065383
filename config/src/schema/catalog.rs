// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The resource types served by the API.

use super::complex::{
    ALLOWED_ADDRESS_PAIRS, BGP_ROUTER_PARAMS, BGPAAS_PARAMETERS, CONNECTION,
    DOMAIN_LIMITS, ENCAPSULATION_PRIORITIES, FAT_FLOW_PROTOCOL, FIP_POOL_SUBNETS,
    FIREWALL_ENDPOINT, FIREWALL_MATCH_TAGS, FIREWALL_SEQUENCE, FIREWALL_SERVICE,
    FIREWALL_SERVICE_GROUP, INSTANCE_TARGET, IPAM, IPAM_SUBNETS, KEY_VALUE_PAIR,
    LINKLOCAL_SERVICES, LOADBALANCER, LOADBALANCER_LISTENER, LOADBALANCER_MEMBER,
    LOADBALANCER_POOL, LR_VN, MAC_ADDRESSES, POLICY_ENTRIES, QUOTA, RBAC_RULE_ENTRIES,
    ROUTE_TABLE, ROUTE_TARGET_LIST, SERVICE_INSTANCE, SERVICE_INTERFACE_TAG, SERVICE_TEMPLATE,
    SUBNET, SUBNET_LIST, UVE_KEYS, VMI_PROPERTIES, VN_POLICY, VN_PROPERTIES, VN_SUBNETS,
};
use super::{
    ANY, BOOL, INT, IP, PropDesc, ResourceType, STR, complex, derived_to, int_range,
    list_prop, map_prop, one_of, prop, required, to, to_with,
};

/// Pseudo parent type of top-level resources.
pub const CONFIG_ROOT: &str = "config-root";

pub const DRAFT_MODE_STATES: &[&str] = &["created", "updated", "deleted"];

/// Properties every resource carries.
pub static COMMON_PROPS: &[PropDesc] = &[
    prop("id_perms", complex(&super::complex::ID_PERMS)),
    prop("perms2", complex(&super::complex::PERMS2)),
    prop("display_name", STR),
    map_prop("annotations", &KEY_VALUE_PAIR, "key_value_pair", "key"),
];

const fn root(
    name: &'static str,
    props: &'static [PropDesc],
    refs: &'static [super::RefDesc],
) -> ResourceType {
    ResourceType {
        name,
        parents: &[],
        props,
        refs,
        derived_child: false,
        colon_allowed: false,
        quota: false,
    }
}

const fn under(
    name: &'static str,
    parents: &'static [&'static str],
    props: &'static [PropDesc],
    refs: &'static [super::RefDesc],
    quota: bool,
) -> ResourceType {
    ResourceType {
        name,
        parents,
        props,
        refs,
        derived_child: false,
        colon_allowed: false,
        quota,
    }
}

const SECURITY_PARENTS: &[&str] = &["policy-management", "project"];

pub static CATALOG: &[ResourceType] = &[
    root(
        "global-system-config",
        &[
            prop("autonomous_system", int_range(1, 4_294_967_295)),
            prop("enable_4byte_as", BOOL),
            prop("ibgp_auto_mesh", BOOL),
            prop("config_version", STR),
            prop("bgpaas_parameters", complex(&BGPAAS_PARAMETERS)),
            prop("alarm_enable", BOOL),
            prop("enable_security_policy_draft", BOOL),
        ],
        &[to("bgp-router")],
    ),
    under(
        "global-vrouter-config",
        &["global-system-config"],
        &[
            prop("forwarding_mode", one_of(&["l2_l3", "l2", "l3"])),
            prop(
                "vxlan_network_identifier_mode",
                one_of(&["configured", "automatic"]),
            ),
            prop("encapsulation_priorities", complex(&ENCAPSULATION_PRIORITIES)),
            prop("linklocal_services", complex(&LINKLOCAL_SERVICES)),
            prop("flow_export_rate", INT),
        ],
        &[],
        false,
    ),
    root(
        "domain",
        &[prop("domain_limits", complex(&DOMAIN_LIMITS))],
        &[],
    ),
    under(
        "project",
        &["domain"],
        &[
            prop("quota", complex(&QUOTA)),
            prop("vxlan_routing", BOOL),
            prop("alarm_enable", BOOL),
            prop("enable_security_policy_draft", BOOL),
        ],
        &[
            to("namespace"),
            to("application-policy-set"),
            to("floating-ip-pool"),
            to("tag"),
        ],
        false,
    ),
    under(
        "namespace",
        &["domain"],
        &[prop("namespace_cidr", complex(&SUBNET))],
        &[],
        false,
    ),
    under(
        "network-ipam",
        &["project"],
        &[
            prop("network_ipam_mgmt", complex(&IPAM)),
            prop("ipam_subnets", complex(&IPAM_SUBNETS)),
            prop(
                "ipam_subnet_method",
                one_of(&["user-defined-subnet", "flat-subnet", "auto-subnet"]),
            ),
        ],
        &[to("tag")],
        true,
    ),
    under(
        "virtual-network",
        &["project"],
        &[
            prop("virtual_network_properties", complex(&VN_PROPERTIES)),
            prop("virtual_network_network_id", INT),
            prop("route_target_list", complex(&ROUTE_TARGET_LIST)),
            prop("import_route_target_list", complex(&ROUTE_TARGET_LIST)),
            prop("export_route_target_list", complex(&ROUTE_TARGET_LIST)),
            prop("router_external", BOOL),
            prop("is_shared", BOOL),
            prop("is_provider_network", BOOL),
            prop("flood_unknown_unicast", BOOL),
            prop("port_security_enabled", BOOL),
            prop("mac_learning_enabled", BOOL),
            prop("fabric_snat", BOOL),
            prop("external_ipam", BOOL),
            prop("multi_policy_service_chains_enabled", BOOL),
            prop(
                "address_allocation_mode",
                one_of(&[
                    "user-defined-subnet-preferred",
                    "user-defined-subnet-only",
                    "flat-subnet-preferred",
                    "flat-subnet-only",
                ]),
            ),
            prop(
                "virtual_network_category",
                one_of(&["routed", "internal", "tenant"]),
            ),
            list_prop(
                "virtual_network_fat_flow_protocols",
                &FAT_FLOW_PROTOCOL,
                "fat_flow_protocol",
            ),
        ],
        &[
            to_with("network-ipam", &VN_SUBNETS),
            to_with("network-policy", &VN_POLICY),
            to("virtual-network"),
            to("interface-route-table"),
            to("tag"),
        ],
        true,
    ),
    ResourceType {
        name: "routing-instance",
        parents: &["virtual-network"],
        props: &[
            prop("routing_instance_is_default", BOOL),
            prop("routing_instance_has_pnf", BOOL),
            prop("routing_instance_fabric_snat", BOOL),
        ],
        refs: &[
            to_with("route-target", &INSTANCE_TARGET),
            to_with("routing-instance", &CONNECTION),
        ],
        derived_child: true,
        colon_allowed: false,
        quota: false,
    },
    ResourceType {
        name: "route-target",
        parents: &[],
        props: &[],
        refs: &[],
        derived_child: false,
        colon_allowed: true,
        quota: false,
    },
    root(
        "virtual-machine",
        &[prop(
            "server_type",
            one_of(&["virtual-server", "baremetal-server", "container"]),
        )],
        &[to("service-instance"), to("tag")],
    ),
    under(
        "virtual-machine-interface",
        &["project", "virtual-machine"],
        &[
            prop(
                "virtual_machine_interface_mac_addresses",
                complex(&MAC_ADDRESSES),
            ),
            prop("virtual_machine_interface_dhcp_option_list", ANY),
            prop(
                "virtual_machine_interface_host_routes",
                complex(&ROUTE_TABLE),
            ),
            prop(
                "virtual_machine_interface_allowed_address_pairs",
                complex(&ALLOWED_ADDRESS_PAIRS),
            ),
            prop("virtual_machine_interface_device_owner", STR),
            prop(
                "virtual_machine_interface_properties",
                complex(&VMI_PROPERTIES),
            ),
            map_prop(
                "virtual_machine_interface_bindings",
                &KEY_VALUE_PAIR,
                "key_value_pair",
                "key",
            ),
            prop("virtual_machine_interface_disable_policy", BOOL),
            prop("port_security_enabled", BOOL),
            list_prop(
                "virtual_machine_interface_fat_flow_protocols",
                &FAT_FLOW_PROTOCOL,
                "fat_flow_protocol",
            ),
            prop("vlan_tag_based_bridge_domain", BOOL),
            prop("ecmp_hashing_include_fields", ANY),
        ],
        &[
            to("virtual-network"),
            to("security-group"),
            to("virtual-machine"),
            to("virtual-machine-interface"),
            to("interface-route-table"),
            to("port-tuple"),
            to("tag"),
            derived_to("routing-instance"),
        ],
        true,
    ),
    root(
        "instance-ip",
        &[
            prop("instance_ip_address", IP),
            prop("instance_ip_family", one_of(&["v4", "v6"])),
            prop("instance_ip_mode", one_of(&["active-active", "active-standby"])),
            prop("subnet_uuid", STR),
            prop("instance_ip_secondary", BOOL),
            prop("service_instance_ip", BOOL),
            prop("service_health_check_ip", BOOL),
            prop("instance_ip_local_ip", BOOL),
        ],
        &[to("virtual-network"), to("virtual-machine-interface")],
    ),
    under(
        "floating-ip-pool",
        &["virtual-network"],
        &[prop("floating_ip_pool_subnets", complex(&FIP_POOL_SUBNETS))],
        &[],
        false,
    ),
    under(
        "floating-ip",
        &["floating-ip-pool", "instance-ip"],
        &[
            prop("floating_ip_address", IP),
            prop("floating_ip_is_virtual_ip", BOOL),
            prop("floating_ip_fixed_ip_address", IP),
            prop("floating_ip_address_family", one_of(&["v4", "v6"])),
            prop("floating_ip_port_mappings_enable", BOOL),
            prop(
                "floating_ip_traffic_direction",
                one_of(&["ingress", "egress", "both"]),
            ),
        ],
        &[to("project"), to("virtual-machine-interface")],
        true,
    ),
    under(
        "security-group",
        &["project"],
        &[
            prop("security_group_id", INT),
            prop("configured_security_group_id", int_range(0, 7_999_999)),
            prop("security_group_entries", complex(&POLICY_ENTRIES)),
        ],
        &[to("tag")],
        true,
    ),
    under(
        "logical-router",
        &["project"],
        &[
            prop("configured_route_target_list", complex(&ROUTE_TARGET_LIST)),
            prop("vxlan_network_identifier", STR),
            prop(
                "logical_router_type",
                one_of(&["snat-routing", "vxlan-routing"]),
            ),
            prop("logical_router_gateway_external", BOOL),
        ],
        &[
            to("virtual-machine-interface"),
            to("route-target"),
            to_with("virtual-network", &LR_VN),
            to("service-instance"),
            to("tag"),
        ],
        true,
    ),
    under(
        "interface-route-table",
        &["project"],
        &[prop("interface_route_table_routes", complex(&ROUTE_TABLE))],
        &[to("service-instance")],
        true,
    ),
    under(
        "network-policy",
        &["project"],
        &[prop("network_policy_entries", complex(&POLICY_ENTRIES))],
        &[to("tag")],
        true,
    ),
    root("tag-type", &[prop("tag_type_id", STR)], &[]),
    under(
        "tag",
        &["project", CONFIG_ROOT],
        &[
            prop("tag_type_name", STR),
            prop("tag_value", STR),
            prop("tag_id", STR),
            prop("tag_predefined", BOOL),
        ],
        &[to("tag-type")],
        true,
    ),
    under(
        "policy-management",
        &[CONFIG_ROOT, "project"],
        &[],
        &[],
        false,
    ),
    under(
        "application-policy-set",
        SECURITY_PARENTS,
        &[
            prop("all_applications", BOOL),
            prop("draft_mode_state", one_of(DRAFT_MODE_STATES)),
        ],
        &[
            to_with("firewall-policy", &FIREWALL_SEQUENCE),
            to("global-vrouter-config"),
            to("tag"),
        ],
        true,
    ),
    under(
        "firewall-policy",
        SECURITY_PARENTS,
        &[prop("draft_mode_state", one_of(DRAFT_MODE_STATES))],
        &[to_with("firewall-rule", &FIREWALL_SEQUENCE), to("tag")],
        true,
    ),
    under(
        "firewall-rule",
        SECURITY_PARENTS,
        &[
            prop("action_list", complex(&super::complex::ACTION_LIST)),
            prop("service", complex(&FIREWALL_SERVICE)),
            prop("endpoint_1", complex(&FIREWALL_ENDPOINT)),
            prop("endpoint_2", complex(&FIREWALL_ENDPOINT)),
            prop("match_tags", complex(&FIREWALL_MATCH_TAGS)),
            prop("direction", one_of(&["<", ">", "<>"])),
            prop("draft_mode_state", one_of(DRAFT_MODE_STATES)),
        ],
        &[
            to("service-group"),
            to("address-group"),
            to("virtual-network"),
            to("tag"),
        ],
        true,
    ),
    under(
        "address-group",
        SECURITY_PARENTS,
        &[
            prop("address_group_prefix", complex(&SUBNET_LIST)),
            prop("draft_mode_state", one_of(DRAFT_MODE_STATES)),
        ],
        &[to("tag")],
        true,
    ),
    under(
        "service-group",
        SECURITY_PARENTS,
        &[
            prop(
                "service_group_firewall_service_list",
                complex(&FIREWALL_SERVICE_GROUP),
            ),
            prop("draft_mode_state", one_of(DRAFT_MODE_STATES)),
        ],
        &[],
        true,
    ),
    under(
        "bgp-router",
        &["routing-instance"],
        &[prop("bgp_router_parameters", complex(&BGP_ROUTER_PARAMS))],
        &[to("bgp-router")],
        true,
    ),
    under(
        "bgp-as-a-service",
        &["project"],
        &[
            prop("autonomous_system", int_range(1, 4_294_967_295)),
            prop("bgpaas_ip_address", IP),
            prop("bgpaas_shared", BOOL),
            prop("bgpaas_ipv4_mapped_ipv6_nexthop", BOOL),
            prop("bgpaas_suppress_route_advertisement", BOOL),
            prop("bgpaas_session_attributes", ANY),
        ],
        &[to("virtual-machine-interface"), derived_to("bgp-router")],
        true,
    ),
    under(
        "fabric",
        &["global-system-config"],
        &[
            prop("fabric_ztp", BOOL),
            prop("fabric_os_version", STR),
            prop("fabric_enterprise_style", BOOL),
        ],
        &[],
        false,
    ),
    under(
        "virtual-port-group",
        &["fabric"],
        &[
            prop("virtual_port_group_id", INT),
            prop("virtual_port_group_lacp_enabled", BOOL),
            prop("virtual_port_group_trunk_port_id", STR),
            prop("virtual_port_group_user_created", BOOL),
            prop("virtual_port_group_type", one_of(&["access", "routed"])),
        ],
        &[to("virtual-machine-interface"), to("security-group")],
        true,
    ),
    under(
        "service-template",
        &["domain"],
        &[required(
            "service_template_properties",
            complex(&SERVICE_TEMPLATE),
        )],
        &[],
        true,
    ),
    under(
        "service-instance",
        &["project"],
        &[
            prop("service_instance_properties", complex(&SERVICE_INSTANCE)),
            map_prop(
                "service_instance_bindings",
                &KEY_VALUE_PAIR,
                "key_value_pair",
                "key",
            ),
        ],
        &[
            to("service-template"),
            to_with("instance-ip", &SERVICE_INTERFACE_TAG),
        ],
        true,
    ),
    under("port-tuple", &["service-instance"], &[], &[], false),
    under(
        "loadbalancer",
        &["project"],
        &[
            prop("loadbalancer_properties", complex(&LOADBALANCER)),
            prop("loadbalancer_provider", STR),
        ],
        &[to("virtual-machine-interface"), to("service-instance")],
        true,
    ),
    under(
        "loadbalancer-listener",
        &["project"],
        &[prop(
            "loadbalancer_listener_properties",
            complex(&LOADBALANCER_LISTENER),
        )],
        &[to("loadbalancer")],
        true,
    ),
    under(
        "loadbalancer-pool",
        &["project"],
        &[
            prop("loadbalancer_pool_properties", complex(&LOADBALANCER_POOL)),
            prop("loadbalancer_pool_provider", STR),
        ],
        &[
            to("loadbalancer-listener"),
            to("service-instance"),
            to("virtual-machine-interface"),
        ],
        true,
    ),
    under(
        "loadbalancer-member",
        &["loadbalancer-pool"],
        &[prop(
            "loadbalancer_member_properties",
            complex(&LOADBALANCER_MEMBER),
        )],
        &[],
        true,
    ),
    under(
        "alarm",
        &["global-system-config", "project"],
        &[
            prop("alarm_rules", ANY),
            prop("uve_keys", complex(&UVE_KEYS)),
            prop("alarm_severity", int_range(0, 2)),
        ],
        &[],
        false,
    ),
    under(
        "api-access-list",
        &["domain", "project", "global-system-config"],
        &[prop("api_access_list_entries", complex(&RBAC_RULE_ENTRIES))],
        &[],
        false,
    ),
    under(
        "job-template",
        &["global-system-config"],
        &[
            prop("job_template_type", STR),
            prop("job_template_playbooks", ANY),
            prop("job_template_input_schema", STR),
        ],
        &[],
        false,
    ),
    under(
        "virtual-router",
        &["global-system-config"],
        &[
            prop("virtual_router_ip_address", IP),
            prop("virtual_router_type", one_of(&["embedded", "tor-agent", "tor-service-node"])),
        ],
        &[to("virtual-machine")],
        false,
    ),
];

/// Firewall resources staged per scope while security draft mode is enabled, leaves last.
pub const SECURITY_OBJECT_TYPES: &[&str] = &[
    "application-policy-set",
    "firewall-policy",
    "firewall-rule",
    "service-group",
    "address-group",
];
