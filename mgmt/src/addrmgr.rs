// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-process address manager.
//!
//! Every virtual network owns the subnets of its `network_ipam_refs`. Each subnet keeps a bitmap
//! of used host offsets; the network, broadcast, gateway and DNS addresses are reserved when the
//! subnet is registered.

use config::{ApiError, ApiResult, FqName};
use ipnet::IpNet;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::debug;

use tracectl::trace_target;
trace_target!("addrmgr", LevelFilter::INFO, &["ipam"]);

/// Offsets above this are never handed out in large (IPv6) subnets.
const MAX_OFFSET: u32 = u32::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// `v4` or `v6`.
    pub fn parse(value: &str) -> ApiResult<Self> {
        match value {
            "v4" => Ok(Family::V4),
            "v6" => Ok(Family::V6),
            other => Err(ApiError::bad_request(format!(
                "Invalid address family: {other}"
            ))),
        }
    }

    fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }
}

/// One subnet of a virtual network as configured in its ipam references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSpec {
    pub subnet_uuid: String,
    pub prefix: IpNet,
    pub gateway: Option<IpAddr>,
    pub dns: Option<IpAddr>,
    pub pools: Vec<(IpAddr, IpAddr)>,
    pub addr_from_start: bool,
}

fn parse_ip(value: &Value, what: &str) -> ApiResult<Option<IpAddr>> {
    match value.as_str() {
        None => Ok(None),
        Some(text) => IpAddr::from_str(text)
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("Invalid {what}: {text}"))),
    }
}

fn host_offset(net: &IpNet, addr: IpAddr) -> Option<u128> {
    if !net.contains(&addr) {
        return None;
    }
    match (net.network(), addr) {
        (IpAddr::V4(base), IpAddr::V4(a)) => Some(u128::from(u32::from(a) - u32::from(base))),
        (IpAddr::V6(base), IpAddr::V6(a)) => Some(u128::from(a) - u128::from(base)),
        _ => None,
    }
}

fn host_at(net: &IpNet, offset: u32) -> IpAddr {
    match net.network() {
        IpAddr::V4(base) => IpAddr::V4(Ipv4Addr::from(u32::from(base).wrapping_add(offset))),
        IpAddr::V6(base) => IpAddr::V6(Ipv6Addr::from(
            u128::from(base).wrapping_add(u128::from(offset)),
        )),
    }
}

/// Number of addresses in the prefix, capped to what a bitmap can index.
fn prefix_size(net: &IpNet) -> u64 {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    if host_bits >= 32 {
        u64::from(MAX_OFFSET) + 1
    } else {
        1u64 << host_bits
    }
}

impl SubnetSpec {
    /// Parse one `IpamSubnetType` value. Subnets without a prefix (flat ipam) yield `None`.
    pub fn from_ipam_subnet(value: &Value) -> ApiResult<Option<Self>> {
        let Some(subnet) = value.get("subnet").filter(|s| !s.is_null()) else {
            return Ok(None);
        };
        let prefix = subnet
            .get("ip_prefix")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::bad_request("Subnet is missing ip_prefix"))?;
        let len = subnet
            .get("ip_prefix_len")
            .and_then(Value::as_u64)
            .ok_or_else(|| ApiError::bad_request("Subnet is missing ip_prefix_len"))?;
        let net = IpNet::from_str(&format!("{prefix}/{len}"))
            .map_err(|_| ApiError::bad_request(format!("Invalid subnet {prefix}/{len}")))?;
        if net.trunc() != net {
            return Err(ApiError::bad_request(format!(
                "Invalid subnet {prefix}/{len}: host bits set"
            )));
        }
        let mut pools = Vec::new();
        for pool in value
            .get("allocation_pools")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let start = parse_ip(pool.get("start").unwrap_or(&Value::Null), "pool start")?;
            let end = parse_ip(pool.get("end").unwrap_or(&Value::Null), "pool end")?;
            let (Some(start), Some(end)) = (start, end) else {
                return Err(ApiError::bad_request("Allocation pool needs start and end"));
            };
            if !net.contains(&start) || !net.contains(&end) || start > end {
                return Err(ApiError::bad_request(format!(
                    "Invalid allocation pool {start}-{end} for subnet {net}"
                )));
            }
            pools.push((start, end));
        }
        Ok(Some(SubnetSpec {
            subnet_uuid: value
                .get("subnet_uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            prefix: net,
            gateway: parse_ip(
                value.get("default_gateway").unwrap_or(&Value::Null),
                "default gateway",
            )?,
            dns: parse_ip(
                value.get("dns_server_address").unwrap_or(&Value::Null),
                "dns server address",
            )?,
            pools,
            addr_from_start: value
                .get("addr_from_start")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }))
    }

    /// First host address, the gateway used when none is configured.
    #[must_use]
    pub fn default_gateway(&self) -> IpAddr {
        host_at(&self.prefix, 1)
    }

    /// Second host address, the DNS service address used when none is configured.
    #[must_use]
    pub fn default_dns(&self) -> IpAddr {
        host_at(&self.prefix, 2)
    }

    fn family(&self) -> Family {
        Family::of(&self.prefix)
    }
}

/// Every subnet in the `ipam_subnets` of the `network_ipam_refs` of a network body.
pub fn vn_subnets(vn: &Map<String, Value>) -> ApiResult<Vec<SubnetSpec>> {
    let mut out = Vec::new();
    for edge in vn
        .get("network_ipam_refs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for subnet in edge
            .pointer("/attr/ipam_subnets")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(spec) = SubnetSpec::from_ipam_subnet(subnet)? {
                out.push(spec);
            }
        }
    }
    Ok(out)
}

/// Refuse subnets that overlap each other.
pub fn check_overlap(subnets: &[SubnetSpec]) -> ApiResult<()> {
    for (i, a) in subnets.iter().enumerate() {
        for b in &subnets[i + 1..] {
            if a.prefix.contains(&b.prefix.network()) || b.prefix.contains(&a.prefix.network()) {
                return Err(ApiError::bad_request(format!(
                    "Overlapping addresses: [{}, {}]",
                    a.prefix, b.prefix
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
struct SubnetPool {
    spec: SubnetSpec,
    /// Allocatable offset ranges, inclusive.
    ranges: Vec<(u32, u32)>,
    reserved: RoaringBitmap,
    used: RoaringBitmap,
}

impl SubnetPool {
    fn new(spec: SubnetSpec) -> Self {
        let size = prefix_size(&spec.prefix);
        let last = u32::try_from(size.saturating_sub(1)).unwrap_or(MAX_OFFSET);
        let mut reserved = RoaringBitmap::new();
        reserved.insert(0);
        if spec.family() == Family::V4 {
            reserved.insert(last);
        }
        for addr in [spec.gateway, spec.dns].into_iter().flatten() {
            if let Some(offset) = host_offset(&spec.prefix, addr).and_then(|o| u32::try_from(o).ok())
            {
                reserved.insert(offset);
            }
        }
        let ranges = if spec.pools.is_empty() {
            vec![(1, last.max(1))]
        } else {
            spec.pools
                .iter()
                .filter_map(|(start, end)| {
                    let start = u32::try_from(host_offset(&spec.prefix, *start)?).ok()?;
                    let end = u32::try_from(host_offset(&spec.prefix, *end)?).unwrap_or(MAX_OFFSET);
                    Some((start, end))
                })
                .collect()
        };
        Self {
            spec,
            ranges,
            reserved,
            used: RoaringBitmap::new(),
        }
    }

    fn offset(&self, addr: IpAddr) -> Option<u32> {
        host_offset(&self.spec.prefix, addr).and_then(|o| u32::try_from(o).ok())
    }

    fn is_free(&self, offset: u32) -> bool {
        !self.used.contains(offset) && !self.reserved.contains(offset)
    }

    fn find_free(&self) -> Option<u32> {
        // IPv6 subnets are too large to scan from the end
        if self.spec.addr_from_start || self.spec.family() == Family::V6 {
            self.ranges
                .iter()
                .find_map(|(start, end)| (*start..=*end).find(|o| self.is_free(*o)))
        } else {
            self.ranges
                .iter()
                .rev()
                .find_map(|(start, end)| (*start..=*end).rev().find(|o| self.is_free(*o)))
        }
    }
}

/// Subnets and allocations of every known virtual network.
#[derive(Debug, Default)]
pub struct AddressManager {
    nets: RwLock<HashMap<String, Vec<SubnetPool>>>,
}

fn key(vn: &FqName) -> String {
    vn.to_string()
}

impl AddressManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the subnets of a new network.
    pub fn net_create(&self, vn: &FqName, subnets: Vec<SubnetSpec>) {
        debug!("Network {vn} registered with {} subnets", subnets.len());
        let pools = subnets.into_iter().map(SubnetPool::new).collect();
        self.nets.write().insert(key(vn), pools);
    }

    /// Replace the subnets of a network, keeping the allocations of retained subnets.
    ///
    /// Returns the previous subnets. Removing a subnet that still has allocations is refused.
    pub fn net_update(&self, vn: &FqName, subnets: Vec<SubnetSpec>) -> ApiResult<Vec<SubnetSpec>> {
        let mut nets = self.nets.write();
        let current = nets.remove(&key(vn)).unwrap_or_default();
        if let Some(busy) = current.iter().find(|pool| {
            !pool.used.is_empty() && !subnets.iter().any(|s| s.prefix == pool.spec.prefix)
        }) {
            let prefix = busy.spec.prefix;
            nets.insert(key(vn), current);
            return Err(ApiError::Conflict(format!(
                "Cannot Delete IP Block, IP(s) in use: {prefix}"
            )));
        }
        let previous: Vec<SubnetSpec> = current.iter().map(|p| p.spec.clone()).collect();
        let mut kept: HashMap<IpNet, RoaringBitmap> = current
            .into_iter()
            .map(|pool| (pool.spec.prefix, pool.used))
            .collect();
        let pools = subnets
            .into_iter()
            .map(|spec| {
                let mut pool = SubnetPool::new(spec);
                if let Some(used) = kept.remove(&pool.spec.prefix) {
                    pool.used = used;
                }
                pool
            })
            .collect();
        nets.insert(key(vn), pools);
        Ok(previous)
    }

    /// Put back subnets saved by [`net_update`](Self::net_update) or [`net_delete`](Self::net_delete).
    pub fn net_restore(&self, vn: &FqName, subnets: Vec<SubnetSpec>) {
        let mut nets = self.nets.write();
        let mut kept: HashMap<IpNet, RoaringBitmap> = nets
            .remove(&key(vn))
            .unwrap_or_default()
            .into_iter()
            .map(|pool| (pool.spec.prefix, pool.used))
            .collect();
        let pools = subnets
            .into_iter()
            .map(|spec| {
                let mut pool = SubnetPool::new(spec);
                if let Some(used) = kept.remove(&pool.spec.prefix) {
                    pool.used = used;
                }
                pool
            })
            .collect();
        nets.insert(key(vn), pools);
    }

    /// Forget a network. Returns its subnets.
    pub fn net_delete(&self, vn: &FqName) -> Option<Vec<SubnetSpec>> {
        self.nets
            .write()
            .remove(&key(vn))
            .map(|pools| pools.into_iter().map(|p| p.spec).collect())
    }

    #[must_use]
    pub fn is_known(&self, vn: &FqName) -> bool {
        self.nets.read().contains_key(&key(vn))
    }

    #[must_use]
    pub fn subnets(&self, vn: &FqName) -> Vec<SubnetSpec> {
        self.nets
            .read()
            .get(&key(vn))
            .map(|pools| pools.iter().map(|p| p.spec.clone()).collect())
            .unwrap_or_default()
    }

    /// Allocate an address, optionally a requested one, optionally from one subnet.
    ///
    /// Returns the address and the uuid of the subnet it came from.
    pub fn alloc(
        &self,
        vn: &FqName,
        family: Option<Family>,
        subnet_uuid: Option<&str>,
        requested: Option<IpAddr>,
    ) -> ApiResult<(IpAddr, String)> {
        let mut nets = self.nets.write();
        let pools = nets
            .get_mut(&key(vn))
            .ok_or_else(|| ApiError::bad_request(format!("Virtual network {vn} has no subnets")))?;
        let candidates = pools.iter_mut().filter(|pool| {
            family.is_none_or(|f| pool.spec.family() == f)
                && subnet_uuid.is_none_or(|s| pool.spec.subnet_uuid == s)
        });

        if let Some(addr) = requested {
            for pool in candidates {
                let Some(offset) = pool.offset(addr) else {
                    continue;
                };
                if pool.used.contains(offset) {
                    return Err(ApiError::Conflict(format!(
                        "Ip address already in use: {addr}"
                    )));
                }
                if pool.reserved.contains(offset) {
                    return Err(ApiError::Conflict(format!(
                        "Ip address already in use: {addr} is reserved"
                    )));
                }
                pool.used.insert(offset);
                debug!("Allocated requested {addr} in {vn}");
                return Ok((addr, pool.spec.subnet_uuid.clone()));
            }
            return Err(ApiError::bad_request(format!(
                "Requested ip address {addr} is not in any subnet of {vn}"
            )));
        }

        let mut tried = Vec::new();
        for pool in candidates {
            if let Some(offset) = pool.find_free() {
                pool.used.insert(offset);
                let addr = host_at(&pool.spec.prefix, offset);
                debug!("Allocated {addr} in {vn}");
                return Ok((addr, pool.spec.subnet_uuid.clone()));
            }
            tried.push(pool.spec.prefix.to_string());
        }
        if tried.is_empty() {
            return Err(ApiError::bad_request(format!(
                "Virtual network {vn} has no matching subnet"
            )));
        }
        Err(ApiError::Conflict(format!(
            "Virtual-Network({vn}) has exhausted subnet({})",
            tried.join(", ")
        )))
    }

    /// Give an address back. Unknown networks or addresses are ignored.
    pub fn free(&self, vn: &FqName, addr: IpAddr) {
        let mut nets = self.nets.write();
        if let Some(pool) = nets
            .get_mut(&key(vn))
            .and_then(|pools| pools.iter_mut().find(|p| p.spec.prefix.contains(&addr)))
            && let Some(offset) = pool.offset(addr)
        {
            pool.used.remove(offset);
            debug!("Freed {addr} in {vn}");
        }
    }

    /// Mark an address as used without checks, when rebuilding state at startup.
    pub fn mark(&self, vn: &FqName, addr: IpAddr) {
        let mut nets = self.nets.write();
        if let Some(pool) = nets
            .get_mut(&key(vn))
            .and_then(|pools| pools.iter_mut().find(|p| p.spec.prefix.contains(&addr)))
            && let Some(offset) = pool.offset(addr)
        {
            pool.used.insert(offset);
        }
    }

    #[must_use]
    pub fn is_allocated(&self, vn: &FqName, addr: IpAddr) -> bool {
        self.nets
            .read()
            .get(&key(vn))
            .and_then(|pools| pools.iter().find(|p| p.spec.prefix.contains(&addr)))
            .and_then(|pool| pool.offset(addr).map(|o| pool.used.contains(o)))
            .unwrap_or(false)
    }

    /// Allocated address count of each listed subnet (`prefix/len`), all subnets when empty.
    #[must_use]
    pub fn count(&self, vn: &FqName, subnets: &[String]) -> Vec<u64> {
        let nets = self.nets.read();
        let Some(pools) = nets.get(&key(vn)) else {
            return vec![0; subnets.len()];
        };
        if subnets.is_empty() {
            return pools.iter().map(|p| p.used.len()).collect();
        }
        subnets
            .iter()
            .map(|wanted| {
                pools
                    .iter()
                    .find(|p| p.spec.prefix.to_string() == *wanted)
                    .map_or(0, |p| p.used.len())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec(prefix: &str, from_start: bool) -> SubnetSpec {
        SubnetSpec {
            subnet_uuid: format!("uuid-{prefix}"),
            prefix: IpNet::from_str(prefix).expect("valid prefix"),
            gateway: None,
            dns: None,
            pools: vec![],
            addr_from_start: from_start,
        }
    }

    fn vn() -> FqName {
        FqName::new(["default-domain", "p1", "vn1"])
    }

    #[test]
    fn parses_ipam_subnets_of_a_network() {
        let body = json!({
            "network_ipam_refs": [{
                "to": ["default-domain", "p1", "ipam"],
                "attr": {"ipam_subnets": [
                    {"subnet": {"ip_prefix": "10.0.0.0", "ip_prefix_len": 24},
                     "default_gateway": "10.0.0.254", "subnet_uuid": "s1"},
                    {"subnet_uuid": "flat"}
                ]}
            }]
        });
        let subnets = vn_subnets(body.as_object().expect("object")).expect("parses");
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets[0].subnet_uuid, "s1");
        assert_eq!(subnets[0].gateway, Some(IpAddr::from([10, 0, 0, 254])));

        let bad = json!({"subnet": {"ip_prefix": "10.0.0.1", "ip_prefix_len": 24}});
        assert!(SubnetSpec::from_ipam_subnet(&bad).is_err());
    }

    #[test]
    fn overlapping_subnets_are_refused() {
        let ok = [spec("10.0.0.0/24", true), spec("10.0.1.0/24", true)];
        assert!(check_overlap(&ok).is_ok());
        let overlapping = [spec("10.0.0.0/16", true), spec("10.0.1.0/24", true)];
        let err = check_overlap(&overlapping).expect_err("overlap");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn allocation_order_and_reservations() {
        let mgr = AddressManager::new();
        let mut from_start = spec("10.0.0.0/29", true);
        from_start.gateway = Some(from_start.default_gateway());
        from_start.dns = Some(from_start.default_dns());
        mgr.net_create(&vn(), vec![from_start]);
        let (first, subnet) = mgr.alloc(&vn(), None, None, None).expect("alloc");
        assert_eq!(first, IpAddr::from([10, 0, 0, 3]));
        assert_eq!(subnet, "uuid-10.0.0.0/29");

        let other = FqName::new(["default-domain", "p1", "vn2"]);
        mgr.net_create(&other, vec![spec("10.1.0.0/29", false)]);
        let (last, _) = mgr.alloc(&other, Some(Family::V4), None, None).expect("alloc");
        assert_eq!(last, IpAddr::from([10, 1, 0, 6]));
    }

    #[test]
    fn requested_address_in_use_conflicts() {
        let mgr = AddressManager::new();
        mgr.net_create(&vn(), vec![spec("10.0.0.0/24", true)]);
        let addr = IpAddr::from([10, 0, 0, 10]);
        mgr.alloc(&vn(), None, None, Some(addr)).expect("first");
        let err = mgr.alloc(&vn(), None, None, Some(addr)).expect_err("in use");
        assert_eq!(err.status(), 409);
        assert!(err.to_string().contains("already in use"));
        assert!(mgr.is_allocated(&vn(), addr));
        mgr.free(&vn(), addr);
        assert!(!mgr.is_allocated(&vn(), addr));

        let outside = IpAddr::from([192, 168, 0, 1]);
        let err = mgr.alloc(&vn(), None, None, Some(outside)).expect_err("outside");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn exhaustion_is_a_conflict() {
        let mgr = AddressManager::new();
        // /30: offsets 1 and 2 usable
        mgr.net_create(&vn(), vec![spec("10.0.0.0/30", true)]);
        mgr.alloc(&vn(), None, None, None).expect("one");
        mgr.alloc(&vn(), None, None, None).expect("two");
        let err = mgr.alloc(&vn(), None, None, None).expect_err("exhausted");
        assert_eq!(err.status(), 409);
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn allocation_pools_restrict_candidates() {
        let mgr = AddressManager::new();
        let mut s = spec("10.0.0.0/24", true);
        s.pools = vec![(IpAddr::from([10, 0, 0, 100]), IpAddr::from([10, 0, 0, 101]))];
        mgr.net_create(&vn(), vec![s]);
        let (a, _) = mgr.alloc(&vn(), None, None, None).expect("a");
        let (b, _) = mgr.alloc(&vn(), None, None, None).expect("b");
        assert_eq!(a, IpAddr::from([10, 0, 0, 100]));
        assert_eq!(b, IpAddr::from([10, 0, 0, 101]));
        assert!(mgr.alloc(&vn(), None, None, None).is_err());
    }

    #[test]
    fn update_keeps_allocations_and_refuses_busy_removal() {
        let mgr = AddressManager::new();
        mgr.net_create(&vn(), vec![spec("10.0.0.0/24", true)]);
        let (addr, _) = mgr.alloc(&vn(), None, None, None).expect("alloc");
        let err = mgr
            .net_update(&vn(), vec![spec("10.0.1.0/24", true)])
            .expect_err("busy");
        assert_eq!(err.status(), 409);
        assert!(mgr.is_allocated(&vn(), addr));

        let previous = mgr
            .net_update(&vn(), vec![spec("10.0.0.0/24", true), spec("10.0.1.0/24", true)])
            .expect("grow");
        assert_eq!(previous.len(), 1);
        assert!(mgr.is_allocated(&vn(), addr));
        assert_eq!(
            mgr.count(&vn(), &["10.0.0.0/24".to_string(), "10.0.1.0/24".to_string()]),
            vec![1, 0]
        );
        mgr.net_restore(&vn(), previous);
        assert_eq!(mgr.subnets(&vn()).len(), 1);
        assert!(mgr.is_allocated(&vn(), addr));
    }

    #[test]
    fn ipv6_subnets_allocate_from_start() {
        let mgr = AddressManager::new();
        mgr.net_create(&vn(), vec![spec("fd00::/64", false)]);
        let (addr, _) = mgr.alloc(&vn(), Some(Family::V6), None, None).expect("v6");
        assert_eq!(addr, IpAddr::from_str("fd00::1").expect("addr"));
        assert!(mgr.alloc(&vn(), Some(Family::V4), None, None).is_err());
    }
}
