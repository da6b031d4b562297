use crate::utils::constants::{
    BRIDGE_PREFIX, BRIDGE_SLUG_LEN, DHCP_RANGE_END_HOST, DHCP_RANGE_START_HOST, MAX_PREFIX_LEN,
    MIN_PREFIX_LEN, POOL_MAX_OCTET, POOL_MIN_OCTET, POOL_PREFIX,
};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubnetError {
    #[error("invalid subnet: {0}")]
    Invalid(String),

    #[error("subnet {subnet} overlaps reserved range {reserved}")]
    Reserved { subnet: String, reserved: String },

    #[error("subnet {subnet} overlaps {other_subnet} of department {other_tenant}")]
    Overlap {
        subnet: String,
        other_tenant: String,
        other_subnet: String,
    },

    #[error("no free 10.10.X.0/24 block left")]
    Exhausted,

    #[error("bridge name {bridge} is already used by department {other_tenant}")]
    BridgeNameCollision { bridge: String, other_tenant: String },
}

/// Ranges no department may use
pub const RESERVED_RANGES: &[(&str, [u8; 4], u8)] = &[
    ("0.0.0.0/8", [0, 0, 0, 0], 8),
    ("127.0.0.0/8", [127, 0, 0, 0], 8),
    ("169.254.0.0/16", [169, 254, 0, 0], 16),
    ("224.0.0.0/4", [224, 0, 0, 0], 4),
    ("240.0.0.0/4", [240, 0, 0, 0], 4),
    ("255.255.255.255/32", [255, 255, 255, 255], 32),
];

/// Addresses derived from a department subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetPlan {
    /// Canonical `a.b.c.d/len`
    pub subnet: String,
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
    pub bridge_name: String,
}

impl SubnetPlan {
    /// Inclusive (network, broadcast) as integers
    pub fn span(&self) -> (u32, u32) {
        (u32::from(self.network), u32::from(self.broadcast))
    }

    /// Keep a previously stored bridge name instead of the derived one
    pub fn with_bridge_name(mut self, bridge: &str) -> Self {
        self.bridge_name = bridge.to_string();
        self
    }
}

/// Another department's claim on address space and a bridge name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkClaim {
    pub tenant_id: String,
    pub subnet: String,
    pub bridge_name: Option<String>,
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        (!0u32) << (32 - prefix_len)
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), SubnetError> {
    let (ip, len) = cidr
        .trim()
        .split_once('/')
        .ok_or_else(|| SubnetError::Invalid(format!("'{}' is not in CIDR form", cidr)))?;
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| SubnetError::Invalid(format!("malformed address in '{}'", cidr)))?;
    let prefix_len: u8 = len
        .parse()
        .map_err(|_| SubnetError::Invalid(format!("malformed prefix length in '{}'", cidr)))?;
    Ok((ip, prefix_len))
}

/// Inclusive (network, broadcast) of any CIDR string
pub fn cidr_span(cidr: &str) -> Result<(u32, u32), SubnetError> {
    let (ip, prefix_len) = parse_cidr(cidr)?;
    if prefix_len > 32 {
        return Err(SubnetError::Invalid(format!("prefix /{} out of range", prefix_len)));
    }
    let mask = prefix_mask(prefix_len);
    let network = u32::from(ip) & mask;
    Ok((network, network | !mask))
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

/// `dept-` plus the first six alphanumerics of the tenant id, lowercased
pub fn bridge_name_for(tenant_id: &str) -> Result<String, SubnetError> {
    let slug: String = tenant_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(BRIDGE_SLUG_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if slug.is_empty() {
        return Err(SubnetError::Invalid(format!(
            "tenant id '{}' has no characters usable in a bridge name",
            tenant_id
        )));
    }
    Ok(format!("{}{}", BRIDGE_PREFIX, slug))
}

/// Parse a CIDR and derive gateway, DHCP pool and bridge name.
///
/// The address must be the network base. The pool is host `.10` to `.254`
/// of the block, clamped to the last usable host on blocks smaller than /24
/// and never starting at or below the gateway.
pub fn parse_subnet(subnet: &str, tenant_id: &str) -> Result<SubnetPlan, SubnetError> {
    let (ip, prefix_len) = parse_cidr(subnet)?;
    if !(MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&prefix_len) {
        return Err(SubnetError::Invalid(format!(
            "prefix /{} outside /{}../{}",
            prefix_len, MIN_PREFIX_LEN, MAX_PREFIX_LEN
        )));
    }

    let mask = prefix_mask(prefix_len);
    let base = u32::from(ip);
    if base & mask != base {
        return Err(SubnetError::Invalid(format!(
            "{} is not a network base address (expected {}/{})",
            subnet,
            Ipv4Addr::from(base & mask),
            prefix_len
        )));
    }

    let broadcast = base | !mask;
    let gateway = base + 1;
    let last_host = broadcast - 1;
    let dhcp_end = base.saturating_add(DHCP_RANGE_END_HOST).min(last_host);
    let dhcp_start = base
        .saturating_add(DHCP_RANGE_START_HOST)
        .min(dhcp_end)
        .max(gateway + 1);

    Ok(SubnetPlan {
        subnet: format!("{}/{}", ip, prefix_len),
        network: ip,
        prefix_len,
        netmask: Ipv4Addr::from(mask),
        broadcast: Ipv4Addr::from(broadcast),
        gateway: Ipv4Addr::from(gateway),
        dhcp_start: Ipv4Addr::from(dhcp_start),
        dhcp_end: Ipv4Addr::from(dhcp_end),
        bridge_name: bridge_name_for(tenant_id)?,
    })
}

/// Reject reserved ranges, overlaps with other departments and bridge-name clashes
pub fn validate(
    plan: &SubnetPlan,
    tenant_id: &str,
    claims: &[NetworkClaim],
) -> Result<(), SubnetError> {
    let span = plan.span();

    for (name, octets, len) in RESERVED_RANGES {
        let mask = prefix_mask(*len);
        let net = u32::from(Ipv4Addr::from(*octets));
        if overlaps(span, (net, net | !mask)) {
            return Err(SubnetError::Reserved {
                subnet: plan.subnet.clone(),
                reserved: name.to_string(),
            });
        }
    }

    for claim in claims.iter().filter(|c| c.tenant_id != tenant_id) {
        match cidr_span(&claim.subnet) {
            Ok(other) if overlaps(span, other) => {
                return Err(SubnetError::Overlap {
                    subnet: plan.subnet.clone(),
                    other_tenant: claim.tenant_id.clone(),
                    other_subnet: claim.subnet.clone(),
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Ignoring unparsable stored subnet {}: {}", claim.subnet, e),
        }

        if claim.bridge_name.as_deref() == Some(plan.bridge_name.as_str()) {
            return Err(SubnetError::BridgeNameCollision {
                bridge: plan.bridge_name.clone(),
                other_tenant: claim.tenant_id.clone(),
            });
        }
    }

    Ok(())
}

/// Lowest free `10.10.X.0/24` given the subnets already in use
pub fn allocate(existing: &[String]) -> Result<String, SubnetError> {
    let mut used: HashSet<u8> = HashSet::new();
    let mut spans = Vec::new();
    for subnet in existing {
        if let Some(octet) = pool_octet(subnet) {
            used.insert(octet);
        }
        if let Ok(span) = cidr_span(subnet) {
            spans.push(span);
        }
    }

    for octet in POOL_MIN_OCTET..=POOL_MAX_OCTET {
        if used.contains(&octet) {
            continue;
        }
        let candidate = format!("{}.{}.{}.0/24", POOL_PREFIX[0], POOL_PREFIX[1], octet);
        let span = cidr_span(&candidate)?;
        // Custom subnets can cover pool blocks without matching the pattern
        if spans.iter().any(|other| overlaps(span, *other)) {
            continue;
        }
        return Ok(candidate);
    }

    Err(SubnetError::Exhausted)
}

/// Third octet of a `10.10.X.0/24` subnet, if it has that shape
fn pool_octet(subnet: &str) -> Option<u8> {
    let (ip, len) = parse_cidr(subnet).ok()?;
    let [a, b, x, d] = ip.octets();
    if [a, b] == POOL_PREFIX && d == 0 && len == 24 {
        Some(x)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(tenant: &str, subnet: &str, bridge: Option<&str>) -> NetworkClaim {
        NetworkClaim {
            tenant_id: tenant.to_string(),
            subnet: subnet.to_string(),
            bridge_name: bridge.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_gateway_and_range_for_every_mask() {
        for prefix in 8u8..=30 {
            let mask = prefix_mask(prefix);
            // A base that is aligned for every prefix length
            let base = u32::from(Ipv4Addr::new(10, 0, 0, 0)) & mask;
            let cidr = format!("{}/{}", Ipv4Addr::from(base), prefix);
            let plan = parse_subnet(&cidr, "acme-42").unwrap();

            assert_eq!(u32::from(plan.gateway), base + 1, "{}", cidr);
            let (net, bcast) = plan.span();
            let start = u32::from(plan.dhcp_start);
            let end = u32::from(plan.dhcp_end);
            assert!(net < start && start <= end && end < bcast, "{}", cidr);
            assert!(start > u32::from(plan.gateway), "{}", cidr);
            if prefix <= 24 {
                assert_eq!(start, base + 10, "{}", cidr);
                assert_eq!(end, base + 254, "{}", cidr);
            }
        }
    }

    #[test]
    fn test_parse_slash24() {
        let plan = parse_subnet("10.10.5.0/24", "Acme-Corp").unwrap();
        assert_eq!(plan.gateway, Ipv4Addr::new(10, 10, 5, 1));
        assert_eq!(plan.dhcp_start, Ipv4Addr::new(10, 10, 5, 10));
        assert_eq!(plan.dhcp_end, Ipv4Addr::new(10, 10, 5, 254));
        assert_eq!(plan.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(plan.broadcast, Ipv4Addr::new(10, 10, 5, 255));
        assert_eq!(plan.bridge_name, "dept-acmeco");
    }

    #[test]
    fn test_parse_small_blocks_are_clamped() {
        let plan = parse_subnet("192.168.4.16/28", "t1").unwrap();
        assert_eq!(plan.dhcp_start, Ipv4Addr::new(192, 168, 4, 26));
        assert_eq!(plan.dhcp_end, Ipv4Addr::new(192, 168, 4, 30));

        let plan = parse_subnet("192.168.4.8/30", "t1").unwrap();
        assert_eq!(plan.gateway, Ipv4Addr::new(192, 168, 4, 9));
        assert_eq!(plan.dhcp_start, Ipv4Addr::new(192, 168, 4, 10));
        assert_eq!(plan.dhcp_end, Ipv4Addr::new(192, 168, 4, 10));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in [
            "10.10.5.0",
            "10.10.5.0/7",
            "10.10.5.0/31",
            "10.10.5.0/abc",
            "10.10.300.0/24",
            "10.10.5/24",
            "10.10.5.7/24",
            "",
        ] {
            assert!(
                matches!(parse_subnet(bad, "t1"), Err(SubnetError::Invalid(_))),
                "{} should be rejected",
                bad
            );
        }
        assert!(parse_subnet("10.10.5.0/24", "--").is_err());
    }

    #[test]
    fn test_bridge_name_fits_ifname() {
        let name = bridge_name_for("0f8e2c9a-77aa-4d2e-9c1b-123456789abc").unwrap();
        assert_eq!(name, "dept-0f8e2c");
        assert!(name.len() <= 15);
        assert_eq!(bridge_name_for("ab").unwrap(), "dept-ab");
    }

    #[test]
    fn test_validate_rejects_reserved_ranges() {
        let reserved_blocks = [
            "127.0.0.0/8",
            "169.254.0.0/16",
            "224.0.0.0/8",
            "240.0.0.0/8",
            "0.0.0.0/8",
        ];
        for reserved in reserved_blocks {
            let plan = parse_subnet(reserved, "t1").unwrap();
            assert!(
                matches!(validate(&plan, "t1", &[]), Err(SubnetError::Reserved { .. })),
                "{}",
                reserved
            );
        }
    }

    #[test]
    fn test_validate_rejects_overlap_with_other_tenants() {
        let claims = vec![claim("other", "10.10.0.0/16", Some("dept-other0"))];

        let plan = parse_subnet("10.10.7.0/24", "mine").unwrap();
        assert!(matches!(
            validate(&plan, "mine", &claims),
            Err(SubnetError::Overlap { .. })
        ));

        let plan = parse_subnet("10.11.0.0/24", "mine").unwrap();
        assert!(validate(&plan, "mine", &claims).is_ok());

        // A tenant never conflicts with its own record
        let plan = parse_subnet("10.10.7.0/24", "other").unwrap();
        assert!(validate(&plan, "other", &claims).is_ok());
    }

    #[test]
    fn test_validate_flags_bridge_name_collision() {
        let claims = vec![claim("acme-east", "10.10.1.0/24", Some("dept-acmeea"))];
        let plan = parse_subnet("10.10.2.0/24", "acme-east-2").unwrap();
        assert_eq!(
            validate(&plan, "acme-east-2", &claims),
            Err(SubnetError::BridgeNameCollision {
                bridge: "dept-acmeea".to_string(),
                other_tenant: "acme-east".to_string(),
            })
        );
    }

    #[test]
    fn test_allocate_ascending_with_gap_reuse() {
        let mut taken = Vec::new();
        for expected in 1..=5 {
            let subnet = allocate(&taken).unwrap();
            assert_eq!(subnet, format!("10.10.{}.0/24", expected));
            taken.push(subnet);
        }

        taken.retain(|s| s != "10.10.3.0/24");
        assert_eq!(allocate(&taken).unwrap(), "10.10.3.0/24");
    }

    #[test]
    fn test_allocate_skips_custom_overlaps_and_exhausts() {
        let taken = vec!["10.10.0.0/23".to_string()];
        assert_eq!(allocate(&taken).unwrap(), "10.10.2.0/24");

        let all: Vec<String> = (1..=254).map(|x| format!("10.10.{}.0/24", x)).collect();
        assert_eq!(allocate(&all), Err(SubnetError::Exhausted));
    }
}
