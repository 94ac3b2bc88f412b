//! Route sets announced during negotiation

use ipnetwork::IpNetwork;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator used both on the command line and on the wire
pub const ROUTE_SEPARATOR: char = ';';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },
}

/// Split a `;`-separated route list, dropping blank entries
pub fn split_route_list(list: &str) -> Vec<String> {
    list.split(ROUTE_SEPARATOR)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_cidr(cidr: &str) -> Result<IpNetwork, RouteError> {
    IpNetwork::from_str(cidr).map_err(|e| RouteError::InvalidCidr {
        cidr: cidr.to_string(),
        reason: e.to_string(),
    })
}

/// Reduce an address in CIDR form to the network it belongs to
///
/// `10.54.0.11/24` becomes `10.54.0.0/24`.
pub fn network_of(cidr: &str) -> Result<IpNetwork, RouteError> {
    let addr = parse_cidr(cidr)?;
    IpNetwork::new(addr.network(), addr.prefix()).map_err(|e| RouteError::InvalidCidr {
        cidr: cidr.to_string(),
        reason: e.to_string(),
    })
}

/// Ordered, duplicate-free list of networks one side wants the peer to route toward it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteSet {
    routes: Vec<IpNetwork>,
}

impl RouteSet {
    /// Build the set announced by a node with local address `laddr`
    ///
    /// The local network always comes first, followed by `extra` in order.
    /// Every entry is normalised to its network form.
    pub fn for_local_address(laddr: &str, extra: &str) -> Result<Self, RouteError> {
        let mut set = Self::default();
        set.push(network_of(laddr)?);
        for entry in split_route_list(extra) {
            set.push(network_of(&entry)?);
        }
        Ok(set)
    }

    /// Parse a received payload; entries are kept as announced
    pub fn decode(payload: &[u8]) -> Result<Self, RouteError> {
        let text = String::from_utf8_lossy(payload);
        let mut set = Self::default();
        for entry in split_route_list(&text) {
            set.push(parse_cidr(&entry)?);
        }
        Ok(set)
    }

    /// Wire form: entries joined with `;`
    pub fn encode(&self) -> String {
        self.routes
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }

    fn push(&mut self, net: IpNetwork) {
        if !self.routes.contains(&net) {
            self.routes.push(net);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNetwork> {
        self.routes.iter()
    }

    pub fn first(&self) -> Option<&IpNetwork> {
        self.routes.first()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Display for RouteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.encode())
    }
}

impl<'a> IntoIterator for &'a RouteSet {
    type Item = &'a IpNetwork;
    type IntoIter = std::slice::Iter<'a, IpNetwork>;

    fn into_iter(self) -> Self::IntoIter {
        self.routes.iter()
    }
}
