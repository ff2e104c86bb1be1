//! NVMe-oF transport identifier.
//!
//! Identifies the remote RDMA endpoint and subsystem a queue pair connects to.

use std::fmt;

use crate::error::{Error, Result};

/// Longest transport address accepted (TRADDR field width minus terminator).
const MAX_ADDRESS_LEN: usize = 255;

/// Longest service id accepted (TRSVCID field width minus terminator).
const MAX_SERVICE_ID_LEN: usize = 31;

/// Longest subsystem NQN accepted.
const MAX_SUBNQN_LEN: usize = 223;

/// Well-known NVMe-oF port.
pub const DEFAULT_SERVICE_ID: &str = "4420";

/// Address family of the transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// IPv4
    #[default]
    Ipv4,
    /// IPv6
    Ipv6,
}

impl AddressFamily {
    fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("ipv4") {
            Some(AddressFamily::Ipv4)
        } else if s.eq_ignore_ascii_case("ipv6") {
            Some(AddressFamily::Ipv6)
        } else {
            None
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// RDMA transport identifier.
///
/// # Example
///
/// ```
/// use nvmf_rdma::nvmf::TransportId;
///
/// let trid = TransportId::rdma("192.168.1.100", "4420", "nqn.2024-01.io.spdk:cnode1")?;
/// assert_eq!(trid.service_id(), "4420");
///
/// let parsed = TransportId::parse(
///     "trtype:RDMA adrfam:IPv4 traddr:192.168.1.100 trsvcid:4420 subnqn:nqn.2024-01.io.spdk:cnode1",
/// )?;
/// assert_eq!(parsed, trid);
/// # Ok::<(), nvmf_rdma::Error>(())
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct TransportId {
    adrfam: AddressFamily,
    traddr: String,
    trsvcid: String,
    subnqn: String,
}

impl TransportId {
    /// Create an RDMA transport ID.
    ///
    /// The address family is inferred from `addr` (a `:` means IPv6).
    ///
    /// # Arguments
    ///
    /// * `addr` - IP address
    /// * `port` - Service port (typically "4420")
    /// * `subnqn` - Subsystem NQN
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a field is empty or too long.
    pub fn rdma(addr: &str, port: &str, subnqn: &str) -> Result<Self> {
        let adrfam = if addr.contains(':') {
            AddressFamily::Ipv6
        } else {
            AddressFamily::Ipv4
        };
        Self::build(adrfam, addr, port, subnqn)
    }

    /// Parse from string.
    ///
    /// Format: `trtype:RDMA adrfam:IPv4 traddr:10.0.0.1 trsvcid:4420 subnqn:nqn.test`.
    /// Keys are case-insensitive; `adrfam` and `trsvcid` are optional.
    pub fn parse(s: &str) -> Result<Self> {
        let mut trtype = None;
        let mut adrfam = None;
        let mut traddr = None;
        let mut trsvcid = None;
        let mut subnqn = None;

        for token in s.split_whitespace() {
            let (key, value) = token.split_once(':').ok_or_else(|| {
                Error::InvalidArgument(format!("Malformed transport ID entry: {}", token))
            })?;
            match key.to_ascii_lowercase().as_str() {
                "trtype" => trtype = Some(value),
                "adrfam" => {
                    adrfam = Some(AddressFamily::parse(value).ok_or_else(|| {
                        Error::InvalidArgument(format!("Unknown address family: {}", value))
                    })?)
                }
                "traddr" => traddr = Some(value),
                "trsvcid" => trsvcid = Some(value),
                "subnqn" => subnqn = Some(value),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "Unknown transport ID key: {}",
                        key
                    )));
                }
            }
        }

        match trtype {
            Some(t) if t.eq_ignore_ascii_case("rdma") => {}
            Some(t) => {
                return Err(Error::InvalidArgument(format!(
                    "Unsupported transport type: {}",
                    t
                )));
            }
            None => return Err(Error::InvalidArgument("Missing trtype".to_string())),
        }

        let traddr = traddr.ok_or_else(|| Error::InvalidArgument("Missing traddr".to_string()))?;
        let subnqn = subnqn.ok_or_else(|| Error::InvalidArgument("Missing subnqn".to_string()))?;

        match adrfam {
            Some(adrfam) => Self::build(
                adrfam,
                traddr,
                trsvcid.unwrap_or(DEFAULT_SERVICE_ID),
                subnqn,
            ),
            None => Self::rdma(traddr, trsvcid.unwrap_or(DEFAULT_SERVICE_ID), subnqn),
        }
    }

    fn build(adrfam: AddressFamily, addr: &str, port: &str, subnqn: &str) -> Result<Self> {
        check_field(addr, MAX_ADDRESS_LEN, "address")?;
        check_field(port, MAX_SERVICE_ID_LEN, "port")?;
        check_field(subnqn, MAX_SUBNQN_LEN, "subnqn")?;

        Ok(Self {
            adrfam,
            traddr: addr.to_string(),
            trsvcid: port.to_string(),
            subnqn: subnqn.to_string(),
        })
    }

    /// Get the address family.
    pub fn address_family(&self) -> AddressFamily {
        self.adrfam
    }

    /// Get the address.
    pub fn address(&self) -> &str {
        &self.traddr
    }

    /// Get the service ID (port).
    pub fn service_id(&self) -> &str {
        &self.trsvcid
    }

    /// Get the subsystem NQN.
    pub fn subnqn(&self) -> &str {
        &self.subnqn
    }
}

fn check_field(value: &str, max_len: usize, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{} must not be empty", name)));
    }
    if value.len() > max_len {
        return Err(Error::InvalidArgument(format!(
            "{} too long: {} (max {})",
            name,
            value.len(),
            max_len
        )));
    }
    Ok(())
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trtype:RDMA adrfam:{} traddr:{} trsvcid:{} subnqn:{}",
            self.adrfam, self.traddr, self.trsvcid, self.subnqn
        )
    }
}

impl fmt::Debug for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportId")
            .field("trtype", &"RDMA")
            .field("adrfam", &self.adrfam)
            .field("traddr", &self.address())
            .field("trsvcid", &self.service_id())
            .field("subnqn", &self.subnqn())
            .finish()
    }
}

impl std::str::FromStr for TransportId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
