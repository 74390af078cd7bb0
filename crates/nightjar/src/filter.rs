//! IP allow/deny filtering.
//!
//! Loads a list of IPv4 addresses from a text file at startup and answers
//! membership queries with a binary search over the sorted set. The set is
//! immutable once built, so it is shared across tasks without locking.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::ListMode;
use crate::error::{Error, Result};

/// Longest text form of an IPv4 address: `123.123.123.123`.
const MAX_ADDR_LEN: usize = 15;

/// Immutable address-membership gate applied at accept time.
#[derive(Debug)]
pub struct AddressFilter {
    mode: ListMode,
    /// Host-order addresses, sorted ascending.
    set: Vec<u32>,
}

impl AddressFilter {
    /// Build the filter from the configured list file.
    ///
    /// With filtering disabled the file is not touched. A configured mode
    /// with no list file at all is a configuration error, but a list file
    /// that simply does not exist downgrades to no filtering with a
    /// warning, so a freshly installed server starts without a list. Any
    /// malformed line fails the whole build; no partial list is kept.
    pub fn build(path: Option<&Path>, mode: ListMode) -> Result<AddressFilter> {
        if mode == ListMode::Disabled {
            info!("ip filtering is off");
            return Ok(AddressFilter {
                mode,
                set: Vec::new(),
            });
        }

        let path = path.ok_or(Error::ListMissing)?;

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("list file {} doesn't exist, assuming no filter", path.display());
                return Ok(AddressFilter {
                    mode: ListMode::Disabled,
                    set: Vec::new(),
                });
            }
            Err(e) => return Err(Error::Io(e)),
        };

        info!("loading list file {}", path.display());
        let set = parse_list(&contents)?;
        info!("{} addresses added to the list", set.len());

        Ok(AddressFilter { mode, set })
    }

    /// Whether a client at `addr` may upload.
    ///
    /// Non-IPv4 peers are never members of the set, so a whitelist denies
    /// them and a blacklist lets them through.
    pub fn allowed(&self, addr: IpAddr) -> bool {
        match self.mode {
            ListMode::Disabled => true,
            ListMode::Whitelist => self.contains(addr),
            ListMode::Blacklist => !self.contains(addr),
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        let IpAddr::V4(v4) = addr else {
            return false;
        };
        self.set.binary_search(&u32::from(v4)).is_ok()
    }
}

/// Parse one dotted-quad per line into sorted host-order addresses.
/// Blank lines are skipped. Line numbers in errors are 1-based.
fn parse_list(contents: &str) -> Result<Vec<u32>> {
    let mut set = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            continue;
        }

        let malformed = || Error::ListParse {
            line: idx + 1,
            token: line.to_string(),
        };

        if line.len() > MAX_ADDR_LEN || line.contains(char::is_whitespace) {
            return Err(malformed());
        }

        let addr: Ipv4Addr = line.parse().map_err(|_| malformed())?;
        debug!("adding address to list: {}", addr);
        set.push(u32::from(addr));
    }

    set.sort_unstable();
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(entries: &str, mode: ListMode) -> AddressFilter {
        AddressFilter {
            mode,
            set: parse_list(entries).unwrap(),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn disabled_mode_allows_everything() {
        let f = filter("10.0.0.1\n", ListMode::Disabled);
        assert!(f.allowed(ip("10.0.0.1")));
        assert!(f.allowed(ip("192.168.1.1")));
        assert!(f.allowed(ip("255.255.255.255")));
        assert!(f.allowed(ip("0.0.0.0")));
    }

    #[test]
    fn whitelist_allows_only_members() {
        let f = filter("10.0.0.5\n10.0.0.9\n172.16.0.1\n", ListMode::Whitelist);
        assert!(f.allowed(ip("10.0.0.5")));
        assert!(f.allowed(ip("10.0.0.9")));
        assert!(f.allowed(ip("172.16.0.1")));
        // one below and one above each member
        assert!(!f.allowed(ip("10.0.0.4")));
        assert!(!f.allowed(ip("10.0.0.6")));
        assert!(!f.allowed(ip("10.0.0.8")));
        assert!(!f.allowed(ip("10.0.0.10")));
        assert!(!f.allowed(ip("172.16.0.0")));
        assert!(!f.allowed(ip("172.16.0.2")));
    }

    #[test]
    fn blacklist_denies_only_members() {
        let f = filter("10.0.0.5\n172.16.0.1\n", ListMode::Blacklist);
        assert!(!f.allowed(ip("10.0.0.5")));
        assert!(!f.allowed(ip("172.16.0.1")));
        assert!(f.allowed(ip("10.0.0.4")));
        assert!(f.allowed(ip("10.0.0.6")));
        assert!(f.allowed(ip("8.8.8.8")));
    }

    #[test]
    fn boundary_members_are_found() {
        // smallest and largest possible addresses at the array edges
        let f = filter("0.0.0.0\n128.0.0.1\n255.255.255.255\n", ListMode::Whitelist);
        assert!(f.allowed(ip("0.0.0.0")));
        assert!(f.allowed(ip("255.255.255.255")));
        assert!(f.allowed(ip("128.0.0.1")));
        assert!(!f.allowed(ip("0.0.0.1")));
        assert!(!f.allowed(ip("255.255.255.254")));
    }

    #[test]
    fn empty_whitelist_denies_all() {
        let f = filter("", ListMode::Whitelist);
        assert!(!f.allowed(ip("1.2.3.4")));
        assert!(!f.allowed(ip("0.0.0.0")));
        assert!(!f.allowed(ip("255.255.255.255")));
    }

    #[test]
    fn empty_blacklist_allows_all() {
        let f = filter("", ListMode::Blacklist);
        assert!(f.allowed(ip("1.2.3.4")));
        assert!(f.allowed(ip("0.0.0.0")));
        assert!(f.allowed(ip("255.255.255.255")));
    }

    #[test]
    fn ipv6_peer_is_never_a_member() {
        let f = filter("10.0.0.5\n", ListMode::Whitelist);
        assert!(!f.allowed(ip("::1")));
        let f = filter("10.0.0.5\n", ListMode::Blacklist);
        assert!(f.allowed(ip("::1")));
    }

    #[test]
    fn parse_is_idempotent() {
        let contents = "10.0.0.9\n10.0.0.5\n172.16.0.1\n";
        let a = parse_list(contents).unwrap();
        let b = parse_list(contents).unwrap();
        assert_eq!(a, b);
        for probe in ["10.0.0.5", "10.0.0.9", "172.16.0.1", "10.0.0.6"] {
            let f1 = AddressFilter {
                mode: ListMode::Whitelist,
                set: a.clone(),
            };
            let f2 = AddressFilter {
                mode: ListMode::Whitelist,
                set: b.clone(),
            };
            assert_eq!(f1.allowed(ip(probe)), f2.allowed(ip(probe)));
        }
    }

    #[test]
    fn blank_lines_are_tolerated() {
        let set = parse_list("\n10.0.0.1\n\n\n10.0.0.2\n\n").unwrap();
        assert_eq!(set, vec![u32::from(Ipv4Addr::new(10, 0, 0, 1)),
                             u32::from(Ipv4Addr::new(10, 0, 0, 2))]);
    }

    #[test]
    fn malformed_lines_fail_the_build() {
        // each class of malformation independently fails, even when a valid
        // line comes before and after it
        let cases = [
            "10.0.0.1.\n",          // trailing dot
            "10.0.0.1.5\n",         // too many octets
            "10.0.0.256\n",         // octet out of range
            "10.0.0.1 10.0.0.2\n",  // two tokens on one line
            "not-an-address\n",
            "123.123.123.123.123\n", // overlong token
        ];

        for bad in cases {
            let contents = format!("10.0.0.1\n{}10.0.0.2\n", bad);
            let err = parse_list(&contents).unwrap_err();
            match err {
                Error::ListParse { line, .. } => assert_eq!(line, 2, "case {:?}", bad),
                other => panic!("expected ListParse for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn build_without_path_is_an_error_when_filtering() {
        let err = AddressFilter::build(None, ListMode::Whitelist).unwrap_err();
        assert!(matches!(err, Error::ListMissing));
    }

    #[test]
    fn build_with_missing_file_downgrades_to_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-list");
        let f = AddressFilter::build(Some(&path), ListMode::Whitelist).unwrap();
        // would deny everything as a whitelist; downgraded instead
        assert!(f.allowed(ip("1.2.3.4")));
    }

    #[test]
    fn build_reads_list_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist");
        std::fs::write(&path, "10.0.0.1\n10.0.0.2\n").unwrap();
        let f = AddressFilter::build(Some(&path), ListMode::Whitelist).unwrap();
        assert!(f.allowed(ip("10.0.0.1")));
        assert!(!f.allowed(ip("10.0.0.3")));
    }
}
