use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::error::{BarnOwlError, Result};

/// Operating system family a peer reports about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerPlatform {
    #[default]
    Unknown,
    Windows,
    Linux,
    MacOs,
    Unix,
}

impl ServerPlatform {
    /// Platform of the running process
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => ServerPlatform::Windows,
            "linux" => ServerPlatform::Linux,
            "macos" => ServerPlatform::MacOs,
            "freebsd" | "openbsd" | "netbsd" | "dragonfly" | "solaris" | "illumos" => {
                ServerPlatform::Unix
            }
            _ => ServerPlatform::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerPlatform::Unknown => "unknown",
            ServerPlatform::Windows => "windows",
            ServerPlatform::Linux => "linux",
            ServerPlatform::MacOs => "macos",
            ServerPlatform::Unix => "unix",
        }
    }
}

impl std::fmt::Display for ServerPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ServerPlatform {
    type Err = BarnOwlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(ServerPlatform::Unknown),
            "windows" => Ok(ServerPlatform::Windows),
            "linux" => Ok(ServerPlatform::Linux),
            "macos" => Ok(ServerPlatform::MacOs),
            "unix" => Ok(ServerPlatform::Unix),
            _ => Err(BarnOwlError::Parse(format!("unrecognized platform '{}'", s))),
        }
    }
}

/// An IPv4 or IPv6 network in CIDR notation, e.g. `192.168.1.0/24`
///
/// Used to decide whether a peer is reachable on its LAN address or must be
/// contacted through its public address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkRange {
    network: IpAddr,
    prefix_len: u8,
}

impl NetworkRange {
    /// Build a range from any address inside it; host bits are cleared.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(BarnOwlError::Network(format!(
                "prefix length {} exceeds {} for {}",
                prefix_len, max, addr
            )));
        }

        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & v4_mask(prefix_len)).into()),
            IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & v6_mask(prefix_len)).into()),
        };

        Ok(Self {
            network,
            prefix_len,
        })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `ip` belongs to this range. Addresses of the other family never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & v4_mask(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    }
}

impl std::fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl std::str::FromStr for NetworkRange {
    type Err = BarnOwlError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| BarnOwlError::Parse(format!("missing prefix length in '{}'", s)))?;

        let addr: IpAddr = addr
            .parse()
            .map_err(|e| {
                BarnOwlError::Parse(format!("invalid network address '{}': {}", addr, e))
            })?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|e| {
                BarnOwlError::Parse(format!("invalid prefix length '{}': {}", prefix, e))
            })?;

        NetworkRange::new(addr, prefix_len)
    }
}

impl TryFrom<String> for NetworkRange {
    type Error = BarnOwlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NetworkRange> for String {
    fn from(range: NetworkRange) -> Self {
        range.to_string()
    }
}

/// What a peer knows about a server: its own identity or a remote one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub local_ip: IpAddr,
    pub public_ip: Option<IpAddr>,
    /// Address actually used to reach this server from the local peer
    pub session_ip: IpAddr,
    pub port: u16,
    pub platform: ServerPlatform,
    /// Folder files are received into, as a path on that server's machine
    pub transfer_folder: String,
}

impl ServerInfo {
    /// Minimal description of a peer known only by its endpoint
    pub fn from_endpoint(addr: SocketAddr) -> Self {
        Self {
            name: String::new(),
            local_ip: addr.ip(),
            public_ip: None,
            session_ip: addr.ip(),
            port: addr.port(),
            platform: ServerPlatform::Unknown,
            transfer_folder: String::new(),
        }
    }

    pub fn session_address(&self) -> SocketAddr {
        SocketAddr::new(self.session_ip, self.port)
    }

    /// Pick the session address for a remote server as seen from a peer whose
    /// LAN is `local_range`: the remote's local address when it shares that
    /// LAN, otherwise its public address.
    pub fn select_session_ip(&mut self, local_range: Option<&NetworkRange>) {
        let same_lan = local_range.is_some_and(|range| range.contains(self.local_ip));
        self.session_ip = match (same_lan, self.public_ip) {
            (false, Some(public)) => public,
            _ => self.local_ip,
        };
    }

    /// Whether `addr` names this server on any of its known addresses.
    pub fn matches_endpoint(&self, addr: SocketAddr) -> bool {
        addr.port() == self.port
            && (addr.ip() == self.local_ip
                || addr.ip() == self.session_ip
                || Some(addr.ip()) == self.public_ip)
    }
}

/// A file offered by a peer for download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Final path component, accepting either separator since the path
    /// comes from a machine that may use the other convention.
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.path.as_str())
    }
}

/// Ordered listing of files in a remote folder
///
/// Travels on the wire as `path<field>size<record>path<field>size...`.
/// Separator characters are not escaped, so a path containing either one
/// does not survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoList {
    files: Vec<FileInfo>,
}

impl FileInfoList {
    pub fn new(files: Vec<FileInfo>) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn push(&mut self, file: FileInfo) {
        self.files.push(file);
    }

    pub fn encode(&self, field_separator: char, record_separator: char) -> String {
        let mut out = String::new();
        for (i, file) in self.files.iter().enumerate() {
            if i > 0 {
                out.push(record_separator);
            }
            out.push_str(&file.path);
            out.push(field_separator);
            out.push_str(&file.size.to_string());
        }
        out
    }

    pub fn decode(encoded: &str, field_separator: char, record_separator: char) -> Result<Self> {
        let mut files = Vec::new();
        for record in encoded.split(record_separator).filter(|r| !r.is_empty()) {
            let (path, size) = record.rsplit_once(field_separator).ok_or_else(|| {
                BarnOwlError::Parse(format!("file list record without size: '{}'", record))
            })?;
            let size = size.parse::<u64>().map_err(|e| {
                BarnOwlError::Parse(format!("invalid file size '{}' for {}: {}", size, path, e))
            })?;
            files.push(FileInfo::new(path, size));
        }
        Ok(Self { files })
    }
}

impl IntoIterator for FileInfoList {
    type Item = FileInfo;
    type IntoIter = std::vec::IntoIter<FileInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_network_range_contains() {
        let range: NetworkRange = "192.168.1.17/24".parse().unwrap();
        assert_eq!(range.network(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)));
        assert!(range.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 200))));
        assert!(!range.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 2, 1))));
        assert!(!range.contains(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_network_range_edges() {
        let all: NetworkRange = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));

        let host: NetworkRange = "10.0.0.5/32".parse().unwrap();
        assert!(host.contains(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
        assert!(!host.contains(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6))));

        let v6: NetworkRange = "fd00::1/64".parse().unwrap();
        assert!(v6.contains("fd00::abcd".parse().unwrap()));
        assert!(!v6.contains("fd01::1".parse().unwrap()));
    }

    #[test]
    fn test_network_range_rejects_bad_input() {
        assert!("192.168.1.0".parse::<NetworkRange>().is_err());
        assert!("192.168.1.0/33".parse::<NetworkRange>().is_err());
        assert!("not-an-ip/8".parse::<NetworkRange>().is_err());
    }

    #[test]
    fn test_network_range_serde_as_string() {
        let range: NetworkRange = "172.16.0.0/12".parse().unwrap();
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "\"172.16.0.0/12\"");
        let back: NetworkRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
    }

    #[test]
    fn test_select_session_ip() {
        let mut info = ServerInfo::from_endpoint("192.168.1.20:9000".parse().unwrap());
        info.public_ip = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));

        let lan: NetworkRange = "192.168.1.0/24".parse().unwrap();
        info.select_session_ip(Some(&lan));
        assert_eq!(info.session_ip, info.local_ip);

        let other: NetworkRange = "10.0.0.0/8".parse().unwrap();
        info.select_session_ip(Some(&other));
        assert_eq!(info.session_ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));

        info.public_ip = None;
        info.select_session_ip(Some(&other));
        assert_eq!(info.session_ip, info.local_ip);
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("Linux".parse::<ServerPlatform>().unwrap(), ServerPlatform::Linux);
        assert_eq!("unknown".parse::<ServerPlatform>().unwrap(), ServerPlatform::Unknown);
        assert!(matches!(
            "plan9".parse::<ServerPlatform>(),
            Err(BarnOwlError::Parse(_))
        ));
        assert_eq!(ServerPlatform::MacOs.to_string(), "macos");
    }

    #[test]
    fn test_file_info_list_encoding() {
        let list = FileInfoList::new(vec![
            FileInfo::new("/srv/share/a.txt", 12),
            FileInfo::new("/srv/share/b.bin", 1_048_576),
        ]);
        let encoded = list.encode('*', '|');
        assert_eq!(encoded, "/srv/share/a.txt*12|/srv/share/b.bin*1048576");

        let decoded = FileInfoList::decode(&encoded, '*', '|').unwrap();
        assert_eq!(decoded, list);
        assert_eq!(decoded.total_size(), 1_048_588);
        assert_eq!(decoded.files()[1].file_name(), "b.bin");
    }

    #[test]
    fn test_file_info_list_separator_in_path_corrupts() {
        let list = FileInfoList::new(vec![FileInfo::new("odd|name.txt", 3)]);
        let encoded = list.encode('*', '|');
        assert!(FileInfoList::decode(&encoded, '*', '|').is_err());
    }

    #[test]
    fn test_file_name_handles_windows_paths() {
        let file = FileInfo::new(r"C:\Users\share\report.pdf", 10);
        assert_eq!(file.file_name(), "report.pdf");
    }
}
