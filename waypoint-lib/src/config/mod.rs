mod matcher;

pub use matcher::Matcher;

use crate::{constants::DEFAULT_FLOW_TIMEOUT_SECS, error::ConfigurationError, trace::*};
use serde::{Deserialize, Serialize};
use std::{
  net::{IpAddr, Ipv4Addr, SocketAddr},
  str::FromStr,
  time::Duration,
};
use url::Url;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Top-level configuration: core services plus the list of routing entries
pub struct Config {
  #[serde(default, skip_serializing_if = "CoreConfig::is_empty")]
  pub core: CoreConfig,
  #[serde(default)]
  pub entrypoints: Vec<EntryPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Core service blocks. Accepted for compatibility and ignored: the embedded
/// outbound engine and the fake-DNS responder are not bundled in this build.
pub struct CoreConfig {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub singbox: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fake_dns: Option<serde_json::Value>,
}

impl CoreConfig {
  fn is_empty(&self) -> bool {
    self.singbox.is_none() && self.fake_dns.is_none()
  }

  /// Warn about configured core services this build does not carry
  pub fn warn_ignored(&self) {
    if self.singbox.is_some() {
      warn!("core.singbox is configured but the embedded outbound engine is not bundled; the block is ignored");
    }
    if self.fake_dns.is_some() {
      warn!("core.fake_dns is configured but the fake-DNS responder is not bundled; the block is ignored");
    }
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Routing mode of an entry. The set is closed: routers dispatch by exhaustive match.
pub enum RoutingKind {
  /// Forward every TCP flow to a fixed target
  TcpRaw,
  /// Forward datagrams per client through a session table
  UdpRaw,
  /// Route by the SNI of the first TLS ClientHello
  Sni,
  /// Route by the HTTP Host header, CONNECT or reverse request
  HttpHeader,
}

impl std::fmt::Display for RoutingKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::TcpRaw => "tcp-raw",
      Self::UdpRaw => "udp-raw",
      Self::Sni => "sni",
      Self::HttpHeader => "http-header",
    };
    write!(f, "{s}")
  }
}

impl FromStr for RoutingKind {
  type Err = ConfigurationError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tcp-raw" => Ok(Self::TcpRaw),
      "udp-raw" => Ok(Self::UdpRaw),
      "sni" => Ok(Self::Sni),
      "http-header" => Ok(Self::HttpHeader),
      other => Err(ConfigurationError::InvalidShorthand {
        value: format!("unknown routing mode: {other}"),
      }),
    }
  }
}

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, PartialEq, Eq)]
/// One routing rule: a listener plus target derivation, matchers and the outbound chain
pub struct EntryPoint {
  pub routing: RoutingKind,
  pub listen: SocketAddr,
  /// Destination hint; interpretation depends on the routing mode
  pub target: String,
  /// Ordered outbound hops, dialed innermost first
  pub proxy: Vec<Url>,
  pub block_list: Vec<Matcher>,
  pub allow_list: Vec<Matcher>,
  pub timeout: Option<Duration>,
  /// Group key for sharing one listener across entries
  pub tag: Option<String>,
  pub features: Vec<String>,
}

/// The `flexible-port` feature lets a client `Junction-Port` header override the target port
pub(crate) const FEATURE_FLEXIBLE_PORT: &str = "flexible-port";

impl EntryPoint {
  /// Per-flow timeout: the entry's own, else `TIMEOUT` from the environment, else 24h
  pub fn flow_timeout(&self) -> Duration {
    self.timeout.unwrap_or_else(|| {
      std::env::var("TIMEOUT")
        .ok()
        .and_then(|v| parse_duration(&v).ok())
        .unwrap_or(Duration::from_secs(DEFAULT_FLOW_TIMEOUT_SECS))
    })
  }

  /// Idle timeout for UDP sessions: the entry's own, else 5 minutes
  pub fn udp_idle_timeout(&self) -> Duration {
    match self.timeout {
      Some(t) if !t.is_zero() => t,
      _ => Duration::from_secs(crate::constants::UDP_SESSION_IDLE_TIMEOUT_SECS),
    }
  }

  /// The configured target, or the given default when empty
  pub fn target_or(&self, default: &str) -> String {
    if self.target.is_empty() {
      default.to_string()
    } else {
      self.target.clone()
    }
  }

  /// Allow/block decision for a name:
  /// a non-empty block list denies on any match; otherwise a non-empty allow
  /// list admits only on some match; otherwise the name is admitted.
  pub fn allowed(&self, name: &str) -> bool {
    if self.block_list.iter().any(|m| m.matches(name)) {
      return false;
    }
    if !self.allow_list.is_empty() {
      return self.allow_list.iter().any(|m| m.matches(name));
    }
    true
  }

  pub fn has_feature(&self, feature: &str) -> bool {
    self.features.iter().any(|f| f == feature)
  }
}

/* ---------------------------------------------------------- */
// Wire representation: an entry is either a table or a shorthand string
// `routing;listen;to;proxy1,proxy2;timeout`.

#[derive(Deserialize)]
#[serde(untagged)]
enum EntryPointRepr {
  Shorthand(String),
  Table(EntryPointTable),
}

#[derive(Deserialize)]
struct EntryPointTable {
  routing: RoutingKind,
  listen: ListenRepr,
  #[serde(default, alias = "target")]
  to: String,
  #[serde(default)]
  proxy: Vec<String>,
  #[serde(default)]
  block_list: Vec<Matcher>,
  #[serde(default)]
  allow_list: Vec<Matcher>,
  #[serde(default)]
  timeout: Option<TimeoutRepr>,
  #[serde(default)]
  tag: Option<String>,
  #[serde(default)]
  features: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListenRepr {
  Port(u16),
  Addr(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimeoutRepr {
  Secs(u64),
  Human(String),
}

impl TryFrom<EntryPointRepr> for EntryPoint {
  type Error = ConfigurationError;
  fn try_from(repr: EntryPointRepr) -> Result<Self, Self::Error> {
    match repr {
      EntryPointRepr::Shorthand(s) => s.parse(),
      EntryPointRepr::Table(t) => t.try_into(),
    }
  }
}

impl TryFrom<EntryPointTable> for EntryPoint {
  type Error = ConfigurationError;
  fn try_from(t: EntryPointTable) -> Result<Self, Self::Error> {
    let listen = match t.listen {
      ListenRepr::Port(port) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
      ListenRepr::Addr(s) => parse_listen_addr(&s)?,
    };
    let timeout = match t.timeout {
      None => None,
      Some(TimeoutRepr::Secs(secs)) => Some(Duration::from_secs(secs)),
      Some(TimeoutRepr::Human(s)) => Some(parse_duration(&s)?),
    };
    let proxy = t
      .proxy
      .iter()
      .map(|p| parse_proxy_url(p))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(EntryPoint {
      routing: t.routing,
      listen,
      target: t.to,
      proxy,
      block_list: t.block_list,
      allow_list: t.allow_list,
      timeout,
      tag: t.tag,
      features: t.features,
    })
  }
}

impl<'de> Deserialize<'de> for EntryPoint {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let repr = EntryPointRepr::deserialize(deserializer)?;
    EntryPoint::try_from(repr).map_err(serde::de::Error::custom)
  }
}

impl Serialize for EntryPoint {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Table<'a> {
      routing: RoutingKind,
      listen: String,
      #[serde(skip_serializing_if = "str::is_empty")]
      to: &'a str,
      #[serde(skip_serializing_if = "Vec::is_empty")]
      proxy: Vec<&'a str>,
      #[serde(skip_serializing_if = "Vec::is_empty")]
      block_list: Vec<&'a str>,
      #[serde(skip_serializing_if = "Vec::is_empty")]
      allow_list: Vec<&'a str>,
      #[serde(skip_serializing_if = "Option::is_none")]
      timeout: Option<String>,
      #[serde(skip_serializing_if = "Option::is_none")]
      tag: Option<&'a str>,
      #[serde(skip_serializing_if = "Vec::is_empty")]
      features: Vec<&'a str>,
    }
    Table {
      routing: self.routing,
      listen: self.listen.to_string(),
      to: &self.target,
      proxy: self.proxy.iter().map(Url::as_str).collect(),
      block_list: self.block_list.iter().map(Matcher::pattern).collect(),
      allow_list: self.allow_list.iter().map(Matcher::pattern).collect(),
      timeout: self.timeout.map(|t| format!("{}s", t.as_secs())),
      tag: self.tag.as_deref(),
      features: self.features.iter().map(String::as_str).collect(),
    }
    .serialize(serializer)
  }
}

impl FromStr for EntryPoint {
  type Err = ConfigurationError;
  /// Decode the shorthand form `routing;listen;to;proxy1,proxy2;timeout`.
  /// Trailing sections may be omitted; the proxy list separator defaults to `,`
  /// and can be changed with the `SLICE_SEPARATOR` environment variable.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts = s.split(';').collect::<Vec<_>>();
    if parts.len() > 5 {
      return Err(ConfigurationError::InvalidShorthand { value: s.to_string() });
    }

    let routing = parts
      .first()
      .copied()
      .unwrap_or_default()
      .parse::<RoutingKind>()?;
    let listen = parse_listen_addr(parts.get(1).copied().unwrap_or_default())?;
    let target = parts.get(2).copied().unwrap_or_default().to_string();

    let separator = std::env::var("SLICE_SEPARATOR").unwrap_or_else(|_| ",".to_string());
    let proxy = match parts.get(3) {
      Some(list) if !list.is_empty() => list
        .split(separator.as_str())
        .filter(|p| !p.is_empty())
        .map(parse_proxy_url)
        .collect::<Result<Vec<_>, _>>()?,
      _ => Vec::new(),
    };

    let timeout = match parts.get(4) {
      Some(t) if !t.is_empty() => Some(parse_duration(t)?),
      _ => None,
    };

    Ok(EntryPoint {
      routing,
      listen,
      target,
      proxy,
      block_list: Vec::new(),
      allow_list: Vec::new(),
      timeout,
      tag: None,
      features: Vec::new(),
    })
  }
}

/* ---------------------------------------------------------- */
/// Parse a listen address: `host:port`, or a bare `port` which binds `127.0.0.1:<port>`
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr, ConfigurationError> {
  if let Ok(port) = s.parse::<u16>() {
    return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
  }
  s.parse::<SocketAddr>()
    .map_err(|_| ConfigurationError::InvalidListen { value: s.to_string() })
}

fn parse_proxy_url(s: impl AsRef<str>) -> Result<Url, ConfigurationError> {
  Url::parse(s.as_ref()).map_err(|_| ConfigurationError::InvalidProxyUrl {
    value: s.as_ref().to_string(),
  })
}

/// Parse a duration string: sequences of `<number><unit>` with units
/// `ms`, `s`, `m`, `h`, `d`; a bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigurationError> {
  let invalid = || ConfigurationError::InvalidDuration { value: s.to_string() };
  let s = s.trim();
  if s.is_empty() {
    return Err(invalid());
  }
  if let Ok(secs) = s.parse::<u64>() {
    return Ok(Duration::from_secs(secs));
  }

  let mut total = Duration::ZERO;
  let mut chars = s.chars().peekable();
  while chars.peek().is_some() {
    let mut number = String::new();
    while let Some(c) = chars.peek().filter(|c| c.is_ascii_digit()) {
      number.push(*c);
      chars.next();
    }
    let value = number.parse::<u64>().map_err(|_| invalid())?;

    let mut unit = String::new();
    while let Some(c) = chars.peek().filter(|c| c.is_ascii_alphabetic()) {
      unit.push(*c);
      chars.next();
    }
    let part = match unit.as_str() {
      "ms" => Duration::from_millis(value),
      "s" => Duration::from_secs(value),
      "m" => Duration::from_secs(value * 60),
      "h" => Duration::from_secs(value * 3600),
      "d" => Duration::from_secs(value * 86_400),
      _ => return Err(invalid()),
    };
    total += part;
  }
  Ok(total)
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;

  fn matcher(pattern: &str) -> Matcher {
    Matcher::parse(pattern).unwrap()
  }

  fn bare_entry() -> EntryPoint {
    EntryPoint {
      routing: RoutingKind::Sni,
      listen: "127.0.0.1:8443".parse().unwrap(),
      target: String::new(),
      proxy: Vec::new(),
      block_list: Vec::new(),
      allow_list: Vec::new(),
      timeout: None,
      tag: None,
      features: Vec::new(),
    }
  }

  #[test]
  fn shorthand_decodes_all_sections() {
    let entry: EntryPoint = "sni;127.0.0.1:8443;;socks5://127.0.0.1:1080;30s".parse().unwrap();
    assert_eq!(entry.routing, RoutingKind::Sni);
    assert_eq!(entry.listen, "127.0.0.1:8443".parse().unwrap());
    assert!(entry.target.is_empty());
    assert_eq!(entry.proxy.len(), 1);
    assert_eq!(entry.proxy[0].as_str(), "socks5://127.0.0.1:1080");
    assert_eq!(entry.timeout, Some(Duration::from_secs(30)));
  }

  #[test]
  fn shorthand_allows_trailing_omission() {
    let entry: EntryPoint = "tcp-raw;9000;10.0.0.1:22".parse().unwrap();
    assert_eq!(entry.routing, RoutingKind::TcpRaw);
    assert_eq!(entry.listen, "127.0.0.1:9000".parse().unwrap());
    assert_eq!(entry.target, "10.0.0.1:22");
    assert!(entry.proxy.is_empty());
    assert_eq!(entry.timeout, None);
  }

  #[test]
  fn shorthand_rejects_excess_separators() {
    assert!("sni;1;2;3;4;5".parse::<EntryPoint>().is_err());
  }

  #[test]
  fn bare_port_listen_binds_loopback() {
    assert_eq!(parse_listen_addr("8443").unwrap(), "127.0.0.1:8443".parse().unwrap());
    assert_eq!(parse_listen_addr("0.0.0.0:443").unwrap(), "0.0.0.0:443".parse().unwrap());
    assert!(parse_listen_addr("not-an-addr").is_err());
  }

  #[test]
  fn durations_parse_units_and_compounds() {
    assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
    assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
    assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    assert!(parse_duration("5x").is_err());
    assert!(parse_duration("").is_err());
  }

  #[test]
  fn toml_table_entry_deserializes() {
    #[derive(Deserialize)]
    struct Wrapper {
      entrypoints: Vec<EntryPoint>,
    }
    let toml_str = r#"
[[entrypoints]]
routing = "http-header"
listen = "0.0.0.0:8080"
to = "443"
proxy = ["socks5://127.0.0.1:1080"]
allow_list = ["*.example.com"]
timeout = "1h"
tag = "web"
features = ["flexible-port"]

[[entrypoints]]
routing = "udp-raw"
listen = 5353
to = "1.1.1.1:53"
"#;
    let parsed: Wrapper = toml::from_str(toml_str).unwrap();
    assert_eq!(parsed.entrypoints.len(), 2);
    let first = &parsed.entrypoints[0];
    assert_eq!(first.routing, RoutingKind::HttpHeader);
    assert_eq!(first.timeout, Some(Duration::from_secs(3600)));
    assert!(first.has_feature(FEATURE_FLEXIBLE_PORT));
    let second = &parsed.entrypoints[1];
    assert_eq!(second.listen, "127.0.0.1:5353".parse().unwrap());
  }

  #[test]
  fn shorthand_inside_entry_list_deserializes() {
    #[derive(Deserialize)]
    struct Wrapper {
      entrypoints: Vec<EntryPoint>,
    }
    let toml_str = r#"entrypoints = ["sni;8443;;;5m"]"#;
    let parsed: Wrapper = toml::from_str(toml_str).unwrap();
    assert_eq!(parsed.entrypoints[0].routing, RoutingKind::Sni);
    assert_eq!(parsed.entrypoints[0].timeout, Some(Duration::from_secs(300)));
  }

  /* ---------------------------------------------------------- */
  // Allow/block semantics as a total function of
  // (block matches, allow matches, |block|, |allow|)

  #[test]
  fn empty_lists_admit_everything() {
    let entry = bare_entry();
    assert!(entry.allowed("anything.example"));
  }

  #[test]
  fn block_match_denies_even_with_allow_match() {
    let mut entry = bare_entry();
    entry.block_list = vec![matcher("evil.example")];
    entry.allow_list = vec![matcher("evil.example")];
    assert!(!entry.allowed("evil.example"));
  }

  #[test]
  fn block_miss_falls_through_to_allow() {
    let mut entry = bare_entry();
    entry.block_list = vec![matcher("evil.example")];
    entry.allow_list = vec![matcher("good.example")];
    assert!(entry.allowed("good.example"));
    assert!(!entry.allowed("other.example"));
  }

  #[test]
  fn block_only_admits_the_rest() {
    let mut entry = bare_entry();
    entry.block_list = vec![matcher("evil.example")];
    assert!(!entry.allowed("evil.example"));
    assert!(entry.allowed("good.example"));
  }

  #[test]
  fn allow_only_denies_the_rest() {
    let mut entry = bare_entry();
    entry.allow_list = vec![matcher("good.example")];
    assert!(entry.allowed("good.example"));
    assert!(!entry.allowed("evil.example"));
  }

  #[test]
  fn udp_idle_timeout_defaults_to_five_minutes() {
    let mut entry = bare_entry();
    assert_eq!(entry.udp_idle_timeout(), Duration::from_secs(300));
    entry.timeout = Some(Duration::from_secs(2));
    assert_eq!(entry.udp_idle_timeout(), Duration::from_secs(2));
  }

  #[test]
  fn entry_serializes_back_to_a_table() {
    let mut entry = bare_entry();
    entry.target = "443".to_string();
    entry.timeout = Some(Duration::from_secs(60));
    let s = toml::to_string(&entry).unwrap();
    assert!(s.contains("routing = \"sni\""));
    assert!(s.contains("timeout = \"60s\""));
  }
}
