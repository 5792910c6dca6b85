use crate::error::HostnameError;
use regex::Regex;
use std::sync::LazyLock;

/// Hostnames longer than this are rejected outright
const MAX_HOSTNAME_LENGTH: usize = 255;

/// RFC 1123 label syntax over the full dotted name
static VALID_HOSTNAME_RFC1123: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$")
    .expect("hostname regex is valid")
});

/// Names that always refer to the local machine and are never routed
const LOCALHOST_IDENTIFIERS: [&str; 4] = ["localhost", "localhost.localdomain", "localhost6.localdomain6", "ip6-localhost"];

/// Validate a bare hostname: non-empty, at most 255 characters, RFC 1123
/// compliant, and not a local identifier.
pub fn validate_hostname(hostname: &str) -> Result<(), HostnameError> {
  if hostname.is_empty() {
    return Err(HostnameError::Empty);
  }
  if is_local(hostname) {
    return Err(HostnameError::LocalName(hostname.to_string()));
  }
  if hostname.len() > MAX_HOSTNAME_LENGTH {
    return Err(HostnameError::TooLong);
  }
  if !VALID_HOSTNAME_RFC1123.is_match(hostname) {
    return Err(HostnameError::NotRfc1123(hostname.to_string()));
  }
  Ok(())
}

fn is_local(name: &str) -> bool {
  LOCALHOST_IDENTIFIERS.iter().any(|l| l.eq_ignore_ascii_case(name))
}

/// Sanitise an HTTP Host header into a dial target.
///
/// Trims whitespace, unwraps a full URL if a scheme is present, strips any port,
/// validates the bare host, then re-attaches `target_port` when configured.
pub fn sanitize_host_header(host_header: &str, target_port: &str) -> Result<String, HostnameError> {
  let mut host = host_header.trim().to_string();
  if host.is_empty() {
    return Err(HostnameError::Empty);
  }

  if host.contains("://") {
    let url = url::Url::parse(&host).map_err(|_| HostnameError::InvalidUrl)?;
    host = url.host_str().ok_or(HostnameError::InvalidUrl)?.to_string();
  }

  if let Some((bare, port)) = host.rsplit_once(':') {
    if port.parse::<u16>().is_ok() {
      host = bare.to_string();
    }
  }

  validate_hostname(&host)?;

  if target_port.is_empty() {
    return Ok(host);
  }
  Ok(format!("{host}:{target_port}"))
}
