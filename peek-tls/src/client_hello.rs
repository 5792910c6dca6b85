use crate::{
  TLS_HANDSHAKE_CONTENT_TYPE, TLS_HANDSHAKE_MESSAGE_HEADER_LEN, TLS_HANDSHAKE_TYPE_CLIENT_HELLO, TLS_RECORD_HEADER_LEN,
  error::ClientHelloError,
  serialize::{Deserialize, read_lengthed},
  trace::*,
};
use bytes::{Buf, Bytes};

/// Upper bound on server_name entries retained by the structured parser.
/// Real-world ClientHello messages carry a single name.
pub const MAX_SNI_NAMES: usize = 4;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, PartialEq, Eq)]
/// Structured view of a TLS ClientHello, sufficient for routing diagnostics and tests.
/// https://datatracker.ietf.org/doc/html/rfc8446#section-4.1.2
pub struct ClientHello {
  /// legacy_version
  pub version: u16,
  /// Random bytes
  pub random: [u8; 32],
  /// legacy_session_id
  pub session_id: Bytes,
  /// Cipher suites
  pub cipher_suites: Vec<u16>,
  /// legacy_compression_methods
  pub compression_methods: Bytes,
  /// host_name entries of the server_name extension, capped at [`MAX_SNI_NAMES`]
  pub sni_host_names: Vec<String>,
}

impl ClientHello {
  /// Parse a full TLS record carrying a ClientHello handshake message.
  pub fn parse(buf: &[u8]) -> Result<Self, ClientHelloError> {
    if buf.len() < TLS_RECORD_HEADER_LEN + TLS_HANDSHAKE_MESSAGE_HEADER_LEN {
      return Err(ClientHelloError::ShortInput);
    }
    if buf[0] != TLS_HANDSHAKE_CONTENT_TYPE {
      return Err(ClientHelloError::NotHandshake);
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len < TLS_HANDSHAKE_MESSAGE_HEADER_LEN || buf.len() - TLS_RECORD_HEADER_LEN < record_len {
      return Err(ClientHelloError::TruncatedRecord);
    }

    let handshake = &buf[TLS_RECORD_HEADER_LEN..TLS_RECORD_HEADER_LEN + record_len];
    if handshake[0] != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
      return Err(ClientHelloError::NotClientHello);
    }
    let body_len = ((handshake[1] as usize) << 16) + ((handshake[2] as usize) << 8) + handshake[3] as usize;
    if handshake.len() - TLS_HANDSHAKE_MESSAGE_HEADER_LEN < body_len {
      return Err(ClientHelloError::TruncatedRecord);
    }

    let mut body = Bytes::copy_from_slice(&handshake[TLS_HANDSHAKE_MESSAGE_HEADER_LEN..]);
    Self::deserialize(&mut body)
  }

  /// First host_name of the server_name extension, if any
  pub fn first_sni(&self) -> Option<&str> {
    self.sni_host_names.first().map(String::as_str)
  }
}

impl Deserialize for ClientHello {
  type Error = ClientHelloError;
  fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Self::Error>
  where
    Self: Sized,
  {
    // ClientHello body:
    // - 2: legacy_version
    // - 32: random
    // - 1 + n: legacy_session_id
    // - 2 + n: cipher_suites
    // - 1 + n: legacy_compression_methods
    // - 2 + n: extensions (optional in older clients)
    if buf.remaining() < 2 + 32 {
      return Err(ClientHelloError::ShortInput);
    }
    let version = buf.get_u16();
    let mut random = [0u8; 32];
    buf.copy_to_slice(&mut random);

    let session_id = read_lengthed(buf, 1)?;
    let cipher_suites_bytes = read_lengthed(buf, 2)?;
    let compression_methods = read_lengthed(buf, 1)?;

    let cipher_suites = cipher_suites_bytes
      .chunks_exact(2)
      .map(|c| u16::from_be_bytes([c[0], c[1]]))
      .collect::<Vec<_>>();

    let mut sni_host_names = Vec::new();
    if buf.remaining() >= 2 {
      let mut extensions = read_lengthed(buf, 2)?;
      while extensions.remaining() >= 4 {
        let extension_type = extensions.get_u16();
        let mut payload = read_lengthed(&mut extensions, 2)?;
        if extension_type == crate::TLS_EXTENSION_TYPE_SNI {
          parse_server_name_list(&mut payload, &mut sni_host_names)?;
        }
      }
      if extensions.has_remaining() {
        debug!("Trailing garbage after the last ClientHello extension");
        return Err(ClientHelloError::InvalidClientHello);
      }
    }

    Ok(ClientHello {
      version,
      random,
      session_id,
      cipher_suites,
      compression_methods,
      sni_host_names,
    })
  }
}

/// Parse the server_name_list of an SNI extension payload
/// https://datatracker.ietf.org/doc/html/rfc6066#section-3
fn parse_server_name_list<B: Buf>(payload: &mut B, out: &mut Vec<String>) -> Result<(), ClientHelloError> {
  if payload.remaining() < 2 {
    return Err(ClientHelloError::InvalidSniExtension);
  }
  let mut list = read_lengthed(payload, 2).map_err(|_| ClientHelloError::InvalidSniExtension)?;
  while list.remaining() >= 3 {
    let name_type = list.get_u8();
    let name = read_lengthed(&mut list, 2).map_err(|_| ClientHelloError::InvalidSniExtension)?;
    if name_type != 0 {
      continue;
    }
    if out.len() < MAX_SNI_NAMES {
      out.push(String::from_utf8_lossy(&name).to_ascii_lowercase());
    }
  }
  if list.has_remaining() {
    return Err(ClientHelloError::InvalidSniExtension);
  }
  Ok(())
}

/* ---------------------------------------------------------- */
#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  /// Compose a syntactically valid ClientHello record carrying the given SNI names.
  pub(crate) fn build_client_hello(sni_names: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes()); // legacy_version TLS 1.2
    body.extend_from_slice(&[0x42u8; 32]); // random
    body.push(0x08); // session_id
    body.extend_from_slice(&[0x07u8; 8]);
    body.extend_from_slice(&4u16.to_be_bytes()); // cipher_suites
    body.extend_from_slice(&0x1301u16.to_be_bytes());
    body.extend_from_slice(&0x1302u16.to_be_bytes());
    body.push(0x01); // compression_methods
    body.push(0x00);

    let mut extensions = Vec::new();
    if !sni_names.is_empty() {
      let mut list = Vec::new();
      for name in sni_names {
        list.push(0x00); // name_type host_name
        list.extend_from_slice(&(name.len() as u16).to_be_bytes());
        list.extend_from_slice(name.as_bytes());
      }
      let mut sni_ext = Vec::new();
      sni_ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
      sni_ext.extend_from_slice(&list);

      extensions.extend_from_slice(&0x0000u16.to_be_bytes());
      extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
      extensions.extend_from_slice(&sni_ext);
    }
    // supported_groups, kept opaque
    extensions.extend_from_slice(&0x000au16.to_be_bytes());
    extensions.extend_from_slice(&4u16.to_be_bytes());
    extensions.extend_from_slice(&[0x00, 0x02, 0x00, 0x1d]);

    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(TLS_HANDSHAKE_TYPE_CLIENT_HELLO);
    let body_len = body.len() as u32;
    handshake.extend_from_slice(&body_len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(TLS_HANDSHAKE_CONTENT_TYPE);
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
  }

  #[test]
  fn parses_structured_fields() {
    let hello = build_client_hello(&["example.com"]);
    let parsed = ClientHello::parse(&hello).unwrap();
    assert_eq!(parsed.version, 0x0303);
    assert_eq!(parsed.random, [0x42u8; 32]);
    assert_eq!(parsed.session_id.as_ref(), &[0x07u8; 8]);
    assert_eq!(parsed.cipher_suites, vec![0x1301, 0x1302]);
    assert_eq!(parsed.compression_methods.as_ref(), &[0x00]);
    assert_eq!(parsed.first_sni(), Some("example.com"));
  }

  #[test]
  fn sni_names_are_lowercased_and_capped() {
    let names = ["A.example", "b.example", "c.example", "d.example", "e.example", "f.example"];
    let hello = build_client_hello(&names);
    let parsed = ClientHello::parse(&hello).unwrap();
    assert_eq!(parsed.sni_host_names.len(), MAX_SNI_NAMES);
    assert_eq!(parsed.first_sni(), Some("a.example"));
  }

  #[test]
  fn structured_parse_agrees_with_fast_extractor() {
    let hello = build_client_hello(&["agree.example.com"]);
    let parsed = ClientHello::parse(&hello).unwrap();
    let fast = crate::extract_sni(&hello).unwrap();
    assert_eq!(parsed.first_sni().unwrap().as_bytes(), fast);
  }

  #[test]
  fn rejects_wrong_record_type() {
    let mut hello = build_client_hello(&["example.com"]);
    hello[0] = 0x15;
    assert_eq!(ClientHello::parse(&hello), Err(ClientHelloError::NotHandshake));
  }

  #[test]
  fn rejects_truncated_record() {
    let hello = build_client_hello(&["example.com"]);
    let truncated = &hello[..hello.len() - 3];
    assert_eq!(ClientHello::parse(truncated), Err(ClientHelloError::TruncatedRecord));
  }

  #[test]
  fn truncations_never_panic() {
    let hello = build_client_hello(&["truncated.example"]);
    for len in 0..hello.len() {
      let _ = ClientHello::parse(&hello[..len]);
    }
  }

  #[test]
  fn hello_without_extensions_parses() {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0301u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 32]);
    body.push(0x00); // empty session_id
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&0x002fu16.to_be_bytes());
    body.push(0x01);
    body.push(0x00);

    let mut record = vec![TLS_HANDSHAKE_CONTENT_TYPE, 0x03, 0x01];
    record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    record.push(TLS_HANDSHAKE_TYPE_CLIENT_HELLO);
    record.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    record.extend_from_slice(&body);

    let parsed = ClientHello::parse(&record).unwrap();
    assert!(parsed.sni_host_names.is_empty());
  }
}
