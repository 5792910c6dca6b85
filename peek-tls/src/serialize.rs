use crate::error::ClientHelloError;
use bytes::{Buf, Bytes};

/// Deserialize from the TLS wireformat with big-endian length prefixes
pub(crate) trait Deserialize {
  type Error;
  /// Deserialize a struct from the buf.
  fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

/// Reads a length-prefixed value from the buffer, where the length is a `len_prefix`-byte big-endian integer
pub(crate) fn read_lengthed<B: Buf>(b: &mut B, len_prefix: usize) -> Result<Bytes, ClientHelloError> {
  if b.remaining() < len_prefix {
    return Err(ClientHelloError::ShortInput);
  }

  let mut len = 0usize;
  for _ in 0..len_prefix {
    len <<= 8;
    len += b.get_u8() as usize;
  }

  if len > b.remaining() {
    return Err(ClientHelloError::ShortInput);
  }

  Ok(b.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn read_lengthed_consumes_prefix_and_body() {
    let mut buf = Bytes::from_static(&[0x00, 0x03, 0xaa, 0xbb, 0xcc, 0xdd]);
    let body = read_lengthed(&mut buf, 2).unwrap();
    assert_eq!(body.as_ref(), &[0xaa, 0xbb, 0xcc]);
    assert_eq!(buf.remaining(), 1);
  }

  #[test]
  fn read_lengthed_rejects_overrun() {
    let mut buf = Bytes::from_static(&[0x00, 0x10, 0xaa]);
    assert_eq!(read_lengthed(&mut buf, 2), Err(ClientHelloError::ShortInput));
  }
}
