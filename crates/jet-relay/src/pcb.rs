//! RDP preconnection PDU carrying an association token

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// cbSize, flags, version and id
const FIXED_LEN: usize = 16;
const MAX_PDU_LEN: usize = 64 * 1024;
const VERSION_2: u32 = 2;

#[derive(Debug, Error)]
pub enum PcbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed before the preconnection PDU was complete")]
    UnexpectedEof,
    #[error("Invalid preconnection PDU size {0}")]
    InvalidSize(usize),
    #[error("Preconnection blob length {cch} does not fit in {size} bytes")]
    BlobOverflow { cch: usize, size: usize },
    #[error("Preconnection blob is not valid UTF-16")]
    InvalidUtf16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconnectionBlob {
    pub version: u32,
    pub flags: u32,
    pub id: u32,
    /// v2 payload with trailing NULs removed
    pub payload: Option<String>,
}

/// Decode a PDU from the front of `buf`.
///
/// Returns `Ok(None)` until the whole PDU is buffered, otherwise the blob and
/// the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(PreconnectionBlob, usize)>, PcbError> {
    if buf.len() < FIXED_LEN {
        return Ok(None);
    }

    let mut cursor = buf;
    let size = cursor.get_u32_le() as usize;
    if !(FIXED_LEN..=MAX_PDU_LEN).contains(&size) {
        return Err(PcbError::InvalidSize(size));
    }
    if buf.len() < size {
        return Ok(None);
    }

    let flags = cursor.get_u32_le();
    let version = cursor.get_u32_le();
    let id = cursor.get_u32_le();

    let payload = if version >= VERSION_2 && size >= FIXED_LEN + 2 {
        let cch = cursor.get_u16_le() as usize;
        if FIXED_LEN + 2 + cch * 2 > size {
            return Err(PcbError::BlobOverflow { cch, size });
        }
        let units: Vec<u16> = (0..cch).map(|_| cursor.get_u16_le()).collect();
        let text = String::from_utf16(&units).map_err(|_| PcbError::InvalidUtf16)?;
        Some(text.trim_end_matches('\0').to_owned())
    } else {
        None
    };

    Ok(Some((
        PreconnectionBlob {
            version,
            flags,
            id,
            payload,
        },
        size,
    )))
}

/// Read a PDU, returning it together with any RDP bytes read past its end
pub async fn read_pcb<R>(
    reader: &mut R,
    mut buf: BytesMut,
) -> Result<(PreconnectionBlob, Bytes), PcbError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some((blob, consumed)) = decode(&buf)? {
            buf.advance(consumed);
            return Ok((blob, buf.freeze()));
        }

        buf.reserve(1024);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(PcbError::UnexpectedEof);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn encode_v2(payload: &str) -> Vec<u8> {
        let units: Vec<u16> = payload.encode_utf16().chain(std::iter::once(0)).collect();
        let size = FIXED_LEN + 2 + units.len() * 2;
        let mut out = Vec::with_capacity(size);
        out.put_u32_le(size as u32);
        out.put_u32_le(0);
        out.put_u32_le(VERSION_2);
        out.put_u32_le(7);
        out.put_u16_le(units.len() as u16);
        for unit in units {
            out.put_u16_le(unit);
        }
        out
    }

    #[test]
    fn test_decode_v2_payload() {
        let pdu = encode_v2("header.payload.signature");
        let (blob, consumed) = decode(&pdu).unwrap().unwrap();
        assert_eq!(consumed, pdu.len());
        assert_eq!(blob.id, 7);
        assert_eq!(blob.payload.as_deref(), Some("header.payload.signature"));
    }

    #[test]
    fn test_decode_needs_whole_pdu() {
        let pdu = encode_v2("token");
        assert!(decode(&pdu[..10]).unwrap().is_none());
        assert!(decode(&pdu[..pdu.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_bad_sizes() {
        let mut pdu = encode_v2("token");
        pdu[..4].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(decode(&pdu), Err(PcbError::InvalidSize(8))));

        let mut pdu = encode_v2("token");
        pdu[16..18].copy_from_slice(&500u16.to_le_bytes());
        assert!(matches!(decode(&pdu), Err(PcbError::BlobOverflow { cch: 500, .. })));
    }

    #[tokio::test]
    async fn test_read_pcb_keeps_rdp_bytes() {
        let mut stream = encode_v2("token");
        stream.extend_from_slice(&[0x03, 0x00, 0x00, 0x13]);
        let mut reader: &[u8] = &stream;

        let (blob, leftover) = read_pcb(&mut reader, BytesMut::new()).await.unwrap();
        assert_eq!(blob.payload.as_deref(), Some("token"));
        assert_eq!(&leftover[..], &[0x03, 0x00, 0x00, 0x13]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Arbitrary input never panics the decoder
            #[test]
            fn prop_decode_total(data in proptest::collection::vec(any::<u8>(), 0..128)) {
                let _ = decode(&data);
            }

            #[test]
            fn prop_payload_preserved(payload in "[A-Za-z0-9._-]{0,200}") {
                let pdu = encode_v2(&payload);
                let (blob, consumed) = decode(&pdu).unwrap().unwrap();
                prop_assert_eq!(consumed, pdu.len());
                prop_assert_eq!(blob.payload.as_deref(), Some(payload.as_str()));
            }
        }
    }
}
