use crate::error::{Error, Result};
use crate::peer::types::SdpPayload;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Предел распаковки для защиты от zip-bomb
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024; // 256 KiB

/// JSON -> gzip -> base64
pub fn enc(p: &SdpPayload) -> Result<String> {
    let json = serde_json::to_vec(p).map_err(|e| Error::Codec(e.to_string()))?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json).map_err(|e| Error::Codec(e.to_string()))?;
    let compressed = gz.finish().map_err(|e| Error::Codec(e.to_string()))?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn dec(s: &str) -> Result<SdpPayload> {
    let compressed = general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::Codec(format!("base64: {e}")))?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    // читаем на байт больше лимита, чтобы отличить "ровно лимит" от "больше"
    gz.take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut json)
        .map_err(|e| Error::Codec(format!("gzip: {e}")))?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(Error::Codec("payload exceeds 256 KiB".into()));
    }

    serde_json::from_slice(&json).map_err(|e| Error::Codec(format!("json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    const SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    fn offer() -> RTCSessionDescription {
        serde_json::from_value(serde_json::json!({"type": "offer", "sdp": SDP})).unwrap()
    }

    #[test]
    fn payload_survives_encoding() {
        let payload = SdpPayload {
            sdp: offer(),
            id: "call-1".into(),
            ts: 1_700_000_000,
        };
        let decoded = dec(&enc(&payload).unwrap()).unwrap();
        assert_eq!(decoded.id, "call-1");
        assert_eq!(decoded.sdp.sdp, SDP);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(dec("!!not base64!!"), Err(Error::Codec(_))));
        let not_gzip = general_purpose::STANDARD.encode(b"plain text");
        assert!(matches!(dec(&not_gzip), Err(Error::Codec(_))));
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&vec![b' '; (MAX_DECOMPRESSED_SIZE + 10) as usize])
            .unwrap();
        let bomb = general_purpose::STANDARD.encode(gz.finish().unwrap());
        assert!(matches!(dec(&bomb), Err(Error::Codec(_))));
    }
}
