use crate::twilio_types::{OutboundMediaMeta, TwilioOutbound};

use base64::{engine, Engine};

/// Prepare a TwilioOutbound media message from an audio frame already in telephony format.
pub fn frame2twilio(frame: &[u8], stream_sid: &str) -> TwilioOutbound {
    TwilioOutbound::Media {
        media: OutboundMediaMeta {
            payload: b64_encode(frame),
        },
        stream_sid: stream_sid.to_string(),
    }
}

pub fn b64_decode(enc: &str) -> Result<Vec<u8>, base64::DecodeError> {
    engine::general_purpose::STANDARD.decode(enc)
}

pub fn b64_encode(bytes: &[u8]) -> String {
    engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_message_shape() {
        let msg = frame2twilio(&[0xff, 0x7f], "MZ1");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "media");
        assert_eq!(json["streamSid"], "MZ1");
        assert_eq!(b64_decode(json["media"]["payload"].as_str().unwrap()).unwrap(), vec![0xff, 0x7f]);
    }
}
