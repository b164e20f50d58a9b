//! Length-prefixed JSON framing for the control and proxy channels.
//!
//! Wire format: `[8-byte length prefix][JSON envelope]`
//!
//! The prefix is eight bytes wide but only the low two bytes carry the length
//! (little-endian `u16`); the upper six are always written as zero. A frame
//! payload is therefore capped at 65535 bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{TunnelError, TunnelResult};
use crate::messages::*;

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Largest envelope a frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Serialize)]
struct OutgoingEnvelope<'a, P: Serialize> {
    #[serde(rename = "Type")]
    msg_type: &'a str,
    #[serde(rename = "Payload")]
    payload: &'a P,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(rename = "Type", default)]
    msg_type: String,
    #[serde(rename = "Payload", default)]
    payload: Value,
}

/// Encode a length into the 8-byte wire prefix.
pub fn encode_len(len: u16) -> [u8; LENGTH_PREFIX_SIZE] {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix[..2].copy_from_slice(&len.to_le_bytes());
    prefix
}

/// Read the declared payload length from an 8-byte prefix.
///
/// The whole prefix is read as a little-endian integer so that garbage in the
/// upper bytes shows up as an oversized frame instead of being ignored.
pub fn decode_len(prefix: &[u8; LENGTH_PREFIX_SIZE]) -> u64 {
    u64::from_le_bytes(*prefix)
}

/// Encode a message into a complete frame (prefix + envelope).
pub fn encode_frame(msg: &Message) -> TunnelResult<Vec<u8>> {
    let tag = msg.msg_type().as_str();
    let body = match msg {
        Message::Auth(p) => envelope_bytes(tag, p),
        Message::ReqTunnel(p) => envelope_bytes(tag, p),
        Message::RegProxy(p) => envelope_bytes(tag, p),
        Message::Ping(p) => envelope_bytes(tag, p),
        Message::AuthResp(p) => envelope_bytes(tag, p),
        Message::NewTunnel(p) => envelope_bytes(tag, p),
        Message::ReqProxy(p) => envelope_bytes(tag, p),
        Message::StartProxy(p) => envelope_bytes(tag, p),
        Message::Pong(p) => envelope_bytes(tag, p),
    }?;

    let len = u16::try_from(body.len()).map_err(|_| {
        TunnelError::Encode(format!(
            "{tag} envelope is {} bytes, limit is {MAX_FRAME_LEN}",
            body.len()
        ))
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&encode_len(len));
    frame.extend(body);
    Ok(frame)
}

fn envelope_bytes<P: Serialize>(tag: &str, payload: &P) -> TunnelResult<Vec<u8>> {
    serde_json::to_vec(&OutgoingEnvelope {
        msg_type: tag,
        payload,
    })
    .map_err(|e| TunnelError::Encode(e.to_string()))
}

/// Decode an envelope (frame payload without the length prefix).
///
/// Zero padding around the JSON is stripped first. An unknown `Type` fails
/// with [`TunnelError::UnknownResponse`]; anything that is not a JSON object
/// envelope fails with [`TunnelError::Codec`].
pub fn decode_message(data: &[u8]) -> TunnelResult<Message> {
    let data = trim_zero_padding(data);
    let envelope: IncomingEnvelope = serde_json::from_slice(data)?;

    let msg_type: MsgType = envelope
        .msg_type
        .parse()
        .map_err(TunnelError::UnknownResponse)?;

    if !envelope.payload.is_object() {
        return Err(TunnelError::Codec(format!(
            "{msg_type} payload is not an object"
        )));
    }
    let payload = envelope.payload;

    let msg = match msg_type {
        MsgType::Auth => Message::Auth(serde_json::from_value(payload)?),
        MsgType::ReqTunnel => Message::ReqTunnel(serde_json::from_value(payload)?),
        MsgType::RegProxy => Message::RegProxy(serde_json::from_value(payload)?),
        MsgType::Ping => Message::Ping(Ping {}),
        MsgType::AuthResp => Message::AuthResp(serde_json::from_value(payload)?),
        MsgType::NewTunnel => Message::NewTunnel(serde_json::from_value(payload)?),
        MsgType::ReqProxy => Message::ReqProxy(ReqProxy {}),
        MsgType::StartProxy => Message::StartProxy(serde_json::from_value(payload)?),
        MsgType::Pong => Message::Pong(Pong {}),
    };
    Ok(msg)
}

fn trim_zero_padding(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|b| *b != 0).unwrap_or(data.len());
    let end = data.iter().rposition(|b| *b != 0).map_or(start, |i| i + 1);
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(frame: &[u8]) -> &[u8] {
        &frame[LENGTH_PREFIX_SIZE..]
    }

    #[test]
    fn prefix_layout() {
        let msg = Message::RegProxy(RegProxy {
            client_id: "abc".into(),
        });
        let frame = encode_frame(&msg).unwrap();
        let body_len = frame.len() - LENGTH_PREFIX_SIZE;

        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]) as usize, body_len);
        assert!(frame[2..LENGTH_PREFIX_SIZE].iter().all(|b| *b == 0));

        let prefix: [u8; LENGTH_PREFIX_SIZE] = frame[..LENGTH_PREFIX_SIZE].try_into().unwrap();
        assert_eq!(decode_len(&prefix), body_len as u64);
    }

    #[test]
    fn envelope_shape() {
        let frame = encode_frame(&Message::Ping(Ping {})).unwrap();
        let v: Value = serde_json::from_slice(payload_of(&frame)).unwrap();
        assert_eq!(v["Type"], "Ping");
        assert!(v["Payload"].as_object().unwrap().is_empty());
    }

    #[test]
    fn round_trip() {
        let msgs = vec![
            Message::Auth(Auth {
                version: PROTOCOL_VERSION.into(),
                mm_version: MM_VERSION.into(),
                user: "u".into(),
                password: "p".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                client_id: String::new(),
            }),
            Message::ReqTunnel(ReqTunnel {
                req_id: "0a1b".into(),
                protocol: "https".into(),
                hostname: "x.example.com".into(),
                ..Default::default()
            }),
            Message::NewTunnel(NewTunnel {
                url: "http://x.example.com".into(),
                protocol: "http".into(),
                ..Default::default()
            }),
            Message::StartProxy(StartProxy {
                url: "http://x.example.com".into(),
                client_addr: "1.2.3.4:5678".into(),
            }),
            Message::ReqProxy(ReqProxy {}),
            Message::Pong(Pong {}),
        ];
        for msg in msgs {
            let frame = encode_frame(&msg).unwrap();
            assert_eq!(decode_message(payload_of(&frame)).unwrap(), msg);
        }
    }

    #[test]
    fn round_trip_across_payload_sizes() {
        // Envelope overhead for RegProxy is fixed, so growing the id walks the
        // body length up to the 16-bit limit.
        let overhead = encode_frame(&Message::RegProxy(RegProxy::default()))
            .unwrap()
            .len()
            - LENGTH_PREFIX_SIZE;
        for n in [0usize, 1, 255, 256, 4096, MAX_FRAME_LEN - overhead] {
            let msg = Message::RegProxy(RegProxy {
                client_id: "a".repeat(n),
            });
            let frame = encode_frame(&msg).unwrap();
            assert_eq!(decode_message(payload_of(&frame)).unwrap(), msg);
        }
    }

    #[test]
    fn oversized_envelope_is_rejected() {
        let msg = Message::RegProxy(RegProxy {
            client_id: "a".repeat(MAX_FRAME_LEN),
        });
        assert!(matches!(encode_frame(&msg), Err(TunnelError::Encode(_))));
    }

    #[test]
    fn unknown_type_is_unknown_response() {
        let err = decode_message(br#"{"Type":"Hello","Payload":{}}"#).unwrap_err();
        assert!(matches!(err, TunnelError::UnknownResponse(_)));
        assert_eq!(err.code(), -100);

        let err = decode_message(br#"{"Payload":{}}"#).unwrap_err();
        assert!(matches!(err, TunnelError::UnknownResponse(_)));
    }

    #[test]
    fn malformed_payload_is_codec_error() {
        assert!(matches!(
            decode_message(b"not json"),
            Err(TunnelError::Codec(_))
        ));
        assert!(matches!(
            decode_message(br#"{"Type":"AuthResp","Payload":"nope"}"#),
            Err(TunnelError::Codec(_))
        ));
        assert!(matches!(
            decode_message(br#"{"Type":"AuthResp","Payload":{"ClientId":7}}"#),
            Err(TunnelError::Codec(_))
        ));
    }

    #[test]
    fn zero_padding_is_stripped() {
        let mut data = br#"{"Type":"AuthResp","Payload":{"ClientId":"abc"}}"#.to_vec();
        data.extend_from_slice(&[0, 0, 0, 0]);
        match decode_message(&data).unwrap() {
            Message::AuthResp(resp) => assert_eq!(resp.client_id, "abc"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
