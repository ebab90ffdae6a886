//! Wire codec for control frames (§3, §4.A, §8 of the binding's data model).
//!
//! Every frame begins with a fixed two-byte header `{version: u8, type: u8}`
//! followed by type-specific fields in declared order. Integers are
//! little-endian. Length-prefixed strings are NUL-terminated on the wire and
//! the length prefix *includes* the terminating NUL, matching the original
//! corpus's C-ABI string convention.
//!
//! `decode` never allocates on a rejected frame: it is a pure function over
//! the input slice until the point where a valid frame is confirmed and its
//! owned fields are copied out.

use crate::error::WireError;

/// Current (and only) control-channel version this codec understands.
pub const CONTROL_VERSION: u8 = 1;

const TYPE_CREATE: u8 = 1;
const TYPE_START: u8 = 2;
const TYPE_DESTROY: u8 = 3;
const TYPE_REPLY: u8 = 4;

/// A decoded or to-be-encoded control frame.
///
/// Control frames are strictly ordered per session: `ModuleCreate` precedes
/// `ModuleStart` precedes `ModuleDestroy`, and `ModuleReply` answers whichever
/// of the three it is correlated with by arrival order (there is no explicit
/// request id on the wire — the control channel is a single point-to-point
/// pipe with no reordering).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Sent by the Proxy to ask the Host to instantiate the real module.
    ModuleCreate {
        /// Version of the in-memory gateway message format the Proxy speaks.
        gateway_message_version: u8,
        /// The message-channel endpoint the Host should open its data socket on.
        message_uri: String,
        /// Opaque module configuration bytes, handed to the module unparsed.
        module_args: Vec<u8>,
    },
    /// Sent by the Proxy once all three worker threads are running.
    ModuleStart,
    /// Sent by the Proxy (best-effort) when the handle is being torn down.
    ModuleDestroy,
    /// Sent by the Host in response to `ModuleCreate` (and in response to
    /// `ModuleStart`/`ModuleDestroy` in some deployments, though this binding
    /// only waits on the Create reply).
    ModuleReply {
        /// 0 on success, non-zero on failure or remote module termination.
        status: i32,
    },
}

impl ControlFrame {
    fn type_tag(&self) -> u8 {
        match self {
            ControlFrame::ModuleCreate { .. } => TYPE_CREATE,
            ControlFrame::ModuleStart => TYPE_START,
            ControlFrame::ModuleDestroy => TYPE_DESTROY,
            ControlFrame::ModuleReply { .. } => TYPE_REPLY,
        }
    }

    /// Returns the exact encoded size of this frame in bytes.
    pub fn size(&self) -> usize {
        let header = 2; // version + type
        header
            + match self {
                ControlFrame::ModuleCreate {
                    message_uri,
                    module_args,
                    ..
                } => {
                    // gateway_message_version(1) + uri_length(4) + uri_type_tag(1)
                    // + uri_bytes(uri_len_with_nul) + args_length(4) + args_bytes
                    let uri_len_with_nul = message_uri.len() + 1;
                    1 + 4 + 1 + uri_len_with_nul + 4 + module_args.len()
                }
                ControlFrame::ModuleStart => 0,
                ControlFrame::ModuleDestroy => 0,
                ControlFrame::ModuleReply { .. } => 4,
            }
    }

    /// Encodes this frame into `buf`, which must be exactly `self.size()`
    /// bytes long.
    ///
    /// # Panics
    ///
    /// Panics if `buf.len() != self.size()` — callers are expected to size
    /// the buffer with `size()` first, as in the two-pass
    /// `serialize(msg, null, 0)` / `serialize(msg, buf, n)` protocol from the
    /// spec's sender thread.
    pub fn encode(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), self.size(), "encode buffer size mismatch");
        buf[0] = CONTROL_VERSION;
        buf[1] = self.type_tag();
        let mut pos = 2;
        match self {
            ControlFrame::ModuleCreate {
                gateway_message_version,
                message_uri,
                module_args,
            } => {
                buf[pos] = *gateway_message_version;
                pos += 1;
                let uri_len = (message_uri.len() + 1) as u32;
                buf[pos..pos + 4].copy_from_slice(&uri_len.to_le_bytes());
                pos += 4;
                // uri_type_tag: reserved for future endpoint-family
                // discrimination; this binding only ever emits 0 (local IPC path).
                buf[pos] = 0;
                pos += 1;
                buf[pos..pos + message_uri.len()].copy_from_slice(message_uri.as_bytes());
                pos += message_uri.len();
                buf[pos] = 0; // NUL terminator
                pos += 1;
                let args_len = module_args.len() as u32;
                buf[pos..pos + 4].copy_from_slice(&args_len.to_le_bytes());
                pos += 4;
                buf[pos..pos + module_args.len()].copy_from_slice(module_args);
                pos += module_args.len();
                debug_assert_eq!(pos, buf.len());
            }
            ControlFrame::ModuleStart | ControlFrame::ModuleDestroy => {}
            ControlFrame::ModuleReply { status } => {
                buf[pos..pos + 4].copy_from_slice(&status.to_le_bytes());
                pos += 4;
                debug_assert_eq!(pos, buf.len());
            }
        }
    }

    /// Convenience wrapper around `size`/`encode` for callers that just want
    /// an owned byte buffer (the sender and creator threads do).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        self.encode(&mut buf);
        buf
    }

    /// Decodes a control frame from `bytes`.
    ///
    /// Rejects (without allocating) on: unknown version, unknown type,
    /// truncated input, or a length prefix exceeding the remaining bytes.
    pub fn decode(bytes: &[u8]) -> Result<ControlFrame, WireError> {
        if bytes.len() < 2 {
            return Err(WireError::Truncated {
                needed: 2,
                had: bytes.len(),
            });
        }
        let version = bytes[0];
        if version != CONTROL_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let type_tag = bytes[1];
        let rest = &bytes[2..];
        match type_tag {
            TYPE_CREATE => decode_create(rest),
            TYPE_START => Ok(ControlFrame::ModuleStart),
            TYPE_DESTROY => Ok(ControlFrame::ModuleDestroy),
            TYPE_REPLY => decode_reply(rest),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

fn decode_create(rest: &[u8]) -> Result<ControlFrame, WireError> {
    if rest.len() < 1 + 4 + 1 {
        return Err(WireError::Truncated {
            needed: 1 + 4 + 1,
            had: rest.len(),
        });
    }
    let gateway_message_version = rest[0];
    let uri_len = u32::from_le_bytes(rest[1..5].try_into().unwrap()) as usize;
    let _uri_type_tag = rest[5];
    let mut pos = 6;
    if uri_len == 0 {
        // a NUL-terminated string always has length >= 1
        return Err(WireError::LengthOverflow {
            declared: uri_len,
            remaining: rest.len() - pos,
        });
    }
    if rest.len() - pos < uri_len {
        return Err(WireError::LengthOverflow {
            declared: uri_len,
            remaining: rest.len() - pos,
        });
    }
    let uri_bytes = &rest[pos..pos + uri_len - 1]; // drop trailing NUL
    let message_uri = String::from_utf8_lossy(uri_bytes).into_owned();
    pos += uri_len;

    if rest.len() - pos < 4 {
        return Err(WireError::Truncated {
            needed: 4,
            had: rest.len() - pos,
        });
    }
    let args_len = u32::from_le_bytes(rest[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if rest.len() - pos < args_len {
        return Err(WireError::LengthOverflow {
            declared: args_len,
            remaining: rest.len() - pos,
        });
    }
    let module_args = rest[pos..pos + args_len].to_vec();

    Ok(ControlFrame::ModuleCreate {
        gateway_message_version,
        message_uri,
        module_args,
    })
}

fn decode_reply(rest: &[u8]) -> Result<ControlFrame, WireError> {
    if rest.len() < 4 {
        return Err(WireError::Truncated {
            needed: 4,
            had: rest.len(),
        });
    }
    let status = i32::from_le_bytes(rest[0..4].try_into().unwrap());
    Ok(ControlFrame::ModuleReply { status })
}

/// An opaque data frame exchanged on the message channel. The binding never
/// interprets these bytes; they are whatever the broker's message serializer
/// produced.
pub type DataFrame = Box<[u8]>;

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: ControlFrame) {
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), frame.size());
        let decoded = ControlFrame::decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrips_create() {
        roundtrip(ControlFrame::ModuleCreate {
            gateway_message_version: 3,
            message_uri: "/tmp/modbridge-test.msg".to_string(),
            module_args: b"{\"key\":\"value\"}".to_vec(),
        });
    }

    #[test]
    fn roundtrips_create_with_empty_args() {
        roundtrip(ControlFrame::ModuleCreate {
            gateway_message_version: 1,
            message_uri: "/tmp/m".to_string(),
            module_args: Vec::new(),
        });
    }

    #[test]
    fn roundtrips_start() {
        roundtrip(ControlFrame::ModuleStart);
    }

    #[test]
    fn roundtrips_destroy() {
        roundtrip(ControlFrame::ModuleDestroy);
    }

    #[test]
    fn roundtrips_reply_success() {
        roundtrip(ControlFrame::ModuleReply { status: 0 });
    }

    #[test]
    fn roundtrips_reply_failure() {
        roundtrip(ControlFrame::ModuleReply { status: -7 });
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            ControlFrame::decode(&[]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let bytes = [0xFF, TYPE_START];
        assert!(matches!(
            ControlFrame::decode(&bytes),
            Err(WireError::UnsupportedVersion(0xFF))
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let bytes = [CONTROL_VERSION, 0xEE];
        assert!(matches!(
            ControlFrame::decode(&bytes),
            Err(WireError::UnknownType(0xEE))
        ));
    }

    #[test]
    fn rejects_truncated_reply() {
        let bytes = [CONTROL_VERSION, TYPE_REPLY, 0, 0];
        assert!(matches!(
            ControlFrame::decode(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_create_with_overlong_uri_length() {
        let mut bytes = vec![CONTROL_VERSION, TYPE_CREATE, 1];
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.push(0); // uri_type_tag
        bytes.extend_from_slice(b"short\0");
        assert!(matches!(
            ControlFrame::decode(&bytes),
            Err(WireError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn rejects_create_missing_args_length() {
        let mut bytes = vec![CONTROL_VERSION, TYPE_CREATE, 1];
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.push(0); // uri_type_tag
        bytes.extend_from_slice(b"abc\0");
        // args_length field omitted entirely
        assert!(matches!(
            ControlFrame::decode(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }
}
