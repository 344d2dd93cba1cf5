//! Wire protocol for bridge channels
//!
//! A frame is a sequence of UTF-8 tokens, one per line, closed by a line holding
//! only `.`. The first token names the message kind:
//!
//! ```text
//! c            call:      sub-kind (m|g|s|i), target, member, value tokens...
//! r            result:    one value token
//! e            error:     class, message, stack trace (n when absent)
//! g            release:   object id
//! a            auth:      token
//! shutdown     shutdown
//! ```
//!
//! Value tokens carry a one-character type prefix (`n b i d s j r a l f`).
//! Strings and identifiers escape `\`, newline and carriage return.

use objbridge_core::{
    BridgeError, BridgeMessage, ErrorEnvelope, InvocationKind, InvocationRequest,
    InvocationResponse, ObjectId, Result, Value,
};

/// Line that closes every frame
pub const TERMINATOR: &str = ".";

/// Frames larger than this are rejected (64MB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const KIND_CALL: &str = "c";
const KIND_RESULT: &str = "r";
const KIND_ERROR: &str = "e";
const KIND_RELEASE: &str = "g";
const KIND_AUTH: &str = "a";
const KIND_SHUTDOWN: &str = "shutdown";

/// Serialize a message into one complete frame
pub fn encode(msg: &BridgeMessage) -> Vec<u8> {
    let mut tokens: Vec<String> = Vec::new();

    match msg {
        BridgeMessage::Auth { token } => {
            tokens.push(KIND_AUTH.into());
            tokens.push(escape(token));
        }
        BridgeMessage::Call(request) => {
            tokens.push(KIND_CALL.into());
            tokens.push(kind_tag(request.kind).into());
            tokens.push(escape(request.target.as_str()));
            tokens.push(escape(&request.member));
            tokens.extend(request.args.iter().map(encode_value));
        }
        BridgeMessage::Release(id) => {
            tokens.push(KIND_RELEASE.into());
            tokens.push(escape(id.as_str()));
        }
        BridgeMessage::Shutdown => tokens.push(KIND_SHUTDOWN.into()),
        BridgeMessage::Response(InvocationResponse::Success(value)) => {
            tokens.push(KIND_RESULT.into());
            tokens.push(encode_value(value));
        }
        BridgeMessage::Response(InvocationResponse::Error(envelope)) => {
            tokens.push(KIND_ERROR.into());
            tokens.push(encode_value(&Value::String(envelope.error_class_name.clone())));
            tokens.push(encode_value(&Value::String(envelope.message.clone())));
            tokens.push(match &envelope.remote_stack_trace {
                Some(trace) => encode_value(&Value::String(trace.clone())),
                None => encode_value(&Value::Null),
            });
        }
    }

    let mut frame = String::new();
    for token in &tokens {
        frame.push_str(token);
        frame.push('\n');
    }
    frame.push_str(TERMINATOR);
    frame.push('\n');
    frame.into_bytes()
}

/// Parse one complete frame, terminator included
pub fn decode(bytes: &[u8]) -> Result<BridgeMessage> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| BridgeError::ProtocolError(format!("Frame is not UTF-8: {}", e)))?;

    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    if lines.pop() != Some(TERMINATOR) {
        return Err(BridgeError::ProtocolError("Unterminated frame".into()));
    }

    let mut tokens = lines.into_iter();
    let kind = tokens
        .next()
        .ok_or_else(|| BridgeError::ProtocolError("Empty frame".into()))?;

    let msg = match kind {
        KIND_CALL => {
            let sub = next_token(&mut tokens, "call kind")?;
            let kind = parse_kind_tag(sub)?;
            let target = ObjectId::new(unescape(next_token(&mut tokens, "call target")?)?);
            let member = unescape(next_token(&mut tokens, "call member")?)?;
            let args = tokens.by_ref().map(decode_value).collect::<Result<Vec<_>>>()?;
            BridgeMessage::Call(InvocationRequest {
                target,
                member,
                args,
                kind,
            })
        }
        KIND_RESULT => {
            let value = decode_value(next_token(&mut tokens, "result value")?)?;
            BridgeMessage::Response(InvocationResponse::Success(value))
        }
        KIND_ERROR => {
            let class = expect_string(decode_value(next_token(&mut tokens, "error class")?)?)?;
            let message = expect_string(decode_value(next_token(&mut tokens, "error message")?)?)?;
            let trace = match decode_value(next_token(&mut tokens, "error trace")?)? {
                Value::Null => None,
                Value::String(trace) => Some(trace),
                other => {
                    return Err(BridgeError::ProtocolError(format!(
                        "Error trace must be string or null, got {}",
                        other.type_label()
                    )));
                }
            };
            BridgeMessage::Response(InvocationResponse::Error(ErrorEnvelope {
                error_class_name: class,
                message,
                remote_stack_trace: trace,
            }))
        }
        KIND_RELEASE => {
            BridgeMessage::Release(ObjectId::new(unescape(next_token(&mut tokens, "release id")?)?))
        }
        KIND_AUTH => BridgeMessage::Auth {
            token: unescape(next_token(&mut tokens, "auth token")?)?,
        },
        KIND_SHUTDOWN => BridgeMessage::Shutdown,
        other => {
            return Err(BridgeError::ProtocolError(format!(
                "Unknown message kind: {:?}",
                other
            )));
        }
    };

    if let Some(extra) = tokens.next() {
        return Err(BridgeError::ProtocolError(format!(
            "Unexpected trailing token in {} frame: {:?}",
            msg.kind_label(),
            extra
        )));
    }

    Ok(msg)
}

/// Encode a single value token
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::Null => "n".into(),
        Value::Boolean(b) => format!("b{}", b),
        Value::Integer(i) => format!("i{}", i),
        // Debug output is the shortest form that parses back to the same bits
        Value::Double(d) => format!("d{:?}", d),
        Value::String(s) => format!("s{}", escape(s)),
        Value::ByteArray(bytes) => format!("j{}", hex::encode(bytes)),
        Value::ObjectRef(id) => format!("r{}", escape(id.as_str())),
        Value::ArrayRef(id) => format!("a{}", escape(id.as_str())),
        Value::ListRef(id) => format!("l{}", escape(id.as_str())),
        Value::Proxy { id, capabilities } => {
            let mut token = format!("f{}", escape(id.as_str()));
            for method in capabilities {
                token.push(';');
                token.push_str(&escape(method));
            }
            token
        }
    }
}

/// Decode a single value token
pub fn decode_value(token: &str) -> Result<Value> {
    let mut chars = token.chars();
    let tag = chars
        .next()
        .ok_or_else(|| BridgeError::ProtocolError("Empty value token".into()))?;
    let body = chars.as_str();

    match tag {
        'n' if body.is_empty() => Ok(Value::Null),
        'b' => match body {
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            _ => Err(BridgeError::ProtocolError(format!("Bad boolean: {:?}", body))),
        },
        'i' => body
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| BridgeError::ProtocolError(format!("Bad integer {:?}: {}", body, e))),
        'd' => body
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|e| BridgeError::ProtocolError(format!("Bad double {:?}: {}", body, e))),
        's' => Ok(Value::String(unescape(body)?)),
        'j' => hex::decode(body)
            .map(Value::ByteArray)
            .map_err(|e| BridgeError::ProtocolError(format!("Bad byte array: {}", e))),
        'r' => Ok(Value::ObjectRef(parse_id(body)?)),
        'a' => Ok(Value::ArrayRef(parse_id(body)?)),
        'l' => Ok(Value::ListRef(parse_id(body)?)),
        'f' => {
            let mut parts = split_escaped(body, ';').into_iter();
            let id = parse_id(parts.next().unwrap_or_default())?;
            let capabilities = parts
                .filter(|p| !p.is_empty())
                .map(unescape)
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Proxy { id, capabilities })
        }
        _ => Err(BridgeError::ProtocolError(format!(
            "Unknown value tag: {:?}",
            token
        ))),
    }
}

/// Split on `sep`, skipping separators preceded by a backslash
fn split_escaped(body: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&body[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&body[start..]);
    parts
}

fn parse_id(body: &str) -> Result<ObjectId> {
    if body.is_empty() {
        return Err(BridgeError::ProtocolError("Empty object id".into()));
    }
    Ok(ObjectId::new(unescape(body)?))
}

fn expect_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(BridgeError::ProtocolError(format!(
            "Expected string token, got {}",
            other.type_label()
        ))),
    }
}

fn next_token<'a>(tokens: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<&'a str> {
    tokens
        .next()
        .ok_or_else(|| BridgeError::ProtocolError(format!("Truncated frame: missing {}", what)))
}

fn kind_tag(kind: InvocationKind) -> &'static str {
    match kind {
        InvocationKind::MethodCall => "m",
        InvocationKind::FieldGet => "g",
        InvocationKind::FieldSet => "s",
        InvocationKind::ConstructorCall => "i",
    }
}

fn parse_kind_tag(tag: &str) -> Result<InvocationKind> {
    match tag {
        "m" => Ok(InvocationKind::MethodCall),
        "g" => Ok(InvocationKind::FieldGet),
        "s" => Ok(InvocationKind::FieldSet),
        "i" => Ok(InvocationKind::ConstructorCall),
        other => Err(BridgeError::ProtocolError(format!(
            "Unknown call kind: {:?}",
            other
        ))),
    }
}

/// Escape a raw string so it fits on one line and never reads as the terminator
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, c) in raw.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ';' => out.push_str("\\;"),
            '.' if i == 0 => out.push_str("\\."),
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`]
pub fn unescape(escaped: &str) -> Result<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(';') => out.push(';'),
            Some('.') => out.push('.'),
            other => {
                return Err(BridgeError::ProtocolError(format!(
                    "Bad escape sequence: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_value(value: Value) {
        let msg = BridgeMessage::Response(InvocationResponse::Success(value.clone()));
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg, "value did not survive: {:?}", value);
    }

    #[test]
    fn test_value_roundtrip_boundaries() {
        for value in [
            Value::Null,
            Value::Boolean(false),
            Value::Integer(i64::MIN),
            Value::Integer(i64::MAX),
            Value::Integer(-1),
            Value::Double(f64::NAN),
            Value::Double(f64::INFINITY),
            Value::Double(f64::NEG_INFINITY),
            Value::Double(-0.0),
            Value::Double(f64::MIN_POSITIVE),
            Value::Double(1e300),
            Value::String(String::new()),
            Value::String("line\nbreak\\slash\r.".into()),
            Value::String(".".into()),
            Value::ByteArray(Vec::new()),
            Value::ByteArray(vec![0, 255, 16]),
            Value::ListRef(ObjectId::from(3u64)),
            Value::Proxy {
                id: ObjectId::from("p0"),
                capabilities: vec!["invoke".into(), "odd;name".into()],
            },
        ] {
            roundtrip_value(value);
        }
    }

    #[test]
    fn test_call_frame_layout() {
        let msg = BridgeMessage::Call(InvocationRequest::method(
            "0",
            "add",
            vec![Value::Integer(2), Value::Integer(3)],
        ));
        let bytes = encode(&msg);
        assert_eq!(bytes, b"c\nm\n0\nadd\ni2\ni3\n.\n");
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let envelope = ErrorEnvelope::new("ArithmeticError", "divide by zero")
            .with_stack_trace("at Calculator.divide");
        let msg = BridgeMessage::Response(InvocationResponse::Error(envelope));
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_constructor_and_control_frames() {
        for msg in [
            BridgeMessage::Call(InvocationRequest::constructor("Counter", vec![Value::Integer(1)])),
            BridgeMessage::Call(InvocationRequest::field_set("4", "name", Value::from("x"))),
            BridgeMessage::Release(ObjectId::from("9")),
            BridgeMessage::Auth {
                token: "s3cret;token".into(),
            },
            BridgeMessage::Shutdown,
        ] {
            assert_eq!(decode(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn test_unknown_tags_are_protocol_errors() {
        let frames: [&[u8]; 7] = [
            b"x\n.\n",
            b"r\nq12\n.\n",
            b"c\nz\n0\nadd\n.\n",
            b"r\ni12\n",
            b"r\ni12\ni13\n.\n",
            b"r\ns\\q\n.\n",
            b"r\n\xff\n.\n",
        ];
        for frame in frames {
            match decode(frame) {
                Err(BridgeError::ProtocolError(_)) => {}
                other => panic!("Expected protocol error for {:?}, got {:?}", frame, other),
            }
        }
    }

    #[test]
    fn test_crlf_frames_accepted() {
        let decoded = decode(b"r\r\ni5\r\n.\r\n").unwrap();
        assert_eq!(
            decoded,
            BridgeMessage::Response(InvocationResponse::Success(Value::Integer(5)))
        );
    }
}
