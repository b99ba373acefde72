//! Compact binary term encoding, offered by the gateway as an alternative to JSON.
//!
//! Only the subset of the external term format used by the gateway is handled.
//! Terms are mapped onto a small tagged [`Value`] tree, which converts to and from
//! [`serde_json::Value`] so that the same payload types serve both encodings.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use std::{error::Error as StdError, fmt};

const FORMAT_VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Nesting depth past which decoding is refused.
const MAX_DEPTH: usize = 256;

/// A decoded term.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The `nil`/`null` atoms.
    Null,
    /// The `true`/`false` atoms.
    Bool(bool),
    /// Any integer, whether sent as a small, 32-bit, or big integer.
    Integer(i128),
    /// A 64-bit float.
    Float(f64),
    /// A binary, string, or non-special atom.
    String(String),
    /// A proper list.
    List(Vec<Value>),
    /// A map, in wire order.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Looks up `key` in a map with string keys.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| matches!(k, Value::String(s) if s == key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Encodes a term, including the leading format version byte.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = vec![FORMAT_VERSION];
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => encode_atom("nil", out),
        Value::Bool(true) => encode_atom("true", out),
        Value::Bool(false) => encode_atom("false", out),
        Value::Integer(i) => encode_integer(*i, out),
        Value::Float(f) => {
            out.push(NEW_FLOAT_EXT);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        },
        Value::String(s) => {
            out.push(BINARY_EXT);
            push_u32(out, s.len());
            out.extend_from_slice(s.as_bytes());
        },
        Value::List(items) if items.is_empty() => out.push(NIL_EXT),
        Value::List(items) => {
            out.push(LIST_EXT);
            push_u32(out, items.len());
            for item in items {
                encode_into(item, out);
            }
            out.push(NIL_EXT);
        },
        Value::Map(pairs) => {
            out.push(MAP_EXT);
            push_u32(out, pairs.len());
            for (k, v) in pairs {
                encode_into(k, out);
                encode_into(v, out);
            }
        },
    }
}

fn push_u32(out: &mut Vec<u8>, len: usize) {
    // Writes into a Vec cannot fail.
    let _ = out.write_u32::<BigEndian>(len as u32);
}

fn encode_atom(name: &str, out: &mut Vec<u8>) {
    out.push(SMALL_ATOM_UTF8_EXT);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn encode_integer(i: i128, out: &mut Vec<u8>) {
    if (0..=255).contains(&i) {
        out.push(SMALL_INTEGER_EXT);
        out.push(i as u8);
    } else if i32::try_from(i).is_ok() {
        out.push(INTEGER_EXT);
        let _ = out.write_i32::<BigEndian>(i as i32);
    } else {
        let mut magnitude = i.unsigned_abs().to_le_bytes().to_vec();
        while magnitude.last() == Some(&0) {
            magnitude.pop();
        }

        out.push(SMALL_BIG_EXT);
        out.push(magnitude.len() as u8);
        out.push(u8::from(i < 0));
        out.extend_from_slice(&magnitude);
    }
}

/// Decodes a single term, which must span all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader { buf: bytes };

    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(Error::BadVersion(version));
    }

    let value = reader.term(0)?;

    if reader.buf.is_empty() {
        Ok(value)
    } else {
        Err(Error::TrailingBytes(reader.buf.len()))
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8> {
        self.buf.read_u8().map_err(|_| Error::Truncated)
    }

    fn u16(&mut self) -> Result<u16> {
        self.buf.read_u16::<BigEndian>().map_err(|_| Error::Truncated)
    }

    fn u32(&mut self) -> Result<u32> {
        self.buf.read_u32::<BigEndian>().map_err(|_| Error::Truncated)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(Error::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn term(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::TooDeep);
        }

        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Value::Integer(self.u8()?.into())),
            INTEGER_EXT => self
                .buf
                .read_i32::<BigEndian>()
                .map(|i| Value::Integer(i.into()))
                .map_err(|_| Error::Truncated),
            SMALL_BIG_EXT => {
                let len = self.u8()? as usize;
                self.big(len)
            },
            LARGE_BIG_EXT => {
                let len = self.u32()? as usize;
                self.big(len)
            },
            NEW_FLOAT_EXT => {
                let raw = self.buf.read_u64::<BigEndian>().map_err(|_| Error::Truncated)?;
                Ok(Value::Float(f64::from_bits(raw)))
            },
            FLOAT_EXT => {
                let raw = self.take(31)?;
                let text = std::str::from_utf8(raw).map_err(|_| Error::InvalidUtf8)?;
                text.trim_end_matches('\0')
                    .trim()
                    .parse()
                    .map(Value::Float)
                    .map_err(|_| Error::BadFloat)
            },
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                self.atom(len)
            },
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                self.atom(len)
            },
            BINARY_EXT => {
                let len = self.u32()? as usize;
                let raw = self.take(len)?;
                String::from_utf8(raw.to_vec())
                    .map(Value::String)
                    .map_err(|_| Error::InvalidUtf8)
            },
            STRING_EXT => {
                let len = self.u16()? as usize;
                let raw = self.take(len)?;
                Ok(Value::String(raw.iter().map(|&b| b as char).collect()))
            },
            NIL_EXT => Ok(Value::List(vec![])),
            LIST_EXT => {
                let len = self.u32()? as usize;
                // Each element occupies at least one byte.
                if len > self.buf.len() {
                    return Err(Error::Truncated);
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.term(depth + 1)?);
                }
                match self.term(depth + 1)? {
                    Value::List(tail) if tail.is_empty() => Ok(Value::List(items)),
                    _ => Err(Error::ImproperList),
                }
            },
            MAP_EXT => {
                let len = self.u32()? as usize;
                if len.saturating_mul(2) > self.buf.len() {
                    return Err(Error::Truncated);
                }
                let mut pairs = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = self.term(depth + 1)?;
                    let v = self.term(depth + 1)?;
                    pairs.push((k, v));
                }
                Ok(Value::Map(pairs))
            },
            other => Err(Error::UnknownTag(other)),
        }
    }

    fn big(&mut self, len: usize) -> Result<Value> {
        let sign = self.u8()?;
        let digits = self.take(len)?;

        if digits.iter().skip(16).any(|&b| b != 0) {
            return Err(Error::IntegerOverflow);
        }

        let mut magnitude = [0u8; 16];
        let used = digits.len().min(16);
        magnitude[..used].copy_from_slice(&digits[..used]);
        let magnitude = u128::from_le_bytes(magnitude);

        let value = if sign == 0 {
            i128::try_from(magnitude).map_err(|_| Error::IntegerOverflow)?
        } else if magnitude == i128::MIN.unsigned_abs() {
            i128::MIN
        } else {
            -i128::try_from(magnitude).map_err(|_| Error::IntegerOverflow)?
        };

        Ok(Value::Integer(value))
    }

    fn atom(&mut self, len: usize) -> Result<Value> {
        let raw = self.take(len)?;
        let name = std::str::from_utf8(raw).map_err(|_| Error::InvalidUtf8)?;

        Ok(match name {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "nil" | "null" => Value::Null,
            other => Value::String(other.to_owned()),
        })
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) =>
                if let Some(i) = n.as_i64() {
                    Value::Integer(i.into())
                } else if let Some(u) = n.as_u64() {
                    Value::Integer(u.into())
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                },
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (Value::String(k), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl TryFrom<Value> for JsonValue {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Ok(match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(b),
            Value::Integer(i) =>
                if let Ok(small) = i64::try_from(i) {
                    small.into()
                } else {
                    u64::try_from(i).map_err(|_| Error::IntegerOverflow)?.into()
                },
            Value::Float(f) => Number::from_f64(f)
                .map(JsonValue::Number)
                .ok_or(Error::BadFloat)?,
            Value::String(s) => JsonValue::String(s),
            Value::List(items) => JsonValue::Array(
                items
                    .into_iter()
                    .map(JsonValue::try_from)
                    .collect::<Result<_>>()?,
            ),
            Value::Map(pairs) => {
                let mut map = JsonMap::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match k {
                        Value::String(s) => s,
                        Value::Integer(i) => i.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return Err(Error::NonStringKey),
                    };
                    map.insert(key, JsonValue::try_from(v)?);
                }
                JsonValue::Object(map)
            },
        })
    }
}

/// Serializes any value into a term via its JSON representation.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_value(value)?;
    Ok(encode(&Value::from(json)))
}

/// Deserializes any value from a term via its JSON representation.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let json = JsonValue::try_from(decode(bytes)?)?;
    Ok(serde_json::from_value(json)?)
}

/// Errors encountered while decoding terms.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The leading version byte was not 131.
    BadVersion(u8),
    /// A float could not be parsed or represented.
    BadFloat,
    /// A list had a tail other than the empty list.
    ImproperList,
    /// An integer did not fit the representable range.
    IntegerOverflow,
    /// A binary or atom held invalid UTF-8.
    InvalidUtf8,
    /// A map key could not be used as a JSON object key.
    NonStringKey,
    /// Terms were nested too deeply.
    TooDeep,
    /// Bytes remained after the top-level term.
    TrailingBytes(usize),
    /// The input ended before the term was complete.
    Truncated,
    /// An unsupported term tag was seen.
    UnknownTag(u8),
    /// The JSON mapping of a term did not match the target type.
    Json(serde_json::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to decode term: ")?;
        use Error::*;
        match self {
            BadVersion(v) => write!(f, "unknown format version {}", v),
            BadFloat => write!(f, "unrepresentable float"),
            ImproperList => write!(f, "improper list tail"),
            IntegerOverflow => write!(f, "integer out of range"),
            InvalidUtf8 => write!(f, "invalid UTF-8 in string"),
            NonStringKey => write!(f, "map key cannot become an object key"),
            TooDeep => write!(f, "terms nested too deeply"),
            TrailingBytes(n) => write!(f, "{} trailing bytes", n),
            Truncated => write!(f, "input truncated"),
            UnknownTag(t) => write!(f, "unsupported tag {}", t),
            Json(e) => e.fmt(f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenience type for term decoding.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> Value {
        Value::Map(vec![
            (Value::String("op".into()), Value::Integer(0)),
            (Value::String("s".into()), Value::Integer(42_000)),
            (Value::String("t".into()), Value::String("MESSAGE_CREATE".into())),
            (
                Value::String("d".into()),
                Value::Map(vec![
                    (
                        Value::String("id".into()),
                        Value::Integer(1_093_284_759_123_456_789),
                    ),
                    (Value::String("neg".into()), Value::Integer(-9_000_000_000)),
                    (Value::String("ratio".into()), Value::Float(0.25)),
                    (Value::String("tts".into()), Value::Bool(false)),
                    (Value::String("pinned".into()), Value::Bool(true)),
                    (Value::String("nonce".into()), Value::Null),
                    (Value::String("embeds".into()), Value::List(vec![])),
                    (
                        Value::String("mentions".into()),
                        Value::List(vec![
                            Value::Integer(-1),
                            Value::String("caf\u{e9}".into()),
                            Value::List(vec![Value::Integer(255), Value::Integer(256)]),
                        ]),
                    ),
                ]),
            ),
        ])
    }

    #[test]
    fn nested_tree_round_trips() {
        let tree = sample_tree();
        assert_eq!(decode(&encode(&tree)).unwrap(), tree);
    }

    #[test]
    fn every_truncation_is_an_error() {
        let bytes = encode(&sample_tree());
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "prefix of {} bytes", cut);
        }
    }

    #[test]
    fn integer_encodings() {
        assert_eq!(encode(&Value::Integer(7)), vec![131, SMALL_INTEGER_EXT, 7]);
        assert_eq!(
            encode(&Value::Integer(-2)),
            vec![131, INTEGER_EXT, 0xff, 0xff, 0xff, 0xfe]
        );
        assert_eq!(
            encode(&Value::Integer(1 << 40)),
            vec![131, SMALL_BIG_EXT, 6, 0, 0, 0, 0, 0, 0, 1]
        );
        assert_eq!(
            encode(&Value::Integer(-(1 << 40))),
            vec![131, SMALL_BIG_EXT, 6, 1, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn special_atoms_decode() {
        let atom = |name: &str| {
            let mut out = vec![131, ATOM_EXT, 0, name.len() as u8];
            out.extend_from_slice(name.as_bytes());
            decode(&out).unwrap()
        };

        assert_eq!(atom("true"), Value::Bool(true));
        assert_eq!(atom("false"), Value::Bool(false));
        assert_eq!(atom("nil"), Value::Null);
        assert_eq!(atom("null"), Value::Null);
        assert_eq!(atom("ok"), Value::String("ok".into()));
    }

    #[test]
    fn oversized_list_count_is_rejected() {
        let bytes = [131, LIST_EXT, 0xff, 0xff, 0xff, 0xff, NIL_EXT];
        assert!(matches!(decode(&bytes), Err(Error::Truncated)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&Value::Null);
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(Error::TrailingBytes(1))));
    }

    #[test]
    fn json_mapping_matches_gateway_shapes() {
        let payload = json!({
            "op": 10,
            "d": { "heartbeat_interval": 41250, "_trace": ["gw-1"] },
            "s": null,
            "t": null,
        });

        let bytes = to_vec(&payload).unwrap();
        let back: JsonValue = from_slice(&bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn big_snowflakes_become_json_numbers() {
        let term = Value::Map(vec![(
            Value::String("id".into()),
            Value::Integer(u64::MAX.into()),
        )]);
        let json = JsonValue::try_from(term).unwrap();
        assert_eq!(json["id"].as_u64(), Some(u64::MAX));
    }
}
