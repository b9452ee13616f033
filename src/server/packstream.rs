//! PackStream codec — the tagged binary value format of the Bolt protocol.
//!
//! Integers use the shortest form that fits, floats are IEEE-754 big-endian,
//! strings are length-prefixed UTF-8, lists and maps nest, and graph
//! entities ride in structures (Node 0x4E, Relationship 0x52, Path 0x50).
//! Inbound values from clients only use the data variants; structures only
//! arrive as message envelopes and are decoded by the Bolt layer.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::model::{Node, Path, Relationship, Value};
use crate::{Error, Result};

pub const STRUCT_NODE: u8 = 0x4E;
pub const STRUCT_RELATIONSHIP: u8 = 0x52;
pub const STRUCT_PATH: u8 = 0x50;
pub const STRUCT_UNBOUND_REL: u8 = 0x72;

// ============================================================================
// Encoding
// ============================================================================

pub fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(0xC0),
        Value::Bool(false) => buf.put_u8(0xC2),
        Value::Bool(true) => buf.put_u8(0xC3),
        Value::Int(i) => encode_int(buf, *i),
        Value::Float(f) => {
            buf.put_u8(0xC1);
            buf.put_f64(*f);
        }
        Value::String(s) => encode_string(buf, s),
        Value::Bytes(b) => {
            match b.len() {
                len if len <= 0xFF => {
                    buf.put_u8(0xCC);
                    buf.put_u8(len as u8);
                }
                len if len <= 0xFFFF => {
                    buf.put_u8(0xCD);
                    buf.put_u16(len as u16);
                }
                len => {
                    buf.put_u8(0xCE);
                    buf.put_u32(len as u32);
                }
            }
            buf.put_slice(b);
        }
        Value::List(items) => {
            encode_list_header(buf, items.len());
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Map(map) => {
            encode_map_header(buf, map.len());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                encode_string(buf, key);
                encode_value(buf, &map[key]);
            }
        }
        Value::Node(node) => encode_node(buf, node),
        Value::Relationship(rel) => encode_relationship(buf, rel),
        Value::Path(path) => encode_path(buf, path),
    }
}

pub fn encode_int(buf: &mut BytesMut, i: i64) {
    match i {
        -16..=127 => buf.put_i8(i as i8),
        -128..=127 => {
            buf.put_u8(0xC8);
            buf.put_i8(i as i8);
        }
        -32_768..=32_767 => {
            buf.put_u8(0xC9);
            buf.put_i16(i as i16);
        }
        -2_147_483_648..=2_147_483_647 => {
            buf.put_u8(0xCA);
            buf.put_i32(i as i32);
        }
        _ => {
            buf.put_u8(0xCB);
            buf.put_i64(i);
        }
    }
}

pub fn encode_string(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    match bytes.len() {
        len if len <= 0x0F => buf.put_u8(0x80 | len as u8),
        len if len <= 0xFF => {
            buf.put_u8(0xD0);
            buf.put_u8(len as u8);
        }
        len if len <= 0xFFFF => {
            buf.put_u8(0xD1);
            buf.put_u16(len as u16);
        }
        len => {
            buf.put_u8(0xD2);
            buf.put_u32(len as u32);
        }
    }
    buf.put_slice(bytes);
}

pub fn encode_list_header(buf: &mut BytesMut, len: usize) {
    match len {
        len if len <= 0x0F => buf.put_u8(0x90 | len as u8),
        len if len <= 0xFF => {
            buf.put_u8(0xD4);
            buf.put_u8(len as u8);
        }
        len if len <= 0xFFFF => {
            buf.put_u8(0xD5);
            buf.put_u16(len as u16);
        }
        len => {
            buf.put_u8(0xD6);
            buf.put_u32(len as u32);
        }
    }
}

pub fn encode_map_header(buf: &mut BytesMut, len: usize) {
    match len {
        len if len <= 0x0F => buf.put_u8(0xA0 | len as u8),
        len if len <= 0xFF => {
            buf.put_u8(0xD8);
            buf.put_u8(len as u8);
        }
        len if len <= 0xFFFF => {
            buf.put_u8(0xD9);
            buf.put_u16(len as u16);
        }
        len => {
            buf.put_u8(0xDA);
            buf.put_u32(len as u32);
        }
    }
}

pub fn encode_struct_header(buf: &mut BytesMut, tag: u8, fields: usize) {
    buf.put_u8(0xB0 | fields as u8);
    buf.put_u8(tag);
}

fn encode_node(buf: &mut BytesMut, node: &Node) {
    encode_struct_header(buf, STRUCT_NODE, 4);
    encode_int(buf, node.id.0 as i64);
    encode_list_header(buf, node.labels.len());
    for label in &node.labels {
        encode_string(buf, label);
    }
    encode_value(buf, &Value::Map(node.properties.clone()));
    encode_string(buf, &node.element_id());
}

fn encode_relationship(buf: &mut BytesMut, rel: &Relationship) {
    encode_struct_header(buf, STRUCT_RELATIONSHIP, 8);
    encode_int(buf, rel.id.0 as i64);
    encode_int(buf, rel.src.0 as i64);
    encode_int(buf, rel.dst.0 as i64);
    encode_string(buf, &rel.rel_type);
    encode_value(buf, &Value::Map(rel.properties.clone()));
    encode_string(buf, &rel.element_id());
    encode_string(buf, &format!("4:mnemograph:{}", rel.src.0));
    encode_string(buf, &format!("4:mnemograph:{}", rel.dst.0));
}

/// Path structure: nodes, unbound relationships, and the alternating index
/// sequence that threads them together.
fn encode_path(buf: &mut BytesMut, path: &Path) {
    encode_struct_header(buf, STRUCT_PATH, 3);

    encode_list_header(buf, path.nodes.len());
    for node in &path.nodes {
        encode_node(buf, node);
    }

    encode_list_header(buf, path.relationships.len());
    for rel in &path.relationships {
        encode_struct_header(buf, STRUCT_UNBOUND_REL, 4);
        encode_int(buf, rel.id.0 as i64);
        encode_string(buf, &rel.rel_type);
        encode_value(buf, &Value::Map(rel.properties.clone()));
        encode_string(buf, &rel.element_id());
    }

    // Indices: (rel_index, node_index) pairs; negative rel index means the
    // relationship was traversed against its direction.
    encode_list_header(buf, path.relationships.len() * 2);
    for (i, rel) in path.relationships.iter().enumerate() {
        let forward = rel.src == path.nodes[i].id;
        let rel_index = (i + 1) as i64;
        encode_int(buf, if forward { rel_index } else { -rel_index });
        encode_int(buf, (i + 1) as i64);
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one value. Structures decode to `(tag, fields)` via
/// [`decode_struct_header`]; this function handles the data variants.
pub fn decode_value(buf: &mut BytesMut) -> Result<Value> {
    let marker = peek_u8(buf)?;
    match marker {
        0xC0 => {
            buf.advance(1);
            Ok(Value::Null)
        }
        0xC2 => {
            buf.advance(1);
            Ok(Value::Bool(false))
        }
        0xC3 => {
            buf.advance(1);
            Ok(Value::Bool(true))
        }
        0xC1 => {
            buf.advance(1);
            need(buf, 8)?;
            Ok(Value::Float(buf.get_f64()))
        }
        // Tiny ints
        0x00..=0x7F => {
            buf.advance(1);
            Ok(Value::Int(i64::from(marker as i8)))
        }
        0xF0..=0xFF => {
            buf.advance(1);
            Ok(Value::Int(i64::from(marker as i8)))
        }
        0xC8 => {
            buf.advance(1);
            need(buf, 1)?;
            Ok(Value::Int(i64::from(buf.get_i8())))
        }
        0xC9 => {
            buf.advance(1);
            need(buf, 2)?;
            Ok(Value::Int(i64::from(buf.get_i16())))
        }
        0xCA => {
            buf.advance(1);
            need(buf, 4)?;
            Ok(Value::Int(i64::from(buf.get_i32())))
        }
        0xCB => {
            buf.advance(1);
            need(buf, 8)?;
            Ok(Value::Int(buf.get_i64()))
        }
        // Strings
        0x80..=0x8F => decode_string_body(buf, (marker & 0x0F) as usize, 1),
        0xD0 => {
            need(buf, 2)?;
            let len = buf[1] as usize;
            decode_string_body(buf, len, 2)
        }
        0xD1 => {
            need(buf, 3)?;
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            decode_string_body(buf, len, 3)
        }
        0xD2 => {
            need(buf, 5)?;
            let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            decode_string_body(buf, len, 5)
        }
        // Bytes
        0xCC | 0xCD | 0xCE => {
            buf.advance(1);
            let len = match marker {
                0xCC => {
                    need(buf, 1)?;
                    buf.get_u8() as usize
                }
                0xCD => {
                    need(buf, 2)?;
                    buf.get_u16() as usize
                }
                _ => {
                    need(buf, 4)?;
                    buf.get_u32() as usize
                }
            };
            need(buf, len)?;
            Ok(Value::Bytes(buf.split_to(len).to_vec()))
        }
        // Lists
        0x90..=0x9F => decode_list_body(buf, (marker & 0x0F) as usize, 1),
        0xD4 => {
            need(buf, 2)?;
            let len = buf[1] as usize;
            decode_list_body(buf, len, 2)
        }
        0xD5 => {
            need(buf, 3)?;
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            decode_list_body(buf, len, 3)
        }
        0xD6 => {
            need(buf, 5)?;
            let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            decode_list_body(buf, len, 5)
        }
        // Maps
        0xA0..=0xAF => decode_map_body(buf, (marker & 0x0F) as usize, 1),
        0xD8 => {
            need(buf, 2)?;
            let len = buf[1] as usize;
            decode_map_body(buf, len, 2)
        }
        0xD9 => {
            need(buf, 3)?;
            let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            decode_map_body(buf, len, 3)
        }
        0xDA => {
            need(buf, 5)?;
            let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            decode_map_body(buf, len, 5)
        }
        other => Err(protocol_error(format!(
            "unsupported PackStream marker 0x{other:02X}"
        ))),
    }
}

/// Decode a structure header, returning (tag, field count).
pub fn decode_struct_header(buf: &mut BytesMut) -> Result<(u8, usize)> {
    let marker = peek_u8(buf)?;
    if marker & 0xF0 != 0xB0 {
        return Err(protocol_error(format!(
            "expected structure, found marker 0x{marker:02X}"
        )));
    }
    need(buf, 2)?;
    let fields = (marker & 0x0F) as usize;
    buf.advance(1);
    let tag = buf.get_u8();
    Ok((tag, fields))
}

pub fn decode_string(buf: &mut BytesMut) -> Result<String> {
    match decode_value(buf)? {
        Value::String(s) => Ok(s),
        other => Err(protocol_error(format!(
            "expected string, found {}",
            other.type_name()
        ))),
    }
}

pub fn decode_map(buf: &mut BytesMut) -> Result<HashMap<String, Value>> {
    match decode_value(buf)? {
        Value::Map(m) => Ok(m),
        other => Err(protocol_error(format!(
            "expected map, found {}",
            other.type_name()
        ))),
    }
}

fn decode_string_body(buf: &mut BytesMut, len: usize, header: usize) -> Result<Value> {
    need(buf, header + len)?;
    buf.advance(header);
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map(Value::String)
        .map_err(|_| protocol_error("invalid UTF-8 in string".into()))
}

fn decode_list_body(buf: &mut BytesMut, len: usize, header: usize) -> Result<Value> {
    need(buf, header)?;
    buf.advance(header);
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(decode_value(buf)?);
    }
    Ok(Value::List(items))
}

fn decode_map_body(buf: &mut BytesMut, len: usize, header: usize) -> Result<Value> {
    need(buf, header)?;
    buf.advance(header);
    let mut map = HashMap::with_capacity(len.min(1024));
    for _ in 0..len {
        let key = decode_string(buf)?;
        map.insert(key, decode_value(buf)?);
    }
    Ok(Value::Map(map))
}

fn peek_u8(buf: &BytesMut) -> Result<u8> {
    buf.first()
        .copied()
        .ok_or_else(|| protocol_error("unexpected end of message".into()))
}

fn need(buf: &BytesMut, n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(protocol_error("unexpected end of message".into()));
    }
    Ok(())
}

fn protocol_error(message: String) -> Error {
    Error::ExecutionError(format!("Bolt protocol error: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;

    fn roundtrip(value: Value) -> Value {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &value);
        decode_value(&mut buf).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip() {
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Int(42)), Value::Int(42));
        assert_eq!(roundtrip(Value::Int(-1)), Value::Int(-1));
        assert_eq!(roundtrip(Value::Int(70_000)), Value::Int(70_000));
        assert_eq!(roundtrip(Value::Int(i64::MIN)), Value::Int(i64::MIN));
        assert_eq!(roundtrip(Value::Float(3.25)), Value::Float(3.25));
        assert_eq!(
            roundtrip(Value::String("hello".into())),
            Value::String("hello".into())
        );
    }

    #[test]
    fn test_tiny_int_is_one_byte() {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &Value::Int(7));
        assert_eq!(buf.len(), 1);
        encode_value(&mut buf, &Value::Int(-16));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_long_string_header() {
        let long = "x".repeat(300);
        assert_eq!(roundtrip(Value::String(long.clone())), Value::String(long));
    }

    #[test]
    fn test_collection_roundtrip() {
        let value = Value::List(vec![
            Value::Int(1),
            Value::String("two".into()),
            Value::Map(HashMap::from([("k".to_owned(), Value::Bool(false))])),
        ]);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn test_node_structure_layout() {
        let node = Node::new(NodeId(7))
            .with_labels(["Person"])
            .with_property("name", "Ada");
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &Value::Node(Box::new(node)));

        let (tag, fields) = decode_struct_header(&mut buf).unwrap();
        assert_eq!(tag, STRUCT_NODE);
        assert_eq!(fields, 4);
        assert_eq!(decode_value(&mut buf).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_truncated_input_is_error() {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &Value::String("hello".into()));
        buf.truncate(buf.len() - 1);
        assert!(decode_value(&mut buf).is_err());
    }
}
