//! KV key layout.
//!
//! Every persistent entity lives under a stable prefix:
//!
//! | Prefix | Contents |
//! |---|---|
//! | `N:<id>` | serialized node |
//! | `E:<id>` | serialized relationship |
//! | `AO:<src>:<type>:<dst>:<edge>` | outgoing adjacency (empty value) |
//! | `AI:<dst>:<type>:<src>:<edge>` | incoming adjacency (empty value) |
//! | `L:<label>:<id>` | label index (empty value) |
//! | `P:<label>:<key>:<enc-value>:<id>` | property index (empty value) |
//! | `C:<label>:<keys>:<enc-values>:<id>` | composite index (empty value) |
//! | `U:<label>:<key>:<enc-value>` | unique constraint (value = node id) |
//! | `S:...` | schema registry (index and constraint definitions) |
//! | `M:...` | meta (id counters) |
//!
//! Ids are zero-padded to 20 digits so lexicographic order equals numeric
//! order inside a prefix.

use crate::model::{NodeId, RelId, Value};

use super::encoding::encode_value;

pub const NODE_PREFIX: &[u8] = b"N:";
pub const REL_PREFIX: &[u8] = b"E:";

pub fn node_key(id: NodeId) -> Vec<u8> {
    format!("N:{:020}", id.0).into_bytes()
}

pub fn rel_key(id: RelId) -> Vec<u8> {
    format!("E:{:020}", id.0).into_bytes()
}

pub fn adj_out_key(src: NodeId, rel_type: &str, dst: NodeId, edge: RelId) -> Vec<u8> {
    format!("AO:{:020}:{}:{:020}:{:020}", src.0, rel_type, dst.0, edge.0).into_bytes()
}

pub fn adj_in_key(dst: NodeId, rel_type: &str, src: NodeId, edge: RelId) -> Vec<u8> {
    format!("AI:{:020}:{}:{:020}:{:020}", dst.0, rel_type, src.0, edge.0).into_bytes()
}

pub fn adj_out_prefix(src: NodeId) -> Vec<u8> {
    format!("AO:{:020}:", src.0).into_bytes()
}

pub fn adj_out_type_prefix(src: NodeId, rel_type: &str) -> Vec<u8> {
    format!("AO:{:020}:{}:", src.0, rel_type).into_bytes()
}

pub fn adj_in_prefix(dst: NodeId) -> Vec<u8> {
    format!("AI:{:020}:", dst.0).into_bytes()
}

pub fn adj_in_type_prefix(dst: NodeId, rel_type: &str) -> Vec<u8> {
    format!("AI:{:020}:{}:", dst.0, rel_type).into_bytes()
}

pub fn label_key(label: &str, id: NodeId) -> Vec<u8> {
    format!("L:{}:{:020}", label, id.0).into_bytes()
}

pub fn label_prefix(label: &str) -> Vec<u8> {
    format!("L:{label}:").into_bytes()
}

pub fn prop_prefix(label: &str, key: &str) -> Vec<u8> {
    format!("P:{label}:{key}:").into_bytes()
}

pub fn prop_key(label: &str, key: &str, value: &Value, id: NodeId) -> Vec<u8> {
    let mut out = prop_prefix(label, key);
    out.extend_from_slice(&encode_value(value));
    out.extend_from_slice(format!(":{:020}", id.0).as_bytes());
    out
}

/// Prefix matching every entry with this exact value, any node id.
pub fn prop_value_prefix(label: &str, key: &str, value: &Value) -> Vec<u8> {
    let mut out = prop_prefix(label, key);
    out.extend_from_slice(&encode_value(value));
    out.push(b':');
    out
}

pub fn composite_prefix(label: &str, keys: &[String]) -> Vec<u8> {
    format!("C:{}:{}:", label, keys.join(",")).into_bytes()
}

pub fn composite_key(label: &str, keys: &[String], values: &[Value], id: NodeId) -> Vec<u8> {
    let mut out = composite_prefix(label, keys);
    for value in values {
        out.extend_from_slice(&encode_value(value));
    }
    out.extend_from_slice(format!(":{:020}", id.0).as_bytes());
    out
}

pub fn composite_value_prefix(label: &str, keys: &[String], values: &[Value]) -> Vec<u8> {
    let mut out = composite_prefix(label, keys);
    for value in values {
        out.extend_from_slice(&encode_value(value));
    }
    if values.len() == keys.len() {
        out.push(b':');
    }
    out
}

pub fn unique_key(label: &str, key: &str, value: &Value) -> Vec<u8> {
    let mut out = format!("U:{label}:{key}:").into_bytes();
    out.extend_from_slice(&encode_value(value));
    out
}

pub fn schema_key(kind: &str, name: &str) -> Vec<u8> {
    format!("S:{kind}:{name}").into_bytes()
}

pub fn schema_prefix(kind: &str) -> Vec<u8> {
    format!("S:{kind}:").into_bytes()
}

pub const META_NEXT_NODE_ID: &[u8] = b"M:next_node_id";
pub const META_NEXT_REL_ID: &[u8] = b"M:next_rel_id";

/// Parse the trailing `:{id:020}` suffix of an index or adjacency key.
pub fn trailing_id(key: &[u8]) -> Option<u64> {
    if key.len() < 21 {
        return None;
    }
    let tail = &key[key.len() - 20..];
    if key[key.len() - 21] != b':' {
        return None;
    }
    std::str::from_utf8(tail).ok()?.parse().ok()
}

/// Split an adjacency key into (near id, rel type, far id, edge id).
pub fn parse_adjacency(key: &[u8]) -> Option<(u64, String, u64, u64)> {
    let text = std::str::from_utf8(key).ok()?;
    let rest = text
        .strip_prefix("AO:")
        .or_else(|| text.strip_prefix("AI:"))?;
    // <near:020>:<type>:<far:020>:<edge:020> — the type may itself not
    // contain ':' (validated at creation), so splitting from both ends is safe.
    let (near, rest) = rest.split_once(':')?;
    let (rest, edge) = rest.rsplit_once(':')?;
    let (rest, far) = rest.rsplit_once(':')?;
    Some((
        near.parse().ok()?,
        rest.to_owned(),
        far.parse().ok()?,
        edge.parse().ok()?,
    ))
}

/// Labels, relationship types and indexed property keys become key path
/// segments; reject the separator so keys stay parseable.
pub fn validate_token(kind: &str, token: &str) -> crate::Result<()> {
    if token.is_empty() {
        return Err(crate::Error::SemanticError(format!("{kind} must not be empty")));
    }
    if token.contains(':') {
        return Err(crate::Error::SemanticError(format!(
            "{kind} '{token}' must not contain ':'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_ordering() {
        assert!(node_key(NodeId(2)) < node_key(NodeId(10)));
        assert!(node_key(NodeId(999)) < node_key(NodeId(1000)));
    }

    #[test]
    fn test_trailing_id() {
        let key = label_key("Person", NodeId(42));
        assert_eq!(trailing_id(&key), Some(42));
    }

    #[test]
    fn test_parse_adjacency() {
        let key = adj_out_key(NodeId(1), "KNOWS", NodeId(2), RelId(7));
        let (near, rel_type, far, edge) = parse_adjacency(&key).unwrap();
        assert_eq!((near, rel_type.as_str(), far, edge), (1, "KNOWS", 2, 7));
    }

    #[test]
    fn test_validate_token() {
        assert!(validate_token("label", "Person").is_ok());
        assert!(validate_token("label", "Bad:Label").is_err());
        assert!(validate_token("label", "").is_err());
    }
}
