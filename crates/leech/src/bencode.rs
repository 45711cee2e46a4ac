//! Owned bencode value tree on top of `bendy`'s streaming decoder.
//!
//! Dictionaries keep their keys in input order so a caller can reason about
//! exactly what was on the wire.

use bendy::decoding::{Decoder, Object};

use crate::error::BencodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Value::Dict(pairs) => Some(pairs),
            _ => None,
        }
    }
}

/// Decode exactly one bencoded value; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = match decoder.next_object()? {
        Some(obj) => from_object(obj)?,
        None => return Err(BencodeError::Empty),
    };
    let trailing = !matches!(decoder.next_object(), Ok(None));
    if trailing {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

fn from_object(obj: Object<'_, '_>) -> Result<Value, BencodeError> {
    match obj {
        Object::Integer(digits) => digits
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| BencodeError::Malformed(format!("integer {:?}: {}", digits, e))),
        Object::Bytes(bytes) => Ok(Value::Bytes(bytes.to_vec())),
        Object::List(mut list) => {
            let mut items = Vec::new();
            while let Some(item) = list.next_object()? {
                items.push(from_object(item)?);
            }
            Ok(Value::List(items))
        }
        Object::Dict(mut dict) => {
            let mut pairs = Vec::new();
            while let Some((key, item)) = dict.next_pair()? {
                let key = key.to_vec();
                pairs.push((key, from_object(item)?));
            }
            Ok(Value::Dict(pairs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nested_values() {
        let value = decode(b"d4:listli1ei-2ee3:num3:abce").unwrap();
        assert_eq!(
            value.get(b"list").and_then(Value::as_list),
            Some(&[Value::Integer(1), Value::Integer(-2)][..])
        );
        assert_eq!(value.get(b"num").and_then(Value::as_str), Some("abc"));
        assert!(value.get(b"missing").is_none());
    }

    #[test]
    fn dict_keeps_input_order() {
        let value = decode(b"d1:ai1e1:bi2e1:ci3ee").unwrap();
        let keys: Vec<&[u8]> = value.as_dict().unwrap().iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
    }

    #[test]
    fn rejects_garbage_and_trailing_bytes() {
        assert!(matches!(decode(b"d3:key"), Err(BencodeError::Malformed(_))));
        assert_eq!(decode(b""), Err(BencodeError::Empty));
        assert_eq!(decode(b"i42eXYZ"), Err(BencodeError::TrailingData));
        assert_eq!(decode(b"i1ei2e"), Err(BencodeError::TrailingData));
    }
}
