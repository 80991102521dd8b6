//! EIP-712 typed structured data hashing.
//!
//! The device signs in "hashed" mode, so the host computes both halves of
//!
//! ```text
//! keccak256("\x19\x01" || domainSeparator || hashStruct(message))
//! ```
//!
//! and sends `domainSeparator` and `hashStruct(message)` to the device.

use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{keccak256, Address, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LedgerError;

pub const DOMAIN_TYPE: &str = "EIP712Domain";

/// Domain fields in canonical order, used when the payload omits the
/// `EIP712Domain` type definition.
const DOMAIN_FIELDS: [(&str, &str); 5] = [
    ("name", "string"),
    ("version", "string"),
    ("chainId", "uint256"),
    ("verifyingContract", "address"),
    ("salt", "bytes32"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

impl TypedField {
    fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
        }
    }
}

/// An `eth_signTypedData_v4` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    pub types: BTreeMap<String, Vec<TypedField>>,
    /// Inferred from the type graph when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_type: Option<String>,
    #[serde(default)]
    pub domain: Map<String, Value>,
    pub message: Value,
}

impl TypedData {
    /// Build from loose JSON parts: `types` is the usual
    /// `{ "Type": [{ "name", "type" }, ...] }` object.
    pub fn new(
        domain: Value,
        types: Value,
        primary_type: Option<String>,
        message: Value,
    ) -> Result<Self, LedgerError> {
        let types = serde_json::from_value(types)
            .map_err(|e| LedgerError::InvalidTypedData(format!("bad types: {e}")))?;
        let domain = match domain {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(LedgerError::InvalidTypedData(format!(
                    "domain must be an object, got {other}"
                )))
            }
        };
        Ok(Self {
            types,
            primary_type,
            domain,
            message,
        })
    }

    /// Accepts the payload as a JSON object or as a string holding one.
    pub fn from_value(value: Value) -> Result<Self, LedgerError> {
        let value = match value {
            Value::String(s) => serde_json::from_str(&s)
                .map_err(|e| LedgerError::InvalidTypedData(format!("payload is not JSON: {e}")))?,
            other => other,
        };
        serde_json::from_value(value).map_err(|e| LedgerError::InvalidTypedData(e.to_string()))
    }

    /// The declared primary type, or the single struct no other struct refers to.
    pub fn primary_type(&self) -> Result<String, LedgerError> {
        if let Some(primary) = &self.primary_type {
            return Ok(primary.clone());
        }

        let referenced: BTreeSet<&str> = self
            .types
            .iter()
            .filter(|(name, _)| name.as_str() != DOMAIN_TYPE)
            .flat_map(|(_, fields)| fields.iter().map(|f| base_type(&f.field_type)))
            .collect();
        let roots: Vec<&String> = self
            .types
            .keys()
            .filter(|name| name.as_str() != DOMAIN_TYPE && !referenced.contains(name.as_str()))
            .collect();

        match roots.as_slice() {
            [root] => Ok((*root).clone()),
            [] => Err(LedgerError::InvalidTypedData("no primary type".into())),
            _ => Err(LedgerError::InvalidTypedData(format!(
                "ambiguous primary type: {roots:?}"
            ))),
        }
    }

    pub fn domain_separator(&self) -> Result<B256, LedgerError> {
        let mut encoder = Encoder {
            types: self.types.clone(),
        };
        if !encoder.types.contains_key(DOMAIN_TYPE) {
            let fields = DOMAIN_FIELDS
                .iter()
                .filter(|(name, _)| self.domain.contains_key(*name))
                .map(|(name, ty)| TypedField::new(name, ty))
                .collect();
            encoder.types.insert(DOMAIN_TYPE.into(), fields);
        }
        encoder.hash_struct(DOMAIN_TYPE, &Value::Object(self.domain.clone()))
    }

    pub fn struct_hash(&self) -> Result<B256, LedgerError> {
        let primary = self.primary_type()?;
        let mut types = self.types.clone();
        types.remove(DOMAIN_TYPE);
        Encoder { types }.hash_struct(&primary, &self.message)
    }

    /// `keccak256(0x19 0x01 || domainSeparator || structHash)`
    pub fn digest(&self) -> Result<B256, LedgerError> {
        Ok(signing_digest(
            &self.domain_separator()?,
            &self.struct_hash()?,
        ))
    }
}

pub fn signing_digest(domain_separator: &B256, struct_hash: &B256) -> B256 {
    let mut data = [0u8; 66];
    data[0] = 0x19;
    data[1] = 0x01;
    data[2..34].copy_from_slice(domain_separator.as_slice());
    data[34..].copy_from_slice(struct_hash.as_slice());
    keccak256(data)
}

/// `Foo[]`, `Foo[3]` and `Foo[][2]` all reference `Foo`.
fn base_type(field_type: &str) -> &str {
    field_type.split('[').next().unwrap_or(field_type)
}

/// Strip the outermost array dimension: `Foo[2][]` -> `Foo[2]`.
fn array_element(field_type: &str) -> Option<&str> {
    let stripped = field_type.strip_suffix(']')?;
    let open = stripped.rfind('[')?;
    Some(&field_type[..open])
}

struct Encoder {
    types: BTreeMap<String, Vec<TypedField>>,
}

impl Encoder {
    fn fields(&self, type_name: &str) -> Result<&[TypedField], LedgerError> {
        self.types
            .get(type_name)
            .map(Vec::as_slice)
            .ok_or_else(|| LedgerError::InvalidTypedData(format!("undefined type {type_name}")))
    }

    /// Every struct type reachable from `type_name`, itself excluded.
    fn dependencies(&self, type_name: &str, found: &mut BTreeSet<String>) {
        let Some(fields) = self.types.get(type_name) else {
            return;
        };
        for field in fields {
            let dep = base_type(&field.field_type);
            if self.types.contains_key(dep) && found.insert(dep.to_owned()) {
                self.dependencies(dep, found);
            }
        }
    }

    /// `Primary(fields)` followed by its dependencies in alphabetical order.
    fn encode_type(&self, type_name: &str) -> Result<String, LedgerError> {
        let mut deps = BTreeSet::new();
        self.dependencies(type_name, &mut deps);
        deps.remove(type_name);

        let mut out = String::new();
        for name in std::iter::once(type_name).chain(deps.iter().map(String::as_str)) {
            let fields = self.fields(name)?;
            let members: Vec<String> = fields
                .iter()
                .map(|f| format!("{} {}", f.field_type, f.name))
                .collect();
            out.push_str(&format!("{name}({})", members.join(",")));
        }
        Ok(out)
    }

    fn hash_struct(&self, type_name: &str, data: &Value) -> Result<B256, LedgerError> {
        let type_hash = keccak256(self.encode_type(type_name)?.as_bytes());
        let obj = data.as_object().ok_or_else(|| {
            LedgerError::InvalidTypedData(format!("{type_name} value must be an object"))
        })?;

        let mut encoded = type_hash.to_vec();
        for field in self.fields(type_name)? {
            let value = obj.get(&field.name).ok_or_else(|| {
                LedgerError::InvalidTypedData(format!("{type_name} is missing {}", field.name))
            })?;
            encoded.extend_from_slice(self.encode_value(&field.field_type, value)?.as_slice());
        }
        Ok(keccak256(&encoded))
    }

    fn encode_value(&self, field_type: &str, value: &Value) -> Result<B256, LedgerError> {
        if let Some(element) = array_element(field_type) {
            let items = value.as_array().ok_or_else(|| {
                LedgerError::InvalidTypedData(format!("{field_type} value must be an array"))
            })?;
            let mut concat = Vec::with_capacity(items.len() * 32);
            for item in items {
                concat.extend_from_slice(self.encode_value(element, item)?.as_slice());
            }
            return Ok(keccak256(&concat));
        }

        if self.types.contains_key(field_type) {
            return self.hash_struct(field_type, value);
        }

        encode_atomic(field_type, value)
    }
}

fn invalid(field_type: &str, value: &Value) -> LedgerError {
    LedgerError::InvalidTypedData(format!("invalid {field_type} value {value}"))
}

fn encode_atomic(field_type: &str, value: &Value) -> Result<B256, LedgerError> {
    match field_type {
        "string" => {
            let s = value.as_str().ok_or_else(|| invalid(field_type, value))?;
            Ok(keccak256(s.as_bytes()))
        }
        "bytes" => Ok(keccak256(hex_bytes(field_type, value)?)),
        "bool" => {
            let b = match value {
                Value::Bool(b) => *b,
                Value::String(s) if s == "true" || s == "false" => s == "true",
                _ => return Err(invalid(field_type, value)),
            };
            Ok(U256::from(u8::from(b)).into())
        }
        "address" => {
            let s = value.as_str().ok_or_else(|| invalid(field_type, value))?;
            let address: Address = s.parse().map_err(|_| invalid(field_type, value))?;
            Ok(address.into_word())
        }
        t if t.starts_with("bytes") => {
            let size: usize = t[5..].parse().map_err(|_| invalid(field_type, value))?;
            let bytes = hex_bytes(field_type, value)?;
            if size == 0 || size > 32 || bytes.len() > size {
                return Err(invalid(field_type, value));
            }
            let mut word = B256::ZERO;
            word[..bytes.len()].copy_from_slice(&bytes);
            Ok(word)
        }
        t if t.starts_with("uint") => {
            let bits = int_width(t, "uint")?;
            let n = parse_uint(value).ok_or_else(|| invalid(field_type, value))?;
            if n.bit_len() > bits {
                return Err(invalid(field_type, value));
            }
            Ok(n.into())
        }
        t if t.starts_with("int") => {
            let bits = int_width(t, "int")?;
            let (negative, magnitude) =
                parse_int(value).ok_or_else(|| invalid(field_type, value))?;
            // two's complement range: -2^(bits-1) ..= 2^(bits-1) - 1
            let bound = U256::from(1u8) << (bits - 1);
            let in_range = if negative {
                magnitude <= bound
            } else {
                magnitude < bound
            };
            if !in_range {
                return Err(invalid(field_type, value));
            }
            let word = if negative {
                U256::ZERO.wrapping_sub(magnitude)
            } else {
                magnitude
            };
            Ok(word.into())
        }
        _ => Err(LedgerError::InvalidTypedData(format!(
            "unsupported type {field_type}"
        ))),
    }
}

fn hex_bytes(field_type: &str, value: &Value) -> Result<Vec<u8>, LedgerError> {
    let s = value.as_str().ok_or_else(|| invalid(field_type, value))?;
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|_| invalid(field_type, value))
}

/// JSON number, decimal string or `0x` hex string.
fn parse_uint(value: &Value) -> Option<U256> {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None => U256::from_str_radix(s, 10).ok(),
        },
        _ => None,
    }
}

/// Bit width of `uintN` / `intN`; a bare `uint` / `int` is 256 bits.
fn int_width(field_type: &str, prefix: &str) -> Result<usize, LedgerError> {
    let suffix = &field_type[prefix.len()..];
    if suffix.is_empty() {
        return Ok(256);
    }
    match suffix.parse::<usize>() {
        Ok(bits) if bits > 0 && bits <= 256 && bits % 8 == 0 => Ok(bits),
        _ => Err(LedgerError::InvalidTypedData(format!(
            "unsupported type {field_type}"
        ))),
    }
}

/// Sign and magnitude of a JSON number, decimal string or `0x` hex string.
fn parse_int(value: &Value) -> Option<(bool, U256)> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) if i < 0 => Some((true, U256::from(i.unsigned_abs()))),
            _ => parse_uint(value).map(|m| (false, m)),
        },
        Value::String(s) => match s.strip_prefix('-') {
            Some(digits) => U256::from_str_radix(digits, 10).ok().map(|m| (true, m)),
            None => parse_uint(value).map(|m| (false, m)),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mail() -> Value {
        json!({
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" },
                    { "name": "version", "type": "string" },
                    { "name": "chainId", "type": "uint256" },
                    { "name": "verifyingContract", "type": "address" }
                ],
                "Person": [
                    { "name": "name", "type": "string" },
                    { "name": "wallet", "type": "address" }
                ],
                "Mail": [
                    { "name": "from", "type": "Person" },
                    { "name": "to", "type": "Person" },
                    { "name": "contents", "type": "string" }
                ]
            },
            "primaryType": "Mail",
            "domain": {
                "name": "Ether Mail",
                "version": "1",
                "chainId": 1,
                "verifyingContract": "0xCcCCccccCCCCcCCCCCCcCcCccCcCCCcCcccccccC"
            },
            "message": {
                "from": { "name": "Cow", "wallet": "0xCD2a3d9F938E13CD947Ec05AbC7FE734Df8DD826" },
                "to": { "name": "Bob", "wallet": "0xbBbBBBBbbBBBbbbBbbBbbbbBBbBbbbbBbBbbBBbB" },
                "contents": "Hello, Bob!"
            }
        })
    }

    fn b256(s: &str) -> B256 {
        s.parse().unwrap()
    }

    #[test]
    fn mail_known_answer() {
        let data = TypedData::from_value(mail()).unwrap();
        assert_eq!(
            data.domain_separator().unwrap(),
            b256("0xf2cee375fa42b42143804025fc449deafd50cc031ca257e0b194a650a912090f")
        );
        assert_eq!(
            data.struct_hash().unwrap(),
            b256("0xc52c0ee5d84264471806290a3f2c4cecfc5490626bf912d01f240d7a274b371e")
        );
        assert_eq!(
            data.digest().unwrap(),
            b256("0xbe609aee343fb3c4b28e1df9e632fca64fcfaede20f02e86244efddf30957bd2")
        );
    }

    #[test]
    fn payload_as_json_string() {
        let data = TypedData::from_value(Value::String(mail().to_string())).unwrap();
        assert_eq!(data.primary_type().unwrap(), "Mail");
    }

    #[test]
    fn domain_type_inferred_when_missing() {
        let mut payload = mail();
        payload["types"].as_object_mut().unwrap().remove("EIP712Domain");
        let data = TypedData::from_value(payload).unwrap();
        assert_eq!(
            data.domain_separator().unwrap(),
            b256("0xf2cee375fa42b42143804025fc449deafd50cc031ca257e0b194a650a912090f")
        );
    }

    #[test]
    fn primary_type_inferred() {
        let mut payload = mail();
        payload.as_object_mut().unwrap().remove("primaryType");
        let data = TypedData::from_value(payload).unwrap();
        assert_eq!(data.primary_type().unwrap(), "Mail");
        assert_eq!(
            data.struct_hash().unwrap(),
            b256("0xc52c0ee5d84264471806290a3f2c4cecfc5490626bf912d01f240d7a274b371e")
        );
    }

    #[test]
    fn ambiguous_primary_type_rejected() {
        let data = TypedData::new(
            json!({}),
            json!({ "A": [{ "name": "x", "type": "uint8" }], "B": [{ "name": "y", "type": "uint8" }] }),
            None,
            json!({}),
        )
        .unwrap();
        assert!(matches!(
            data.primary_type(),
            Err(LedgerError::InvalidTypedData(_))
        ));
    }

    #[test]
    fn encode_type_includes_transitive_dependencies() {
        let encoder = Encoder {
            types: serde_json::from_value(json!({
                "Order": [{ "name": "owner", "type": "Account" }, { "name": "items", "type": "Item[]" }],
                "Account": [{ "name": "wallet", "type": "Wallet" }],
                "Wallet": [{ "name": "addr", "type": "address" }],
                "Item": [{ "name": "id", "type": "uint256" }]
            }))
            .unwrap(),
        };
        assert_eq!(
            encoder.encode_type("Order").unwrap(),
            "Order(Account owner,Item[] items)Account(Wallet wallet)Item(uint256 id)Wallet(address addr)"
        );
    }

    #[test]
    fn missing_field_rejected() {
        let mut payload = mail();
        payload["message"].as_object_mut().unwrap().remove("contents");
        let data = TypedData::from_value(payload).unwrap();
        assert!(matches!(
            data.struct_hash(),
            Err(LedgerError::InvalidTypedData(m)) if m.contains("contents")
        ));
    }

    #[test]
    fn undefined_type_rejected() {
        let data = TypedData::new(
            json!({}),
            json!({ "A": [{ "name": "x", "type": "Missing" }] }),
            Some("B".into()),
            json!({ "x": 1 }),
        )
        .unwrap();
        assert!(data.struct_hash().is_err());
    }

    #[test]
    fn atomic_encodings() {
        assert_eq!(
            encode_atomic("uint256", &json!("0x10")).unwrap(),
            B256::from(U256::from(16))
        );
        assert_eq!(
            encode_atomic("uint8", &json!(7)).unwrap(),
            B256::from(U256::from(7))
        );
        assert_eq!(encode_atomic("int256", &json!(-1)).unwrap(), B256::repeat_byte(0xFF));
        assert_eq!(encode_atomic("int", &json!(-1)).unwrap(), B256::repeat_byte(0xFF));
        assert_eq!(encode_atomic("int64", &json!("-1")).unwrap(), B256::repeat_byte(0xFF));
        assert_eq!(
            encode_atomic("bool", &json!(true)).unwrap(),
            B256::with_last_byte(1)
        );

        let word = encode_atomic("bytes4", &json!("0xdeadbeef")).unwrap();
        assert_eq!(&word[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert!(word[4..].iter().all(|b| *b == 0));

        assert_eq!(
            encode_atomic("bytes", &json!("0x")).unwrap(),
            keccak256(b"")
        );
        assert!(encode_atomic("bytes2", &json!("0xdeadbeef")).is_err());
        assert!(encode_atomic("address", &json!("0x1234")).is_err());
        assert!(encode_atomic("fixed128x18", &json!(1)).is_err());
    }

    #[test]
    fn integers_respect_bit_width() {
        assert!(encode_atomic("uint8", &json!(255)).is_ok());
        assert!(encode_atomic("uint8", &json!(300)).is_err());
        assert!(encode_atomic("uint16", &json!("0x10000")).is_err());
        assert!(encode_atomic("int8", &json!(127)).is_ok());
        assert!(encode_atomic("int8", &json!(128)).is_err());
        assert!(encode_atomic("int8", &json!(-128)).is_ok());
        assert!(encode_atomic("int8", &json!("-129")).is_err());
        assert!(encode_atomic("uint7", &json!(1)).is_err());
        assert!(encode_atomic("uint264", &json!(1)).is_err());

        let max = format!("{:#x}", U256::MAX);
        assert!(encode_atomic("uint256", &json!(max)).is_ok());
        assert!(encode_atomic("int256", &json!(max)).is_err());
    }

    #[test]
    fn array_element_types() {
        assert_eq!(array_element("Foo[]"), Some("Foo"));
        assert_eq!(array_element("uint8[2][]"), Some("uint8[2]"));
        assert_eq!(array_element("Foo"), None);
        assert_eq!(base_type("Foo[][3]"), "Foo");
    }

    #[test]
    fn array_values_hash_concatenation() {
        let encoder = Encoder {
            types: BTreeMap::new(),
        };
        let hashed = encoder
            .encode_value("uint256[]", &json!([1, 2]))
            .unwrap();
        let mut concat = Vec::new();
        concat.extend_from_slice(B256::from(U256::from(1)).as_slice());
        concat.extend_from_slice(B256::from(U256::from(2)).as_slice());
        assert_eq!(hashed, keccak256(&concat));
    }
}
