//! Element datatypes and dataspace shapes.
//!
//! The wire carries HDF5-style JSON descriptors; internally they are
//! parsed once into the `DataType` variant and all size, fill and
//! conversion logic dispatches on that. Variable width types (vlen,
//! variable strings) are valid descriptors for attributes, whose
//! values travel as JSON inside the object record, but are rejected
//! for dataset elements since chunks are packed fixed-width arrays.

use serde_json::{json, Value};

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LE,
    BE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicBase {
    Int { signed: bool, size: usize },
    Float { size: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Atomic { base: AtomicBase, order: ByteOrder },
    FixedString { len: usize, cset: String, pad: String },
    VarString { cset: String, pad: String },
    Compound { fields: Vec<(String, DataType)> },
    Array { elem: Box<DataType>, dims: Vec<u64> },
    Vlen { elem: Box<DataType> },
    Committed { id: String },
}

fn parse_predefined(name: &str) -> Option<DataType> {
    let rest = name.strip_prefix("H5T_")?;
    let (body, order) = if let Some(body) = rest.strip_suffix("LE") {
        (body, ByteOrder::LE)
    } else if let Some(body) = rest.strip_suffix("BE") {
        (body, ByteOrder::BE)
    } else {
        return None;
    };

    let base = match body {
        "STD_I8" => AtomicBase::Int { signed: true, size: 1 },
        "STD_I16" => AtomicBase::Int { signed: true, size: 2 },
        "STD_I32" => AtomicBase::Int { signed: true, size: 4 },
        "STD_I64" => AtomicBase::Int { signed: true, size: 8 },
        "STD_U8" => AtomicBase::Int { signed: false, size: 1 },
        "STD_U16" => AtomicBase::Int { signed: false, size: 2 },
        "STD_U32" => AtomicBase::Int { signed: false, size: 4 },
        "STD_U64" => AtomicBase::Int { signed: false, size: 8 },
        "IEEE_F32" => AtomicBase::Float { size: 4 },
        "IEEE_F64" => AtomicBase::Float { size: 8 },
        _ => return None,
    };
    Some(DataType::Atomic { base, order })
}

fn predefined_name(base: AtomicBase, order: ByteOrder) -> String {
    let body = match base {
        AtomicBase::Int { signed: true, size } => format!("STD_I{}", size * 8),
        AtomicBase::Int { signed: false, size } => format!("STD_U{}", size * 8),
        AtomicBase::Float { size } => format!("IEEE_F{}", size * 8),
    };
    let suffix = match order {
        ByteOrder::LE => "LE",
        ByteOrder::BE => "BE",
    };
    format!("H5T_{}{}", body, suffix)
}

impl DataType {
    /// Parse a type descriptor: either a predefined type name, a
    /// committed type id, or a JSON object with a `class` key.
    pub fn from_json(value: &Value) -> ServiceResult<DataType> {
        if let Some(name) = value.as_str() {
            if name.starts_with("t-") {
                return Ok(DataType::Committed { id: name.to_string() });
            }
            return parse_predefined(name)
                .ok_or_else(|| ServiceError::BadRequest(format!("unknown type: {}", name)));
        }

        let class = value
            .get("class")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("type has no class".to_string()))?;

        match class {
            "H5T_INTEGER" | "H5T_FLOAT" => {
                let base = value.get("base").and_then(Value::as_str).ok_or_else(|| {
                    ServiceError::BadRequest(format!("{} type has no base", class))
                })?;
                parse_predefined(base)
                    .ok_or_else(|| ServiceError::BadRequest(format!("unknown base type: {}", base)))
            }
            "H5T_STRING" => {
                let cset = value
                    .get("charSet")
                    .and_then(Value::as_str)
                    .unwrap_or("H5T_CSET_ASCII")
                    .to_string();
                let pad = value
                    .get("strPad")
                    .and_then(Value::as_str)
                    .unwrap_or("H5T_STR_NULLPAD")
                    .to_string();
                match value.get("length") {
                    Some(Value::String(s)) if s == "H5T_VARIABLE" => {
                        Ok(DataType::VarString { cset, pad })
                    }
                    Some(Value::Number(n)) => {
                        let len = n.as_u64().unwrap_or(0) as usize;
                        if len == 0 {
                            return Err(ServiceError::BadRequest(
                                "string type length must be positive".to_string(),
                            ));
                        }
                        Ok(DataType::FixedString { len, cset, pad })
                    }
                    _ => Err(ServiceError::BadRequest("string type has no length".to_string())),
                }
            }
            "H5T_COMPOUND" => {
                let fields = value
                    .get("fields")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        ServiceError::BadRequest("compound type has no fields".to_string())
                    })?;
                if fields.is_empty() {
                    return Err(ServiceError::BadRequest(
                        "compound type has no fields".to_string(),
                    ));
                }
                let mut parsed = Vec::with_capacity(fields.len());
                for field in fields {
                    let name = field
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ServiceError::BadRequest("compound field has no name".to_string())
                        })?
                        .to_string();
                    let ftype = field.get("type").ok_or_else(|| {
                        ServiceError::BadRequest("compound field has no type".to_string())
                    })?;
                    parsed.push((name, DataType::from_json(ftype)?));
                }
                Ok(DataType::Compound { fields: parsed })
            }
            "H5T_ARRAY" => {
                let base = value.get("base").ok_or_else(|| {
                    ServiceError::BadRequest("array type has no base".to_string())
                })?;
                let dims: Vec<u64> = value
                    .get("dims")
                    .and_then(Value::as_array)
                    .map(|dims| dims.iter().filter_map(Value::as_u64).collect())
                    .unwrap_or_default();
                if dims.is_empty() || dims.iter().any(|d| *d == 0) {
                    return Err(ServiceError::BadRequest("array type has bad dims".to_string()));
                }
                Ok(DataType::Array { elem: Box::new(DataType::from_json(base)?), dims })
            }
            "H5T_VLEN" => {
                let base = value
                    .get("base")
                    .ok_or_else(|| ServiceError::BadRequest("vlen type has no base".to_string()))?;
                Ok(DataType::Vlen { elem: Box::new(DataType::from_json(base)?) })
            }
            _ => Err(ServiceError::BadRequest(format!("unknown type class: {}", class))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DataType::Atomic { base, order } => {
                let class = match base {
                    AtomicBase::Int { .. } => "H5T_INTEGER",
                    AtomicBase::Float { .. } => "H5T_FLOAT",
                };
                json!({ "class": class, "base": predefined_name(*base, *order) })
            }
            DataType::FixedString { len, cset, pad } => json!({
                "class": "H5T_STRING", "charSet": cset, "strPad": pad, "length": len,
            }),
            DataType::VarString { cset, pad } => json!({
                "class": "H5T_STRING", "charSet": cset, "strPad": pad, "length": "H5T_VARIABLE",
            }),
            DataType::Compound { fields } => json!({
                "class": "H5T_COMPOUND",
                "fields": fields
                    .iter()
                    .map(|(name, dt)| json!({ "name": name, "type": dt.to_json() }))
                    .collect::<Vec<_>>(),
            }),
            DataType::Array { elem, dims } => json!({
                "class": "H5T_ARRAY", "base": elem.to_json(), "dims": dims,
            }),
            DataType::Vlen { elem } => json!({ "class": "H5T_VLEN", "base": elem.to_json() }),
            DataType::Committed { id } => Value::String(id.clone()),
        }
    }

    /// Fixed element width in bytes, or `None` for variable width
    /// and unresolved committed types.
    pub fn item_size(&self) -> Option<usize> {
        match self {
            DataType::Atomic { base, .. } => match base {
                AtomicBase::Int { size, .. } => Some(*size),
                AtomicBase::Float { size } => Some(*size),
            },
            DataType::FixedString { len, .. } => Some(*len),
            DataType::VarString { .. } | DataType::Vlen { .. } | DataType::Committed { .. } => None,
            DataType::Compound { fields } => {
                let mut total = 0;
                for (_, dt) in fields {
                    total += dt.item_size()?;
                }
                Some(total)
            }
            DataType::Array { elem, dims } => {
                let elem_size = elem.item_size()?;
                Some(elem_size * dims.iter().product::<u64>() as usize)
            }
        }
    }

    /// Encode one JSON element value into its packed representation,
    /// appending to `out`.
    pub fn encode_value(&self, value: &Value, out: &mut Vec<u8>) -> ServiceResult<()> {
        match self {
            DataType::Atomic { base, order } => encode_atomic(*base, *order, value, out),
            DataType::FixedString { len, .. } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| ServiceError::BadRequest("expected string value".to_string()))?;
                let bytes = s.as_bytes();
                let n = bytes.len().min(*len);
                out.extend_from_slice(&bytes[..n]);
                out.resize(out.len() + (*len - n), 0);
                Ok(())
            }
            DataType::Compound { fields } => {
                let items = value.as_array().ok_or_else(|| {
                    ServiceError::BadRequest("expected array for compound value".to_string())
                })?;
                if items.len() != fields.len() {
                    return Err(ServiceError::BadRequest(format!(
                        "compound value has {} members, expected {}",
                        items.len(),
                        fields.len()
                    )));
                }
                for ((_, dt), item) in fields.iter().zip(items) {
                    dt.encode_value(item, out)?;
                }
                Ok(())
            }
            DataType::Array { elem, dims } => {
                let count = dims.iter().product::<u64>() as usize;
                let flat = flatten(value);
                if flat.len() != count {
                    return Err(ServiceError::BadRequest(format!(
                        "array value has {} elements, expected {}",
                        flat.len(),
                        count
                    )));
                }
                for item in flat {
                    elem.encode_value(item, out)?;
                }
                Ok(())
            }
            _ => Err(ServiceError::BadRequest(
                "variable width types not supported for packed values".to_string(),
            )),
        }
    }

    /// Decode one packed element back to JSON. `data` must hold at
    /// least `item_size()` bytes.
    pub fn decode_value(&self, data: &[u8]) -> ServiceResult<Value> {
        match self {
            DataType::Atomic { base, order } => decode_atomic(*base, *order, data),
            DataType::FixedString { len, .. } => {
                let raw = &data[..*len];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(*len);
                Ok(Value::String(String::from_utf8_lossy(&raw[..end]).into_owned()))
            }
            DataType::Compound { fields } => {
                let mut offset = 0;
                let mut items = Vec::with_capacity(fields.len());
                for (_, dt) in fields {
                    let size = dt
                        .item_size()
                        .ok_or_else(|| ServiceError::Internal("unsized field".to_string()))?;
                    items.push(dt.decode_value(&data[offset..offset + size])?);
                    offset += size;
                }
                Ok(Value::Array(items))
            }
            DataType::Array { elem, dims } => {
                let elem_size = elem
                    .item_size()
                    .ok_or_else(|| ServiceError::Internal("unsized element".to_string()))?;
                let count = dims.iter().product::<u64>() as usize;
                let mut items = Vec::with_capacity(count);
                for i in 0..count {
                    items.push(elem.decode_value(&data[i * elem_size..(i + 1) * elem_size])?);
                }
                Ok(Value::Array(items))
            }
            _ => Err(ServiceError::Internal(
                "variable width types not supported for packed values".to_string(),
            )),
        }
    }

    /// Packed fill value: the explicit one from the dataset's
    /// creation properties, or zeroes.
    pub fn fill_bytes(&self, fill_value: Option<&Value>) -> ServiceResult<Vec<u8>> {
        let size = self
            .item_size()
            .ok_or_else(|| ServiceError::BadRequest("type has no fixed size".to_string()))?;
        match fill_value {
            Some(value) if !value.is_null() => {
                let mut out = Vec::with_capacity(size);
                self.encode_value(value, &mut out)?;
                Ok(out)
            }
            _ => Ok(vec![0u8; size]),
        }
    }

    /// Field names for rank-1 compound query evaluation.
    pub fn field_names(&self) -> Vec<String> {
        match self {
            DataType::Compound { fields } => fields.iter().map(|(name, _)| name.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

fn flatten(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().flat_map(flatten).collect(),
        other => vec![other],
    }
}

fn encode_atomic(
    base: AtomicBase,
    order: ByteOrder,
    value: &Value,
    out: &mut Vec<u8>,
) -> ServiceResult<()> {
    macro_rules! push {
        ($v:expr) => {
            match order {
                ByteOrder::LE => out.extend_from_slice(&$v.to_le_bytes()),
                ByteOrder::BE => out.extend_from_slice(&$v.to_be_bytes()),
            }
        };
    }
    match base {
        AtomicBase::Int { signed: true, size } => {
            let v = value
                .as_i64()
                .ok_or_else(|| ServiceError::BadRequest(format!("expected integer, got {}", value)))?;
            match size {
                1 => push!(v as i8),
                2 => push!(v as i16),
                4 => push!(v as i32),
                _ => push!(v),
            }
        }
        AtomicBase::Int { signed: false, size } => {
            let v = value
                .as_u64()
                .ok_or_else(|| ServiceError::BadRequest(format!("expected unsigned, got {}", value)))?;
            match size {
                1 => push!(v as u8),
                2 => push!(v as u16),
                4 => push!(v as u32),
                _ => push!(v),
            }
        }
        AtomicBase::Float { size } => {
            let v = value
                .as_f64()
                .ok_or_else(|| ServiceError::BadRequest(format!("expected number, got {}", value)))?;
            match size {
                4 => push!(v as f32),
                _ => push!(v),
            }
        }
    }
    Ok(())
}

fn decode_atomic(base: AtomicBase, order: ByteOrder, data: &[u8]) -> ServiceResult<Value> {
    macro_rules! read {
        ($ty:ty, $size:expr) => {{
            let mut buf = [0u8; $size];
            buf.copy_from_slice(&data[..$size]);
            match order {
                ByteOrder::LE => <$ty>::from_le_bytes(buf),
                ByteOrder::BE => <$ty>::from_be_bytes(buf),
            }
        }};
    }
    let value = match base {
        AtomicBase::Int { signed: true, size } => match size {
            1 => json!(read!(i8, 1)),
            2 => json!(read!(i16, 2)),
            4 => json!(read!(i32, 4)),
            _ => json!(read!(i64, 8)),
        },
        AtomicBase::Int { signed: false, size } => match size {
            1 => json!(read!(u8, 1)),
            2 => json!(read!(u16, 2)),
            4 => json!(read!(u32, 4)),
            _ => json!(read!(u64, 8)),
        },
        AtomicBase::Float { size } => match size {
            4 => json!(read!(f32, 4)),
            _ => json!(read!(f64, 8)),
        },
    };
    Ok(value)
}

/// Dataspace of a dataset or attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Null,
    Scalar,
    Simple { dims: Vec<u64>, maxdims: Option<Vec<u64>> },
}

impl Shape {
    pub fn from_json(value: &Value) -> ServiceResult<Shape> {
        // shorthand forms: a bare number or a dims array
        if let Some(dim) = value.as_u64() {
            return Ok(Shape::Simple { dims: vec![dim], maxdims: None });
        }
        if let Some(dims) = value.as_array() {
            let dims: Option<Vec<u64>> = dims.iter().map(Value::as_u64).collect();
            let dims =
                dims.ok_or_else(|| ServiceError::BadRequest("invalid shape dims".to_string()))?;
            return Ok(Shape::Simple { dims, maxdims: None });
        }

        let class = value
            .get("class")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("shape has no class".to_string()))?;
        match class {
            "H5S_NULL" => Ok(Shape::Null),
            "H5S_SCALAR" => Ok(Shape::Scalar),
            "H5S_SIMPLE" => {
                let dims: Option<Vec<u64>> = value
                    .get("dims")
                    .and_then(Value::as_array)
                    .map(|dims| dims.iter().map(Value::as_u64).collect())
                    .unwrap_or(None);
                let dims = dims
                    .ok_or_else(|| ServiceError::BadRequest("simple shape has no dims".to_string()))?;
                let maxdims: Option<Vec<u64>> = match value.get("maxdims") {
                    Some(Value::Array(maxdims)) => {
                        let parsed: Option<Vec<u64>> = maxdims
                            .iter()
                            .map(|d| {
                                if d.as_str() == Some("H5S_UNLIMITED") {
                                    Some(0)
                                } else {
                                    d.as_u64()
                                }
                            })
                            .collect();
                        Some(parsed.ok_or_else(|| {
                            ServiceError::BadRequest("invalid maxdims".to_string())
                        })?)
                    }
                    _ => None,
                };
                if let Some(ref maxdims) = maxdims {
                    if maxdims.len() != dims.len() {
                        return Err(ServiceError::BadRequest(
                            "maxdims rank does not match dims".to_string(),
                        ));
                    }
                    for (dim, maxdim) in dims.iter().zip(maxdims) {
                        if *maxdim != 0 && dim > maxdim {
                            return Err(ServiceError::BadRequest(format!(
                                "dim {} exceeds maxdim {}",
                                dim, maxdim
                            )));
                        }
                    }
                }
                Ok(Shape::Simple { dims, maxdims })
            }
            _ => Err(ServiceError::BadRequest(format!("unknown shape class: {}", class))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Shape::Null => json!({ "class": "H5S_NULL" }),
            Shape::Scalar => json!({ "class": "H5S_SCALAR" }),
            Shape::Simple { dims, maxdims } => match maxdims {
                Some(maxdims) => json!({
                    "class": "H5S_SIMPLE", "dims": dims, "maxdims": maxdims,
                }),
                None => json!({ "class": "H5S_SIMPLE", "dims": dims }),
            },
        }
    }

    /// Extents for the value engine. Scalar datasets are modelled as
    /// a one element rank-1 array.
    pub fn value_dims(&self) -> Option<Vec<u64>> {
        match self {
            Shape::Null => None,
            Shape::Scalar => Some(vec![1]),
            Shape::Simple { dims, .. } => Some(dims.clone()),
        }
    }

    pub fn maxdims(&self) -> Option<&[u64]> {
        match self {
            Shape::Simple { maxdims: Some(maxdims), .. } => Some(maxdims),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_predefined_round_trip() {
        for name in &[
            "H5T_STD_I8LE", "H5T_STD_U16BE", "H5T_STD_I32LE", "H5T_STD_U64LE",
            "H5T_IEEE_F32LE", "H5T_IEEE_F64BE",
        ] {
            let dt = DataType::from_json(&json!(name)).unwrap();
            let back = DataType::from_json(&dt.to_json()).unwrap();
            assert_eq!(dt, back, "{}", name);
        }
    }

    #[test]
    fn test_item_sizes() {
        let i32le = DataType::from_json(&json!("H5T_STD_I32LE")).unwrap();
        assert_eq!(i32le.item_size(), Some(4));

        let s6 = DataType::from_json(&json!({
            "class": "H5T_STRING", "charSet": "H5T_CSET_ASCII",
            "strPad": "H5T_STR_NULLPAD", "length": 6,
        }))
        .unwrap();
        assert_eq!(s6.item_size(), Some(6));

        let compound = DataType::from_json(&json!({
            "class": "H5T_COMPOUND",
            "fields": [
                { "name": "temp", "type": "H5T_IEEE_F64LE" },
                { "name": "count", "type": "H5T_STD_I32LE" },
            ],
        }))
        .unwrap();
        assert_eq!(compound.item_size(), Some(12));

        let arr = DataType::from_json(&json!({
            "class": "H5T_ARRAY", "base": "H5T_STD_I16LE", "dims": [2, 3],
        }))
        .unwrap();
        assert_eq!(arr.item_size(), Some(12));

        let vstr = DataType::from_json(&json!({
            "class": "H5T_STRING", "charSet": "H5T_CSET_UTF8",
            "strPad": "H5T_STR_NULLTERM", "length": "H5T_VARIABLE",
        }))
        .unwrap();
        assert_eq!(vstr.item_size(), None);
    }

    #[test]
    fn test_committed_reference() {
        let dt = DataType::from_json(&json!("t-12345678-1234-1234-1234-1234567890ab")).unwrap();
        match &dt {
            DataType::Committed { id } => assert!(id.starts_with("t-")),
            other => panic!("unexpected type: {:?}", other),
        }
        assert_eq!(dt.item_size(), None);
    }

    #[test]
    fn test_atomic_codec() {
        let dt = DataType::from_json(&json!("H5T_STD_I32LE")).unwrap();
        let mut out = Vec::new();
        dt.encode_value(&json!(-77), &mut out).unwrap();
        assert_eq!(out, (-77i32).to_le_bytes().to_vec());
        assert_eq!(dt.decode_value(&out).unwrap(), json!(-77));

        let dt = DataType::from_json(&json!("H5T_IEEE_F64BE")).unwrap();
        let mut out = Vec::new();
        dt.encode_value(&json!(1.5), &mut out).unwrap();
        assert_eq!(dt.decode_value(&out).unwrap(), json!(1.5));
    }

    #[test]
    fn test_string_codec_pads_and_truncates() {
        let dt = DataType::FixedString {
            len: 4,
            cset: "H5T_CSET_ASCII".to_string(),
            pad: "H5T_STR_NULLPAD".to_string(),
        };
        let mut out = Vec::new();
        dt.encode_value(&json!("hi"), &mut out).unwrap();
        assert_eq!(out, b"hi\0\0".to_vec());
        assert_eq!(dt.decode_value(&out).unwrap(), json!("hi"));

        out.clear();
        dt.encode_value(&json!("toolong"), &mut out).unwrap();
        assert_eq!(out, b"tool".to_vec());
    }

    #[test]
    fn test_compound_codec() {
        let dt = DataType::from_json(&json!({
            "class": "H5T_COMPOUND",
            "fields": [
                { "name": "x", "type": "H5T_STD_U16LE" },
                { "name": "label", "type": {
                    "class": "H5T_STRING", "charSet": "H5T_CSET_ASCII",
                    "strPad": "H5T_STR_NULLPAD", "length": 3 } },
            ],
        }))
        .unwrap();
        let mut out = Vec::new();
        dt.encode_value(&json!([512, "ab"]), &mut out).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(dt.decode_value(&out).unwrap(), json!([512, "ab"]));
    }

    #[test]
    fn test_fill_bytes() {
        let dt = DataType::from_json(&json!("H5T_STD_I32LE")).unwrap();
        assert_eq!(dt.fill_bytes(None).unwrap(), vec![0u8; 4]);
        assert_eq!(
            dt.fill_bytes(Some(&json!(42))).unwrap(),
            42i32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_shape_parsing() {
        let shape = Shape::from_json(&json!([10, 20])).unwrap();
        assert_eq!(shape.value_dims().unwrap(), vec![10, 20]);

        let shape = Shape::from_json(&json!({
            "class": "H5S_SIMPLE", "dims": [10], "maxdims": [20],
        }))
        .unwrap();
        assert_eq!(shape.maxdims().unwrap(), &[20]);

        let shape = Shape::from_json(&json!({
            "class": "H5S_SIMPLE", "dims": [10], "maxdims": ["H5S_UNLIMITED"],
        }))
        .unwrap();
        assert_eq!(shape.maxdims().unwrap(), &[0]);

        assert!(Shape::from_json(&json!({
            "class": "H5S_SIMPLE", "dims": [30], "maxdims": [20],
        }))
        .is_err());

        assert_eq!(Shape::from_json(&json!({"class": "H5S_SCALAR"})).unwrap(), Shape::Scalar);
    }
}
