//! Accessors over a dataset's JSON record.
//!
//! The service-node value engine forwards the dataset record to the
//! data nodes as a query parameter, so both sides read the same
//! fields through these helpers instead of poking at the JSON shape
//! in two places.

use serde_json::Value;

use crate::dtype::{DataType, Shape};
use crate::error::{ServiceError, ServiceResult};

pub fn dataset_type(dset_json: &Value) -> ServiceResult<DataType> {
    let type_json = dset_json
        .get("type")
        .ok_or_else(|| ServiceError::Internal("dataset record has no type".to_string()))?;
    DataType::from_json(type_json)
}

pub fn dataset_shape(dset_json: &Value) -> ServiceResult<Shape> {
    let shape_json = dset_json
        .get("shape")
        .ok_or_else(|| ServiceError::Internal("dataset record has no shape".to_string()))?;
    Shape::from_json(shape_json)
}

pub fn dataset_dims(dset_json: &Value) -> ServiceResult<Vec<u64>> {
    dataset_shape(dset_json)?
        .value_dims()
        .ok_or_else(|| ServiceError::BadRequest("dataset has null dataspace".to_string()))
}

/// Chunk tile extents.
pub fn chunk_layout(dset_json: &Value) -> ServiceResult<Vec<u64>> {
    let dims = dset_json
        .get("layout")
        .and_then(|layout| layout.get("dims"))
        .and_then(Value::as_array)
        .ok_or_else(|| ServiceError::Internal("dataset record has no chunk layout".to_string()))?;
    let dims: Option<Vec<u64>> = dims.iter().map(Value::as_u64).collect();
    dims.ok_or_else(|| ServiceError::Internal("bad chunk layout dims".to_string()))
}

pub fn item_size(dset_json: &Value) -> ServiceResult<usize> {
    dataset_type(dset_json)?
        .item_size()
        .ok_or_else(|| ServiceError::BadRequest("dataset type has no fixed size".to_string()))
}

/// Deflate level from the creation properties filter list, if the
/// dataset is compressed.
pub fn deflate_level(dset_json: &Value) -> Option<u32> {
    let filters = dset_json
        .get("creationProperties")?
        .get("filters")?
        .as_array()?;
    for filter in filters {
        let class = filter.get("class").and_then(Value::as_str);
        if class == Some("H5Z_FILTER_DEFLATE") {
            return filter.get("level").and_then(Value::as_u64).map(|l| l as u32);
        }
    }
    None
}

/// Packed fill value for the dataset's element type.
pub fn fill_bytes(dset_json: &Value) -> ServiceResult<Vec<u8>> {
    let dtype = dataset_type(dset_json)?;
    let fill_value = dset_json
        .get("creationProperties")
        .and_then(|props| props.get("fillValue"));
    dtype.fill_bytes(fill_value)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn dset_record() -> Value {
        json!({
            "id": "d-12345678-1234-1234-1234-1234567890ab",
            "type": { "class": "H5T_INTEGER", "base": "H5T_STD_I32LE" },
            "shape": { "class": "H5S_SIMPLE", "dims": [45, 54] },
            "layout": { "class": "H5D_CHUNKED", "dims": [10, 10] },
            "creationProperties": {
                "fillValue": 7,
                "filters": [ { "class": "H5Z_FILTER_DEFLATE", "level": 4 } ],
            },
        })
    }

    #[test]
    fn test_accessors() {
        let dset = dset_record();
        assert_eq!(dataset_dims(&dset).unwrap(), vec![45, 54]);
        assert_eq!(chunk_layout(&dset).unwrap(), vec![10, 10]);
        assert_eq!(item_size(&dset).unwrap(), 4);
        assert_eq!(deflate_level(&dset), Some(4));
        assert_eq!(fill_bytes(&dset).unwrap(), 7i32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_defaults() {
        let mut dset = dset_record();
        dset["creationProperties"] = json!({});
        assert_eq!(deflate_level(&dset), None);
        assert_eq!(fill_bytes(&dset).unwrap(), vec![0u8; 4]);
    }
}
