//! Per-frame descriptive metadata.

use crate::error::MetaDataError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Pixel data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 8 bit
    Raw8,
    /// Unsigned 16 bit
    Raw16,
    /// Unsigned 32 bit
    Raw32,
    /// Unsigned 64 bit
    Raw64,
    /// 32 bit float
    Float32,
    /// Not known
    #[default]
    Unknown,
}

impl DataType {
    /// Bytes per pixel, 0 for [`DataType::Unknown`].
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            DataType::Raw8 => 1,
            DataType::Raw16 => 2,
            DataType::Raw32 | DataType::Float32 => 4,
            DataType::Raw64 => 8,
            DataType::Unknown => 0,
        }
    }

    /// Numpy-style type name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Raw8 => "uint8",
            DataType::Raw16 => "uint16",
            DataType::Raw32 => "uint32",
            DataType::Raw64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression applied to the frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// Not known
    #[default]
    Unknown,
    /// Uncompressed
    None,
    /// LZ4
    Lz4,
    /// Bitshuffle + LZ4
    Bslz4,
    /// Blosc
    Blosc,
}

impl CompressionType {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionType::Unknown => "unknown",
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
            CompressionType::Bslz4 => "bslz4",
            CompressionType::Blosc => "blosc",
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed frame parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Float(f64),
    /// String
    Str(String),
}

impl ParamValue {
    /// Name of the held type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "i64",
            ParamValue::UInt(_) => "u64",
            ParamValue::Float(_) => "f64",
            ParamValue::Str(_) => "string",
        }
    }

    /// JSON form of the value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(v) => Value::from(*v),
            ParamValue::Int(v) => Value::from(*v),
            ParamValue::UInt(v) => Value::from(*v),
            ParamValue::Float(v) => Value::from(*v),
            ParamValue::Str(v) => Value::from(v.clone()),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::UInt(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::UInt(u64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// Types that can be read back out of a [`ParamValue`] without conversion.
pub trait FromParam: Sized {
    /// Type name used in mismatch errors.
    const TYPE_NAME: &'static str;

    /// The value, if `param` holds exactly this type.
    fn from_param(param: &ParamValue) -> Option<Self>;
}

macro_rules! impl_from_param {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromParam for $ty {
            const TYPE_NAME: &'static str = $name;

            fn from_param(param: &ParamValue) -> Option<Self> {
                match param {
                    ParamValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_from_param!(bool, Bool, "bool");
impl_from_param!(i64, Int, "i64");
impl_from_param!(u64, UInt, "u64");
impl_from_param!(f64, Float, "f64");
impl_from_param!(String, Str, "string");

/// Descriptive record travelling with every frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameMetaData {
    frame_number: i64,
    dataset_name: String,
    data_type: DataType,
    acquisition_id: String,
    dimensions: Vec<u64>,
    compression: CompressionType,
    frame_offset: i64,
    parameters: BTreeMap<String, ParamValue>,
}

impl FrameMetaData {
    /// Metadata with no parameters and a zero offset.
    #[must_use]
    pub fn new(
        frame_number: i64,
        dataset_name: impl Into<String>,
        data_type: DataType,
        acquisition_id: impl Into<String>,
        dimensions: Vec<u64>,
        compression: CompressionType,
    ) -> Self {
        Self {
            frame_number,
            dataset_name: dataset_name.into(),
            data_type,
            acquisition_id: acquisition_id.into(),
            dimensions,
            compression,
            frame_offset: 0,
            parameters: BTreeMap::new(),
        }
    }

    /// Frame number.
    #[must_use]
    pub fn frame_number(&self) -> i64 {
        self.frame_number
    }

    /// Set the frame number.
    pub fn set_frame_number(&mut self, frame_number: i64) {
        self.frame_number = frame_number;
    }

    /// Dataset the frame belongs to.
    #[must_use]
    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    /// Set the dataset name.
    pub fn set_dataset_name(&mut self, name: impl Into<String>) {
        self.dataset_name = name.into();
    }

    /// Pixel type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Set the pixel type.
    pub fn set_data_type(&mut self, data_type: DataType) {
        self.data_type = data_type;
    }

    /// Acquisition id.
    #[must_use]
    pub fn acquisition_id(&self) -> &str {
        &self.acquisition_id
    }

    /// Set the acquisition id.
    pub fn set_acquisition_id(&mut self, id: impl Into<String>) {
        self.acquisition_id = id.into();
    }

    /// Image dimensions, slowest varying first.
    #[must_use]
    pub fn dimensions(&self) -> &[u64] {
        &self.dimensions
    }

    /// Set the image dimensions.
    pub fn set_dimensions(&mut self, dimensions: Vec<u64>) {
        self.dimensions = dimensions;
    }

    /// Compression type.
    #[must_use]
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Set the compression type.
    pub fn set_compression(&mut self, compression: CompressionType) {
        self.compression = compression;
    }

    /// Offset added to the frame number when writing.
    #[must_use]
    pub fn frame_offset(&self) -> i64 {
        self.frame_offset
    }

    /// Set the frame offset.
    pub fn set_frame_offset(&mut self, offset: i64) {
        self.frame_offset = offset;
    }

    /// Add `adjustment` to the frame offset.
    pub fn adjust_frame_offset(&mut self, adjustment: i64) {
        self.frame_offset += adjustment;
    }

    /// Bytes of image data described by the dimensions and data type.
    #[must_use]
    pub fn image_size(&self) -> usize {
        let pixels: u64 = self.dimensions.iter().product();
        usize::try_from(pixels).unwrap_or(usize::MAX) * self.data_type.size()
    }

    /// Set a parameter, replacing any previous value.
    pub fn set_parameter(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.parameters.insert(name.to_string(), value.into());
    }

    /// Typed parameter value. Fails on a missing name or another type.
    pub fn get_parameter<T: FromParam>(&self, name: &str) -> Result<T, MetaDataError> {
        let param = self
            .parameters
            .get(name)
            .ok_or_else(|| MetaDataError::MissingParameter(name.to_string()))?;
        T::from_param(param).ok_or_else(|| MetaDataError::TypeMismatch {
            name: name.to_string(),
            expected: T::TYPE_NAME,
            found: param.type_name(),
        })
    }

    /// True when a parameter of this name exists.
    #[must_use]
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Remove a parameter, returning its value.
    pub fn remove_parameter(&mut self, name: &str) -> Option<ParamValue> {
        self.parameters.remove(name)
    }

    /// All parameters, sorted by name.
    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }
}
