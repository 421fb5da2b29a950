//! Multi-field arrays used as kernel inputs.
//!
//! A [`StructuredArray`] is an ordered collection of named fields sharing the
//! same outer shape. Each field has a declared element type and an element
//! sub-shape (empty for scalar fields), so a field of sub-shape `[2]` over an
//! outer shape `[n]` is stored as an `n x 2` array.
//!
//! ```
//! use epigp_gp::{FieldSpec, Schema, StructuredArray};
//! use ndarray::array;
//!
//! let schema = Schema::new([FieldSpec::float("time"), FieldSpec::int("label")]).unwrap();
//! let mut x = StructuredArray::zeros(schema, &[3]);
//! x.set_field("time", array![0., 1., 2.].into_dyn()).unwrap();
//! x.set_field("label", array![0., 0., 1.].into_dyn()).unwrap();
//! assert_eq!(x.field("time").unwrap()[[2]], 2.);
//! ```

use crate::errors::{GpError, Result};
use ndarray::{Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum DType {
    /// Real values
    Float,
    /// Integer values (stored as `f64`, checked to be integral)
    Int,
}

/// Declaration of one named field
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FieldSpec {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
}

impl FieldSpec {
    /// A field declaration with explicit element sub-shape
    pub fn new(name: impl Into<String>, dtype: DType, shape: &[usize]) -> Self {
        FieldSpec {
            name: name.into(),
            dtype,
            shape: shape.to_vec(),
        }
    }

    /// A scalar float field
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, DType::Float, &[])
    }

    /// A scalar integer field
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, DType::Int, &[])
    }

    /// Set the element sub-shape
    pub fn with_shape(mut self, shape: &[usize]) -> Self {
        self.shape = shape.to_vec();
        self
    }

    /// Field name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Element sub-shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of scalar components of one element
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether elements are scalars
    pub fn is_scalar(&self) -> bool {
        self.size() == 1
    }

    fn check_values<'a>(&self, values: impl IntoIterator<Item = &'a f64>) -> Result<()> {
        if self.dtype == DType::Int
            && values
                .into_iter()
                .any(|v| !v.is_finite() || v.fract() != 0.)
        {
            return Err(GpError::InvalidValueError(format!(
                "field `{}` is declared integer but got non integral values",
                self.name
            )));
        }
        Ok(())
    }
}

/// Ordered field declarations with unique names
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Build a schema, rejecting duplicate or empty field names
    pub fn new(fields: impl IntoIterator<Item = FieldSpec>) -> Result<Self> {
        let fields: Vec<FieldSpec> = fields.into_iter().collect();
        for (i, f) in fields.iter().enumerate() {
            if f.name.is_empty() {
                return Err(GpError::InvalidValueError(
                    "field names can not be empty".to_string(),
                ));
            }
            if fields[..i].iter().any(|g| g.name == f.name) {
                return Err(GpError::InvalidValueError(format!(
                    "duplicate field name `{}`",
                    f.name
                )));
            }
        }
        Ok(Schema { fields })
    }

    /// Field declarations in order
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema declares no field
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of the named field
    pub fn position(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| GpError::FieldNotFound(name.to_string()))
    }

    /// Declaration of the named field
    pub fn get(&self, name: &str) -> Result<&FieldSpec> {
        Ok(&self.fields[self.position(name)?])
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {:?}{:?}", field.name, field.dtype, field.shape)?;
        }
        write!(f, "]")
    }
}

/// An n-dimensional array of records with named fields
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct StructuredArray {
    schema: Schema,
    shape: Vec<usize>,
    data: Vec<ArrayD<f64>>,
}

fn full_shape(outer: &[usize], field: &FieldSpec) -> Vec<usize> {
    outer.iter().chain(field.shape.iter()).copied().collect()
}

impl StructuredArray {
    /// A zero filled array with the given schema and outer shape
    pub fn zeros(schema: Schema, shape: &[usize]) -> Self {
        let data = schema
            .fields
            .iter()
            .map(|f| ArrayD::zeros(IxDyn(&full_shape(shape, f))))
            .collect();
        StructuredArray {
            schema,
            shape: shape.to_vec(),
            data,
        }
    }

    /// Build from one array per field, in schema order.
    ///
    /// The outer shape is taken from the first field (its shape without the
    /// trailing element sub-shape) and every other field must agree.
    pub fn from_arrays(schema: Schema, arrays: Vec<ArrayD<f64>>) -> Result<Self> {
        if arrays.len() != schema.len() {
            return Err(GpError::ShapeMismatch(format!(
                "schema declares {} fields, got {} arrays",
                schema.len(),
                arrays.len()
            )));
        }
        let Some(first) = arrays.first() else {
            return Err(GpError::InvalidValueError(
                "structured array needs at least one field".to_string(),
            ));
        };
        let sub = schema.fields[0].shape.len();
        if first.ndim() < sub {
            return Err(GpError::ShapeMismatch(format!(
                "field `{}` has less dimensions than its element shape",
                schema.fields[0].name
            )));
        }
        let shape = first.shape()[..first.ndim() - sub].to_vec();
        for (field, arr) in schema.fields.iter().zip(arrays.iter()) {
            let expected = full_shape(&shape, field);
            if arr.shape() != expected.as_slice() {
                return Err(GpError::ShapeMismatch(format!(
                    "field `{}` has shape {:?}, expected {:?}",
                    field.name,
                    arr.shape(),
                    expected
                )));
            }
            field.check_values(arr.iter())?;
        }
        Ok(StructuredArray {
            schema,
            shape,
            data: arrays,
        })
    }

    /// Field declarations
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Outer shape shared by all fields
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether there is no record
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read only view of a field, of shape `outer ++ element shape`
    pub fn field(&self, name: &str) -> Result<ArrayViewD<'_, f64>> {
        let i = self.schema.position(name)?;
        Ok(self.data[i].view())
    }

    /// Mutable view of a field. Integrality of integer fields is the caller's
    /// responsibility, use [`StructuredArray::set_field`] for checked writes.
    pub fn field_mut(&mut self, name: &str) -> Result<ArrayViewMutD<'_, f64>> {
        let i = self.schema.position(name)?;
        Ok(self.data[i].view_mut())
    }

    /// Overwrite a field with `values`, broadcast to the field shape
    pub fn set_field(&mut self, name: &str, values: ArrayD<f64>) -> Result<()> {
        let i = self.schema.position(name)?;
        let spec = &self.schema.fields[i];
        let target = full_shape(&self.shape, spec);
        let values = values.broadcast(IxDyn(&target)).ok_or_else(|| {
            GpError::ShapeMismatch(format!(
                "can not broadcast {:?} to field `{}` of shape {:?}",
                values.shape(),
                name,
                target
            ))
        })?;
        spec.check_values(values.iter())?;
        self.data[i].assign(&values);
        Ok(())
    }

    /// Apply `f` elementwise to every field independently.
    ///
    /// `f` receives the field declaration and the value.
    pub fn map_fields(&self, f: impl Fn(&FieldSpec, f64) -> f64) -> Result<Self> {
        let data = self
            .schema
            .fields
            .iter()
            .zip(self.data.iter())
            .map(|(spec, arr)| {
                let mapped = arr.mapv(|v| f(spec, v));
                spec.check_values(mapped.iter())?;
                Ok(mapped)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(StructuredArray {
            schema: self.schema.clone(),
            shape: self.shape.clone(),
            data,
        })
    }

    /// Change the outer shape, keeping records in row-major order
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let len: usize = shape.iter().product();
        if len != self.len() {
            return Err(GpError::ShapeMismatch(format!(
                "can not reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        let data = self
            .schema
            .fields
            .iter()
            .zip(self.data.iter())
            .map(|(spec, arr)| {
                ArrayD::from_shape_vec(
                    IxDyn(&full_shape(shape, spec)),
                    arr.iter().copied().collect(),
                )
                .map_err(|e| GpError::ShapeMismatch(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(StructuredArray {
            schema: self.schema.clone(),
            shape: shape.to_vec(),
            data,
        })
    }

    /// Broadcast the outer shape to `shape`
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Self> {
        let data = self
            .schema
            .fields
            .iter()
            .zip(self.data.iter())
            .map(|(spec, arr)| {
                let target = full_shape(shape, spec);
                arr.broadcast(IxDyn(&target))
                    .map(|v| v.to_owned())
                    .ok_or_else(|| {
                        GpError::ShapeMismatch(format!(
                            "can not broadcast {:?} to {:?}",
                            self.shape, shape
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(StructuredArray {
            schema: self.schema.clone(),
            shape: shape.to_vec(),
            data,
        })
    }

    /// Flat row-major copy of each field, `len() * element size` values per field
    pub(crate) fn flat_fields(&self) -> Vec<Vec<f64>> {
        self.data
            .iter()
            .map(|arr| arr.iter().copied().collect())
            .collect()
    }
}

/// Input locations of a kernel or a GP: a plain array or a structured array.
///
/// The whole shape of a plain array is its outer shape, each element being
/// one scalar point.
#[derive(Clone, Debug, PartialEq)]
pub enum Points {
    /// Scalar points
    Plain(ArrayD<f64>),
    /// Records with named fields
    Structured(StructuredArray),
}

impl Points {
    /// Outer shape
    pub fn shape(&self) -> &[usize] {
        match self {
            Points::Plain(a) => a.shape(),
            Points::Structured(s) => s.shape(),
        }
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Whether there is no point
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schema of structured points
    pub fn schema(&self) -> Option<&Schema> {
        match self {
            Points::Plain(_) => None,
            Points::Structured(s) => Some(s.schema()),
        }
    }

    /// Change the outer shape, keeping points in row-major order
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        match self {
            Points::Plain(a) => {
                ArrayD::from_shape_vec(IxDyn(shape), a.iter().copied().collect())
                    .map(Points::Plain)
                    .map_err(|e| GpError::ShapeMismatch(e.to_string()))
            }
            Points::Structured(s) => s.reshape(shape).map(Points::Structured),
        }
    }

    /// Flatten to one dimension
    pub fn flatten(&self) -> Result<Self> {
        self.reshape(&[self.len()])
    }

    /// Fail unless `self` and `other` have the same kind and schema
    pub(crate) fn check_compatible(&self, other: &Points) -> Result<()> {
        match (self.schema(), other.schema()) {
            (None, None) => Ok(()),
            (Some(a), Some(b)) if a == b => Ok(()),
            (a, b) => Err(GpError::SchemaMismatch(format!(
                "{} vs {}",
                describe(a),
                describe(b)
            ))),
        }
    }
}

fn describe(schema: Option<&Schema>) -> String {
    match schema {
        None => "plain array".to_string(),
        Some(s) => format!("structured array {s}"),
    }
}

impl From<ArrayD<f64>> for Points {
    fn from(a: ArrayD<f64>) -> Self {
        Points::Plain(a)
    }
}

impl From<Array1<f64>> for Points {
    fn from(a: Array1<f64>) -> Self {
        Points::Plain(a.into_dyn())
    }
}

impl From<Array2<f64>> for Points {
    fn from(a: Array2<f64>) -> Self {
        Points::Plain(a.into_dyn())
    }
}

impl From<StructuredArray> for Points {
    fn from(s: StructuredArray) -> Self {
        Points::Structured(s)
    }
}
