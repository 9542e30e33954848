//! A stateless interpreter for CPU matrix ops dispatched by an operation
//! code, used by geometric estimators (affine fitting, homography solving,
//! etc. live upstream of this crate; this module only provides the kernel
//! they are built from).
//!
//! Matrices are column-major and strided: element `(i, j)` reads storage
//! index `j * stride + i`. Elements at `[j*stride + rows, j*stride +
//! stride)` are padding and ignored by every operation.

/// Column-major strided block of `f32` data.
///
/// This crate's matrix VM only operates on `f32` storage; a wider
/// `{float32, float64, int32, uint8}` element-type axis is a storage-format
/// concern for callers marshalling data in and out (e.g. quantizing a
/// `uint8` descriptor matrix before handing it to the VM), since the
/// arithmetic kernels themselves are fully represented by `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    columns: usize,
    stride: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Construct a zero matrix with `stride == rows` (packed).
    pub fn zeros(rows: usize, columns: usize) -> Self {
        Self::zeros_strided(rows, columns, rows)
    }

    /// Construct a zero matrix with an explicit stride, `stride >= rows`.
    pub fn zeros_strided(rows: usize, columns: usize, stride: usize) -> Self {
        assert!(stride >= rows, "stride must be at least rows");
        Matrix {
            rows,
            columns,
            stride,
            data: vec![0.0; stride * columns],
        }
    }

    /// Build a packed matrix from row-major literal data, the natural way to
    /// write a matrix literal in a test.
    pub fn from_rows(rows: &[&[f32]]) -> Self {
        let nrows = rows.len();
        let ncols = rows.first().map_or(0, |r| r.len());
        let mut matrix = Matrix::zeros(nrows, ncols);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.len(), ncols, "ragged matrix literal");
            for (j, &value) in row.iter().enumerate() {
                matrix.set(i, j, value);
            }
        }
        matrix
    }

    pub fn identity(n: usize) -> Self {
        let mut matrix = Matrix::zeros(n, n);
        for i in 0..n {
            matrix.set(i, i, 1.0);
        }
        matrix
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    fn index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < self.rows && j < self.columns);
        j * self.stride + i
    }

    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[self.index(i, j)]
    }

    pub fn set(&mut self, i: usize, j: usize, value: f32) {
        let idx = self.index(i, j);
        self.data[idx] = value;
    }

    /// Whether `self` and `other` have equal logical contents, ignoring
    /// stride and padding, so results compare equal regardless of how
    /// either operand happens to be strided.
    pub fn logically_eq(&self, other: &Matrix, tolerance: f32) -> bool {
        if self.rows != other.rows || self.columns != other.columns {
            return false;
        }
        for j in 0..self.columns {
            for i in 0..self.rows {
                if (self.get(i, j) - other.get(i, j)).abs() > tolerance {
                    return false;
                }
            }
        }
        true
    }
}

/// Operation codes dispatched by [`MatrixVm::execute`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatrixOp {
    Nop,
    Fill(f32),
    Copy,
    Transpose,
    Add,
    Sub,
    Mul,
    /// `output = inputA^T . inputB`
    MulLt,
    /// `output = inputA . inputB^T`
    MulRt,
    Scale(f32),
    /// Hadamard (componentwise) product.
    CompMult,
}

/// Errors from dispatching a [`MatrixOp`] against mismatched shapes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatrixOpError {
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: &'static str },
}

/// The stateless interpreter. Operation handlers are pure functions over the
/// header record (rows/columns/stride) and the backing storage; there is no
/// VM-level state to carry between calls.
pub struct MatrixVm;

impl MatrixVm {
    /// Execute `op`, writing into `output`. `a` and `b` are additional
    /// operands required by binary/unary ops; pass `None` where unused.
    pub fn execute(
        op: MatrixOp,
        output: &mut Matrix,
        a: Option<&Matrix>,
        b: Option<&Matrix>,
    ) -> Result<(), MatrixOpError> {
        match op {
            MatrixOp::Nop => Ok(()),
            MatrixOp::Fill(v) => {
                fill_logical(output, v);
                Ok(())
            }
            MatrixOp::Copy => {
                let a = require(a, "COPY requires an input")?;
                same_shape(output, a, "COPY shape mismatch")?;
                copy_logical(output, a);
                Ok(())
            }
            MatrixOp::Transpose => {
                let a = require(a, "TRANSPOSE requires an input")?;
                if output.rows != a.columns || output.columns != a.rows {
                    return Err(MatrixOpError::ShapeMismatch {
                        context: "TRANSPOSE output shape must be input transposed",
                    });
                }
                for j in 0..output.columns {
                    for i in 0..output.rows {
                        output.set(i, j, a.get(j, i));
                    }
                }
                Ok(())
            }
            MatrixOp::Add => binary_componentwise(output, a, b, "ADD", |x, y| x + y),
            MatrixOp::Sub => binary_componentwise(output, a, b, "SUB", |x, y| x - y),
            MatrixOp::CompMult => binary_componentwise(output, a, b, "COMPMULT", |x, y| x * y),
            MatrixOp::Mul => {
                let a = require(a, "MUL requires input A")?;
                let b = require(b, "MUL requires input B")?;
                if a.columns != b.rows || output.rows != a.rows || output.columns != b.columns {
                    return Err(MatrixOpError::ShapeMismatch { context: "MUL inner dimensions" });
                }
                fill_logical(output, 0.0);
                // Column-major inner loop for cache locality: iterate output
                // columns outermost, then the shared k dimension, then rows.
                for j in 0..output.columns {
                    for k in 0..a.columns {
                        let b_kj = b.get(k, j);
                        for i in 0..output.rows {
                            let acc = output.get(i, j) + a.get(i, k) * b_kj;
                            output.set(i, j, acc);
                        }
                    }
                }
                Ok(())
            }
            MatrixOp::MulLt => {
                let a = require(a, "MULLT requires input A")?;
                let b = require(b, "MULLT requires input B")?;
                if a.rows != b.rows || output.rows != a.columns || output.columns != b.columns {
                    return Err(MatrixOpError::ShapeMismatch { context: "MULLT inner dimensions" });
                }
                // Writes each output element exactly once; no clear needed.
                for j in 0..output.columns {
                    for i in 0..output.rows {
                        let mut acc = 0.0;
                        for k in 0..a.rows {
                            acc += a.get(k, i) * b.get(k, j);
                        }
                        output.set(i, j, acc);
                    }
                }
                Ok(())
            }
            MatrixOp::MulRt => {
                let a = require(a, "MULRT requires input A")?;
                let b = require(b, "MULRT requires input B")?;
                if a.columns != b.columns || output.rows != a.rows || output.columns != b.rows {
                    return Err(MatrixOpError::ShapeMismatch { context: "MULRT inner dimensions" });
                }
                fill_logical(output, 0.0);
                for j in 0..output.columns {
                    for k in 0..a.columns {
                        let b_jk = b.get(j, k);
                        for i in 0..output.rows {
                            let acc = output.get(i, j) + a.get(i, k) * b_jk;
                            output.set(i, j, acc);
                        }
                    }
                }
                Ok(())
            }
            MatrixOp::Scale(s) => {
                let a = require(a, "SCALE requires an input")?;
                same_shape(output, a, "SCALE shape mismatch")?;
                for j in 0..output.columns {
                    for i in 0..output.rows {
                        output.set(i, j, s * a.get(i, j));
                    }
                }
                Ok(())
            }
        }
    }
}

fn require<'a>(m: Option<&'a Matrix>, context: &'static str) -> Result<&'a Matrix, MatrixOpError> {
    m.ok_or(MatrixOpError::ShapeMismatch { context })
}

fn same_shape(x: &Matrix, y: &Matrix, context: &'static str) -> Result<(), MatrixOpError> {
    if x.rows == y.rows && x.columns == y.columns {
        Ok(())
    } else {
        Err(MatrixOpError::ShapeMismatch { context })
    }
}

/// Write only the logical `rows x columns` region; a fast contiguous path
/// is used when the matrix is packed (`stride == rows`).
fn fill_logical(m: &mut Matrix, value: f32) {
    if m.stride == m.rows {
        m.data[..m.rows * m.columns].fill(value);
    } else {
        for j in 0..m.columns {
            for i in 0..m.rows {
                m.set(i, j, value);
            }
        }
    }
}

fn copy_logical(dst: &mut Matrix, src: &Matrix) {
    if dst.stride == dst.rows && src.stride == src.rows {
        dst.data[..dst.rows * dst.columns].copy_from_slice(&src.data[..src.rows * src.columns]);
    } else {
        for j in 0..dst.columns {
            for i in 0..dst.rows {
                dst.set(i, j, src.get(i, j));
            }
        }
    }
}

fn binary_componentwise(
    output: &mut Matrix,
    a: Option<&Matrix>,
    b: Option<&Matrix>,
    name: &'static str,
    op: impl Fn(f32, f32) -> f32,
) -> Result<(), MatrixOpError> {
    let a = require(a, name)?;
    let b = require(b, name)?;
    same_shape(output, a, name)?;
    same_shape(output, b, name)?;
    for j in 0..output.columns {
        for i in 0..output.rows {
            output.set(i, j, op(a.get(i, j), b.get(i, j)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_is_involutive() {
        let a = Matrix::from_rows(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
        let mut at = Matrix::zeros(3, 2);
        MatrixVm::execute(MatrixOp::Transpose, &mut at, Some(&a), None).unwrap();
        let mut att = Matrix::zeros(2, 3);
        MatrixVm::execute(MatrixOp::Transpose, &mut att, Some(&at), None).unwrap();
        assert!(att.logically_eq(&a, 1e-6));
    }

    #[test]
    fn mul_identity_is_noop() {
        let a = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let id = Matrix::identity(2);
        let mut out = Matrix::zeros(2, 2);
        MatrixVm::execute(MatrixOp::Mul, &mut out, Some(&a), Some(&id)).unwrap();
        assert!(out.logically_eq(&a, 1e-6));
    }

    #[test]
    fn mullt_matches_transpose_then_mul() {
        let a = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]);
        let b = Matrix::from_rows(&[&[1.0, 0.0], &[0.0, 1.0], &[2.0, 2.0]]);

        let mut direct = Matrix::zeros(2, 2);
        MatrixVm::execute(MatrixOp::MulLt, &mut direct, Some(&a), Some(&b)).unwrap();

        let mut at = Matrix::zeros(2, 3);
        MatrixVm::execute(MatrixOp::Transpose, &mut at, Some(&a), None).unwrap();
        let mut via_transpose = Matrix::zeros(2, 2);
        MatrixVm::execute(MatrixOp::Mul, &mut via_transpose, Some(&at), Some(&b)).unwrap();

        assert!(direct.logically_eq(&via_transpose, 1e-5));
    }

    #[test]
    fn s5_matrix_multiply_with_padding() {
        let mut a = Matrix::zeros_strided(2, 2, 4);
        a.set(0, 0, 1.0);
        a.set(1, 0, 3.0);
        a.set(0, 1, 2.0);
        a.set(1, 1, 4.0);
        // Mark padding rows with sentinels that must survive untouched.
        a.data[2] = -1.0;
        a.data[3] = -1.0;
        a.data[6] = -1.0;
        a.data[7] = -1.0;

        let mut b = Matrix::zeros_strided(2, 2, 4);
        b.set(0, 0, 5.0);
        b.set(1, 0, 7.0);
        b.set(0, 1, 6.0);
        b.set(1, 1, 8.0);

        let mut out = Matrix::zeros_strided(2, 2, 4);
        MatrixVm::execute(MatrixOp::Mul, &mut out, Some(&a), Some(&b)).unwrap();

        assert_eq!(out.get(0, 0), 19.0);
        assert_eq!(out.get(0, 1), 22.0);
        assert_eq!(out.get(1, 0), 43.0);
        assert_eq!(out.get(1, 1), 50.0);

        assert_eq!(a.data[2], -1.0);
        assert_eq!(a.data[3], -1.0);
        assert_eq!(a.data[6], -1.0);
        assert_eq!(a.data[7], -1.0);
    }

    #[test]
    fn stride_does_not_affect_result() {
        let packed = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let mut strided = Matrix::zeros_strided(2, 2, 5);
        for j in 0..2 {
            for i in 0..2 {
                strided.set(i, j, packed.get(i, j));
            }
        }

        let id = Matrix::identity(2);
        let mut out_packed = Matrix::zeros(2, 2);
        let mut out_strided = Matrix::zeros_strided(2, 2, 6);

        MatrixVm::execute(MatrixOp::Mul, &mut out_packed, Some(&packed), Some(&id)).unwrap();
        MatrixVm::execute(MatrixOp::Mul, &mut out_strided, Some(&strided), Some(&id)).unwrap();

        assert!(out_packed.logically_eq(&out_strided, 1e-6));
    }

    #[test]
    fn scale_and_comp_mult() {
        let a = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let mut scaled = Matrix::zeros(2, 2);
        MatrixVm::execute(MatrixOp::Scale(2.0), &mut scaled, Some(&a), None).unwrap();
        assert_eq!(scaled.get(1, 1), 8.0);

        let mut hadamard = Matrix::zeros(2, 2);
        MatrixVm::execute(MatrixOp::CompMult, &mut hadamard, Some(&a), Some(&a)).unwrap();
        assert_eq!(hadamard.get(0, 1), 4.0);
        assert_eq!(hadamard.get(1, 1), 16.0);
    }
}
