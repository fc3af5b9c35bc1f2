//! Square-matrix helpers: raw f32 file I/O and the inversions needed to turn
//! solver output into mixing/unmixing pairs.
//!
//! Files are row-major little-endian f32 with no header; a file for an
//! `n × n` matrix is exactly `n² × 4` bytes.

use std::fs;
use std::path::Path;

use nalgebra::DMatrix;

use crate::error::{IcaError, Result};

pub type Matrix = DMatrix<f32>;

const F32_BYTES: u64 = 4;

/// Read an `n × n` row-major matrix, validating the file length first.
pub fn read_square_matrix(path: &Path, n: usize) -> Result<Matrix> {
    let raw = fs::read(path).map_err(|e| IcaError::io(path, e))?;
    let expected = (n * n) as u64 * F32_BYTES;
    if raw.len() as u64 != expected {
        return Err(IcaError::MatrixFileSize {
            path: path.to_path_buf(),
            expected,
            actual: raw.len() as u64,
        });
    }
    let values: Vec<f32> = raw
        .chunks_exact(F32_BYTES as usize)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(DMatrix::from_row_slice(n, n, &values))
}

/// Write `m` row-major.
pub fn write_matrix(path: &Path, m: &Matrix) -> Result<()> {
    let mut raw = Vec::with_capacity(m.len() * F32_BYTES as usize);
    for r in 0..m.nrows() {
        for c in 0..m.ncols() {
            raw.extend_from_slice(&m[(r, c)].to_le_bytes());
        }
    }
    fs::write(path, raw).map_err(|e| IcaError::io(path, e))
}

fn widen(m: &Matrix) -> DMatrix<f64> {
    m.map(|x| x as f64)
}

fn narrow(m: &DMatrix<f64>) -> Matrix {
    m.map(|x| x as f32)
}

/// Inverse computed in f64.
pub fn invert(m: &Matrix) -> Result<Matrix> {
    if !m.is_square() {
        return Err(IcaError::SingularMatrix);
    }
    widen(m)
        .try_inverse()
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
        .map(|inv| narrow(&inv))
        .ok_or(IcaError::SingularMatrix)
}

/// Largest singular value.
pub fn spectral_norm(m: &Matrix) -> f64 {
    if m.is_empty() {
        return 0.0;
    }
    widen(m)
        .svd(false, false)
        .singular_values
        .iter()
        .copied()
        .fold(0.0, f64::max)
}

/// Combine solver output into the unmixing matrix:
/// `weights · (sphere / σ_max(sphere))`.
pub fn unmixing_from_solver(weights: &Matrix, sphere: &Matrix) -> Result<Matrix> {
    let norm = spectral_norm(sphere);
    if norm <= f64::EPSILON || !norm.is_finite() {
        return Err(IcaError::SingularMatrix);
    }
    let unmixing = widen(weights) * (widen(sphere) / norm);
    Ok(narrow(&unmixing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample() -> Matrix {
        DMatrix::from_row_slice(3, 3, &[2.0, 0.5, 0.0, -1.0, 3.0, 0.25, 0.1, 0.0, 1.5])
    }

    #[test]
    fn file_round_trip_is_exact_and_row_major() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixing.bin");
        let m = sample();
        write_matrix(&path, &m).unwrap();

        let raw = fs::read(&path).unwrap();
        assert_eq!(raw.len(), 36);
        // second value on disk is row 0, column 1
        assert_eq!(f32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]), 0.5);

        assert_eq!(read_square_matrix(&path, 3).unwrap(), m);
    }

    #[test]
    fn wrong_length_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binica.wts");
        fs::write(&path, [0u8; 20]).unwrap();
        match read_square_matrix(&path, 3) {
            Err(IcaError::MatrixFileSize {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 36);
                assert_eq!(actual, 20);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_square_matrix(Path::new("/nonexistent/binica.sph"), 2).unwrap_err();
        assert!(matches!(err, IcaError::Io { .. }));
    }

    #[test]
    fn inverse_times_original_is_identity() {
        let m = sample();
        let inv = invert(&m).unwrap();
        let prod = &m * &inv;
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(prod[(r, c)], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0f32, 2.0, 2.0, 4.0]);
        assert!(matches!(invert(&m), Err(IcaError::SingularMatrix)));
    }

    #[test]
    fn sphere_is_normalised_by_largest_singular_value() {
        let weights = Matrix::identity(2, 2);
        let sphere = DMatrix::from_row_slice(2, 2, &[4.0f32, 0.0, 0.0, 2.0]);
        let u = unmixing_from_solver(&weights, &sphere).unwrap();
        assert_abs_diff_eq!(u[(0, 0)], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(u[(1, 1)], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(spectral_norm(&sphere), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_sphere_cannot_be_normalised() {
        let z = Matrix::zeros(2, 2);
        assert!(unmixing_from_solver(&Matrix::identity(2, 2), &z).is_err());
    }
}
