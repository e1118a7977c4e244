use crate::error::KoopmanError;
use crate::rank::truncate;
use float_cmp::assert_approx_eq;
use ndarray::{array, s, Array2};
use std::sync::{Mutex, OnceLock};

/// Collects warn-level records so tests can check what was reported.
struct CapturingLogger {
    records: Mutex<Vec<String>>,
}

impl log::Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            if let Ok(mut records) = self.records.lock() {
                records.push(record.args().to_string());
            }
        }
    }

    fn flush(&self) {}
}

fn capturing_logger() -> &'static CapturingLogger {
    static LOGGER: OnceLock<CapturingLogger> = OnceLock::new();
    let logger = LOGGER.get_or_init(|| CapturingLogger { records: Mutex::new(Vec::new()) });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(log::LevelFilter::Warn);
    }
    logger
}

#[test]
fn test_truncate_drops_negligible_values_and_pads() {
    let logger = capturing_logger();
    let values = array![5.0, 4.0, 3.0, 0.0, -0.1];
    let vectors = Array2::<f64>::eye(5);

    let truncated = truncate(values.view(), vectors.view(), 5, 1e-6).unwrap();

    assert_eq!(truncated.rank, 5);
    assert_eq!(truncated.numerical_rank, 3);
    assert!(truncated.is_padded());
    assert_eq!(truncated.vectors.dim(), (5, 5));
    assert_eq!(truncated.values, array![5.0, 4.0, 3.0]);
    assert_eq!(truncated.vectors.slice(s![.., ..3]), Array2::<f64>::eye(5).slice(s![.., ..3]));
    assert!(truncated.vectors.slice(s![.., 3..]).iter().all(|&x| x == 0.0));
    assert_eq!(truncated.active_vectors().ncols(), 3);

    let records = logger.records.lock().unwrap();
    assert!(
        records.iter().any(|r| r.contains("discarding 2 degrees of freedom")),
        "expected a rank-deficiency warning, got {:?}",
        *records
    );
}

#[test]
fn test_truncate_selects_largest_values_with_their_vectors() {
    let values = array![1.0, 7.0, 3.0];
    let vectors = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];

    let truncated = truncate(values.view(), vectors.view(), 2, 1e-12).unwrap();

    assert!(!truncated.is_padded());
    assert_approx_eq!(f64, truncated.values[0], 7.0);
    assert_approx_eq!(f64, truncated.values[1], 3.0);
    assert_eq!(truncated.vectors, array![[2.0, 3.0], [5.0, 6.0], [8.0, 9.0]]);
}

#[test]
fn test_truncate_accepts_more_eigenpairs_than_rank() {
    // Iterative paths hand over a few extra eigenpairs.
    let values = array![0.5, 2.0, 1.0, 4.0, 3.0];
    let vectors = Array2::<f64>::eye(6).slice(s![.., ..5]).to_owned();

    let truncated = truncate(values.view(), vectors.view(), 3, 1e-12).unwrap();

    assert_eq!(truncated.values, array![4.0, 3.0, 2.0]);
    assert_eq!(truncated.vectors.column(0), vectors.column(3));
    assert_eq!(truncated.vectors.column(2), vectors.column(1));
}

#[test]
fn test_truncate_rejects_invalid_rank() {
    let values = array![2.0, 1.0];
    let vectors = Array2::<f64>::eye(2);
    assert!(matches!(
        truncate(values.view(), vectors.view(), 3, 1e-12),
        Err(KoopmanError::InvalidRank { rank: 3, dim: 2 })
    ));
    assert!(matches!(
        truncate(values.view(), vectors.view(), 0, 1e-12),
        Err(KoopmanError::InvalidRank { rank: 0, dim: 2 })
    ));
}

#[test]
fn test_truncate_rejects_mismatched_pairs() {
    let values = array![2.0, 1.0, 0.5];
    let vectors = Array2::<f64>::eye(2);
    assert!(matches!(
        truncate(values.view(), vectors.view(), 1, 1e-12),
        Err(KoopmanError::DimensionMismatch(_))
    ));
}
