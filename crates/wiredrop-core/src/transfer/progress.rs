//! 进度计算
//!
//! ```text
//! file_progress = fragment / fragments
//! bulk_progress = file_no / total_files + file_progress / total_files
//! ```

/// 单文件进度与批量进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub file: f64,
    pub bulk: f64,
}

/// 计算进度
///
/// 要求 `fragments >= 1`、`total_files >= 1`、`1 <= fragment <= fragments`，
/// `file_no` 从 0 开始。总数为零时由调用方提前拦截。
pub fn calculate(fragment: u32, fragments: u32, file_no: u32, total_files: u32) -> Progress {
    let fragments = f64::from(fragments);
    let total_files = f64::from(total_files);

    let file = f64::from(fragment) / fragments;
    // 通分后计算，最后一个文件的最后一片精确等于 1.0
    let bulk = (f64::from(file_no) * fragments + f64::from(fragment)) / (total_files * fragments);

    Progress { file, bulk }
}

/// 带检查的进度计算，总数为零时返回 `None`
pub fn checked_calculate(
    fragment: u32,
    fragments: u32,
    file_no: u32,
    total_files: u32,
) -> Option<Progress> {
    if fragments == 0 || total_files == 0 {
        return None;
    }
    Some(calculate(fragment, fragments, file_no, total_files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_file_quarters() {
        let values: Vec<f64> = (1..=4).map(|k| calculate(k, 4, 0, 1).file).collect();
        assert_eq!(values, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(calculate(4, 4, 0, 1).bulk, 1.0);
    }

    #[test]
    fn test_bulk_thirds() {
        assert!((calculate(1, 1, 0, 3).bulk - 1.0 / 3.0).abs() < 1e-9);
        assert!((calculate(1, 1, 1, 3).bulk - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(calculate(1, 1, 2, 3).bulk, 1.0);
    }

    #[test]
    fn test_zero_totals_rejected() {
        assert!(checked_calculate(1, 0, 0, 1).is_none());
        assert!(checked_calculate(1, 1, 0, 0).is_none());
        assert!(checked_calculate(1, 1, 0, 1).is_some());
    }

    proptest! {
        #[test]
        fn prop_bulk_progress_bounded(
            fragments in 1u32..500,
            total_files in 1u32..50,
            fragment_seed in any::<u32>(),
            file_seed in any::<u32>(),
        ) {
            let fragment = fragment_seed % fragments + 1;
            let file_no = file_seed % total_files;
            let p = calculate(fragment, fragments, file_no, total_files);
            prop_assert!((0.0..=1.0).contains(&p.file));
            prop_assert!(p.bulk >= 0.0);
            prop_assert!(p.bulk <= 1.0 + 1e-12);
        }

        #[test]
        fn prop_last_fragment_of_last_file_is_complete(
            fragments in 1u32..10_000,
            total_files in 1u32..1_000,
        ) {
            let p = calculate(fragments, fragments, total_files - 1, total_files);
            prop_assert_eq!(p.bulk, 1.0);
        }

        #[test]
        fn prop_bulk_progress_non_decreasing(
            fragments in 1u32..20,
            total_files in 1u32..10,
        ) {
            let mut last = 0.0f64;
            for file_no in 0..total_files {
                for fragment in 1..=fragments {
                    let bulk = calculate(fragment, fragments, file_no, total_files).bulk;
                    prop_assert!(bulk + 1e-12 >= last);
                    last = bulk;
                }
            }
        }
    }
}
