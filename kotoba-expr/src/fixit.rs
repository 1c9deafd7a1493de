//! fix-itの適用

use crate::FixIt;
use thiserror::Error;

/// fix-it適用のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixItError {
    /// 編集範囲が重なっている
    #[error("fix-it edits overlap at offsets {first}..{first_end} and {second}..{second_end}")]
    Overlap {
        first: usize,
        first_end: usize,
        second: usize,
        second_end: usize,
    },

    /// 範囲がテキストの外、または文字境界でない
    #[error("fix-it range {start}..{end} is outside the expression text (length {len})")]
    OutOfBounds { start: usize, end: usize, len: usize },
}

/// fix-itを元テキストの座標で一括適用する
///
/// 開始位置の昇順に適用し、それまでの置換で生じたずれを累積して後続の範囲に加えます。
/// 範囲が重なる組が1つでもあれば何も適用せずにエラーを返します。
/// 同じ位置への挿入は与えられた順に並びます。
pub fn apply_fixits(text: &str, fixits: &[FixIt]) -> Result<String, FixItError> {
    let mut sorted: Vec<&FixIt> = fixits.iter().collect();
    sorted.sort_by_key(|f| (f.start, f.end));

    for fixit in &sorted {
        let in_bounds = fixit.start <= fixit.end
            && fixit.end <= text.len()
            && text.is_char_boundary(fixit.start)
            && text.is_char_boundary(fixit.end);
        if !in_bounds {
            return Err(FixItError::OutOfBounds {
                start: fixit.start,
                end: fixit.end,
                len: text.len(),
            });
        }
    }

    for pair in sorted.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        // 同じ位置への挿入どうしは重なりとみなさない
        let both_insert_here = prev.is_insertion() && prev.start == next.start;
        if next.start < prev.end && !both_insert_here {
            return Err(FixItError::Overlap {
                first: prev.start,
                first_end: prev.end,
                second: next.start,
                second_end: next.end,
            });
        }
    }

    let mut result = text.to_string();
    let mut delta: isize = 0;
    for fixit in sorted {
        let start = (fixit.start as isize + delta) as usize;
        let end = (fixit.end as isize + delta) as usize;
        result.replace_range(start..end, &fixit.replacement);
        delta += fixit.replacement.len() as isize - (fixit.end - fixit.start) as isize;
    }
    Ok(result)
}
