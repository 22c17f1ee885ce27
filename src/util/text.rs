/// テキスト処理ユーティリティ。
///
/// 生フィールド値のキャッシュキー化と、生成文の文分割を提供する。
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// 生フィールド値をマッピングキャッシュのキーに揃える。
///
/// NFKC 正規化したうえで前後空白を除き、連続する空白を 1 つにまとめる。
/// 大文字小文字は保持する（"J.S. Bach" はそのままキーになる）。
#[must_use]
pub(crate) fn cache_key(raw: &str) -> String {
    let normalized: String = raw.nfkc().collect();
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 空白のみの値を `None` として扱う。
#[must_use]
pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// テキストを文に分割する。
///
/// Unicode UAX#29 の文境界検出を使う。
#[must_use]
pub(crate) fn split_sentences(text: &str) -> Vec<&str> {
    text.unicode_sentences()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
