// Title -> file/folder name

/// Replacements applied in order. Escaped forms come first so `\"` is not
/// split into a look-alike backslash followed by quotes.
const REPLACEMENTS: [(&str, &str); 11] = [
    ("\\u0026", "&"),
    ("\\\"", "''"),
    ("\"", "''"),
    ("|", "⏐"),
    ("?", "？"),
    ("\\", "⧵"),
    ("/", "∕"),
    (":", "ː"),
    ("*", "⁎"),
    ("<", "﹤"),
    (">", "﹥"),
];

/// Replace characters that are illegal in file names with Unicode look-alikes.
///
/// Nothing else is touched: whitespace, emoji and dots pass through as-is.
pub fn sanitize(raw: &str) -> String {
    REPLACEMENTS
        .iter()
        .fold(raw.to_string(), |acc, (from, to)| acc.replace(from, to))
}
