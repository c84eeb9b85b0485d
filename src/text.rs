use std::ops::Range;

/// Maps every byte offset of `line` (including `line.len()`) to the index of the char
/// that contains it.
pub fn byte_to_char_map(line: &str) -> Vec<usize> {
    let mut map = vec![0usize; line.len() + 1];
    let mut chars = 0usize;
    for (offset, ch) in line.char_indices() {
        for slot in &mut map[offset..offset + ch.len_utf8()] {
            *slot = chars;
        }
        chars += 1;
    }
    map[line.len()] = chars;
    map
}

/// Converts byte spans into char spans using a map from [`byte_to_char_map`].
/// Offsets past the end of the map are clamped to the last char.
pub fn char_spans(map: &[usize], spans: &[Range<usize>]) -> Vec<Range<usize>> {
    let Some(&last) = map.last() else {
        return Vec::new();
    };
    let at = |offset: usize| map.get(offset).copied().unwrap_or(last);
    spans.iter().map(|span| at(span.start)..at(span.end)).collect()
}

/// Control characters would move the terminal cursor; draw them as blanks.
pub fn display_char(ch: char) -> char {
    if ch.is_control() {
        ' '
    } else {
        ch
    }
}
