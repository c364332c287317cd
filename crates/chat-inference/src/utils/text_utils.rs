//! Text helpers for streamed output and model naming

use std::borrow::Cow;
use std::path::Path;

pub struct TextUtils;

impl TextUtils {
    /// Model id derived from a path: the file name with extension.
    pub fn model_id(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }

    /// Byte offset of the earliest occurrence of any stop string.
    pub fn earliest_stop(text: &str, stops: &[String]) -> Option<usize> {
        stops
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| text.find(s.as_str()))
            .min()
    }

    /// Length of the longest tail of `text` that is a proper prefix of some
    /// stop string. That tail must be held back while streaming because the
    /// next token may complete the stop.
    pub fn pending_stop_prefix(text: &str, stops: &[String]) -> usize {
        let mut longest = 0;
        for stop in stops.iter().filter(|s| !s.is_empty()) {
            let max = stop.len().saturating_sub(1).min(text.len());
            for len in (longest + 1..=max).rev() {
                let start = text.len() - len;
                if text.is_char_boundary(start) && stop.starts_with(&text[start..]) {
                    longest = len;
                    break;
                }
            }
        }
        longest
    }

    /// Truncates on a char boundary, appending an ellipsis when shortened.
    pub fn preview(text: &str, max_chars: usize) -> Cow<'_, str> {
        match text.char_indices().nth(max_chars) {
            None => Cow::Borrowed(text),
            Some((idx, _)) => Cow::Owned(format!("{}...", &text[..idx])),
        }
    }
}
