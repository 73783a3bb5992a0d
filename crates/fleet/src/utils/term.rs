use owo_colors::OwoColorize as _;
use regex::Regex;
use std::sync::OnceLock;

fn ansi_regex() -> &'static Regex {
  static ANSI_RE: OnceLock<Regex> = OnceLock::new();
  ANSI_RE.get_or_init(|| {
    Regex::new(
      r"(?x)
      \x1B\[[0-?]*[ -/]*[@-~]    # CSI sequence
      |                            # or
      \x1B\][^\x07\x1B]*(?:\x07|\x1B\\)  # OSC sequence terminated by BEL or ST
    ",
    )
    .expect("valid ANSI regex")
  })
}

pub fn strip_ansi_control_codes(input: &str) -> String {
  ansi_regex().replace_all(input, "").into_owned()
}

/// Keep at most `max_chars` characters from the end of `text`.
#[must_use]
pub fn tail_chars(text: &str, max_chars: usize) -> String {
  let count = text.chars().count();
  if count <= max_chars {
    return text.to_string();
  }
  text.chars().skip(count - max_chars).collect()
}

/// Print a simple ASCII table to stdout.
/// Column widths are derived from headers and string lengths of rows.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
  let cols = headers.len();
  let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
  for row in rows {
    for (i, cell) in row.iter().enumerate().take(cols) {
      let vlen = visible_len(cell);
      if vlen > widths[i] {
        widths[i] = vlen;
      }
    }
  }

  let mut header_line = String::new();
  for (i, text) in headers.iter().enumerate() {
    header_line.push_str(text);
    if i + 1 < cols {
      let spaces = widths[i].saturating_sub(text.len()) + 1;
      header_line.push_str(&" ".repeat(spaces));
    }
  }
  anstream::println!("{}", header_line.dimmed());

  for row in rows {
    let mut line = String::new();
    for (i, cell) in row.iter().enumerate().take(cols) {
      line.push_str(cell);
      if i + 1 < cols {
        let spaces = widths[i].saturating_sub(visible_len(cell)) + 1;
        line.push_str(&" ".repeat(spaces));
      }
    }
    anstream::println!("{}", line);
  }
}

fn visible_len(s: &str) -> usize {
  strip_ansi_control_codes(s).chars().count()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_csi_and_osc_sequences() {
    let raw = "\x1b[32mready\x1b[0m \x1b]0;title\x07done";
    assert_eq!(strip_ansi_control_codes(raw), "ready done");
  }

  #[test]
  fn visible_len_ignores_styling() {
    assert_eq!(visible_len("\x1b[1mabc\x1b[0m"), 3);
  }

  #[test]
  fn tail_chars_respects_multibyte_boundaries() {
    assert_eq!(tail_chars("héllo wörld", 5), "wörld");
    assert_eq!(tail_chars("short", 10), "short");
  }
}
