//! Frame filename parsing.
//!
//! Producers write frames as zero-padded sequence numbers embedded in the
//! filename. The tailer needs to pull that number out and rebuild sibling
//! names (`lookahead_name`), so the parser returns the full decomposition
//! rather than just the integer.
//!
//! Three layouts are recognized, in priority order:
//!   1. `frame_camera09_000000123.jpg`  — number after the camera tag
//!   2. `frame_000000123_camera09.jpg`  — number before the camera tag
//!   3. any trailing digit run before an optional extension

/// Decomposition of a frame filename: `prefix + zeropad(num, width) + suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameName {
    pub prefix: String,
    pub num: u64,
    pub width: usize,
    pub suffix: String,
}

impl FrameName {
    /// Parse a filename into its numeric decomposition.
    /// Returns `None` when no digit run can be located.
    pub fn parse(name: &str) -> Option<FrameName> {
        parse_after_camera(name)
            .or_else(|| parse_before_camera(name))
            .or_else(|| parse_trailing(name))
    }

    /// Rebuild a filename with the same padding at `num + delta`.
    pub fn advanced(&self, delta: u64) -> String {
        render(&self.prefix, self.num + delta, self.width, &self.suffix)
    }

    /// Rebuild the original filename.
    pub fn render(&self) -> String {
        render(&self.prefix, self.num, self.width, &self.suffix)
    }
}

fn render(prefix: &str, num: u64, width: usize, suffix: &str) -> String {
    format!("{prefix}{num:0width$}{suffix}")
}

/// Split `name` into `(stem, extension)` where the extension is a final
/// `.xyz` run containing no further dot. `"a.tar.gz"` → `("a.tar", ".gz")`.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

fn trailing_digits(s: &str) -> Option<(&str, &str)> {
    let start = s.rfind(|c: char| !c.is_ascii_digit()).map(|p| p + 1).unwrap_or(0);
    let digits = &s[start..];
    if digits.is_empty() {
        return None;
    }
    Some((&s[..start], digits))
}

fn build(prefix: &str, digits: &str, suffix: &str) -> Option<FrameName> {
    let num: u64 = digits.parse().ok()?;
    Some(FrameName {
        prefix: prefix.to_string(),
        num,
        width: digits.len(),
        suffix: suffix.to_string(),
    })
}

/// Layout 1: `<anything>_camera<digits>_<digits>.<ext>`.
fn parse_after_camera(name: &str) -> Option<FrameName> {
    let (stem, ext) = split_extension(name);
    if ext.is_empty() {
        return None;
    }
    let (head, digits) = trailing_digits(stem)?;
    // The head must end with `_camera<digits>_`.
    let head_trimmed = head.strip_suffix('_')?;
    let (before_cam, cam_digits) = trailing_digits(head_trimmed)?;
    if cam_digits.is_empty() || !before_cam.ends_with("_camera") {
        return None;
    }
    build(head, digits, ext)
}

/// Layout 2: `frame_<digits>_camera<digits>.<ext>`.
fn parse_before_camera(name: &str) -> Option<FrameName> {
    let rest = name.strip_prefix("frame_")?;
    let digit_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digit_end == 0 {
        return None;
    }
    let digits = &rest[..digit_end];
    let tail = &rest[digit_end..];
    let cam = tail.strip_prefix("_camera")?;
    let (cam_digits, ext) = split_extension(cam);
    if cam_digits.is_empty() || !cam_digits.chars().all(|c| c.is_ascii_digit()) || ext.is_empty() {
        return None;
    }
    build("frame_", digits, tail)
}

/// Layout 3: last digit run before an optional extension.
fn parse_trailing(name: &str) -> Option<FrameName> {
    let (stem, ext) = split_extension(name);
    let (prefix, digits) = trailing_digits(stem)?;
    build(prefix, digits, ext)
}
