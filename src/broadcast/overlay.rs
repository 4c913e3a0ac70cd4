//! Attribution overlay: drawtext filter construction and escaping.
//!
//! Overlay text originates from chat (titles, handles, promo URLs), so every
//! interpolated string is escaped before it enters the filter graph. The
//! escaped metacharacters are backslash, single quote and colon - the
//! characters that would otherwise terminate or restructure a drawtext
//! argument.

/// Titles are shortened to this many characters for display.
pub const MAX_OVERLAY_TITLE_CHARS: usize = 50;

/// Escapes drawtext metacharacters in untrusted text.
///
/// Backslashes are escaped first so the escapes introduced for quotes and
/// colons are not themselves re-escaped.
#[must_use]
pub fn escape_drawtext(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            ':' => out.push_str("\\:"),
            _ => out.push(c),
        }
    }
    out
}

/// The attribution line rendered for a clip.
#[must_use]
pub fn attribution_line(title: &str, submitted_by: &str) -> String {
    let short: String = title.chars().take(MAX_OVERLAY_TITLE_CHARS).collect();
    format!("{} - requested by {submitted_by}", short.trim_end())
}

/// Builds the complete drawtext filter chain for a clip.
///
/// Line 1 is the attribution (white, 24 px); line 2, only when a promo link
/// is present, advertises it (yellow, 20 px). Both carry a 2 px black border
/// and sit in the lower-left corner.
#[must_use]
pub fn build_overlay_filter(title: &str, submitted_by: &str, promo: Option<&str>) -> String {
    let mut filters = Vec::with_capacity(2);

    let line = escape_drawtext(&attribution_line(title, submitted_by));
    filters.push(format!(
        "drawtext=text='{line}':fontsize=24:fontcolor=white:borderw=2:bordercolor=black:x=20:y=h-60"
    ));

    if let Some(promo) = promo {
        let promo_line = escape_drawtext(&format!("Hear more at: {promo}"));
        filters.push(format!(
            "drawtext=text='{promo_line}':fontsize=20:fontcolor=yellow:borderw=2:bordercolor=black:x=20:y=h-30"
        ));
    }

    filters.join(",")
}
