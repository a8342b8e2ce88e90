use super::models::{Event, EventType};

pub const DEFAULT_SNAPSHOT_PREVIEW_CHARS: usize = 1200;

/// Render events as one ordered, human-readable transcript.
///
/// Code snapshots are cut to `snapshot_preview_chars` characters with a marker
/// saying how much was dropped.
pub fn render_transcript(events: &[Event], snapshot_preview_chars: usize) -> String {
    let mut out = String::new();
    for event in events {
        match event.event_type {
            EventType::Prompt => {
                out.push_str(&format!(
                    "[{}] [{}] INTERVIEWER: {}\n",
                    event.seq,
                    event.stage_name,
                    event.payload.trim()
                ));
            }
            EventType::Response => {
                out.push_str(&format!(
                    "[{}] [{}] CANDIDATE: {}\n",
                    event.seq,
                    event.stage_name,
                    event.payload.trim()
                ));
            }
            EventType::CodeSnapshot => {
                let language = event
                    .snapshot_metadata()
                    .and_then(|m| m.language)
                    .unwrap_or_else(|| "text".to_string());
                let (preview, dropped) = truncate_chars(&event.payload, snapshot_preview_chars);
                out.push_str(&format!(
                    "[{}] [{}] CODE SNAPSHOT ({}):\n```{}\n{}\n```\n",
                    event.seq,
                    event.stage_name,
                    language,
                    language,
                    preview.trim_end()
                ));
                if dropped > 0 {
                    out.push_str(&format!("[truncated: {} more characters]\n", dropped));
                }
            }
        }
    }
    out
}

/// First `max` characters of `s`, plus how many characters were dropped.
pub fn truncate_chars(s: &str, max: usize) -> (&str, usize) {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => (&s[..byte_idx], s[byte_idx..].chars().count()),
        None => (s, 0),
    }
}
