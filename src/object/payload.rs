//! Opaque application payload carried by events.

/// Payload of an application event.
///
/// The kernel never looks inside; it only moves payloads between objects.
/// `Text` exists for ergonomic tests, `Data` for real models, `Counter` for
/// the common "one integer" case (PHOLD hop counts, relay tokens).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum MessagePayload {
    /// Raw bytes.
    Data(Vec<u8>),
    /// Human-readable text.
    Text(String),
    /// A single integer.
    Counter(u64),
    /// No payload.
    #[default]
    Empty,
}

impl std::fmt::Display for MessagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessagePayload::Data(d) => write!(f, "Data({} bytes)", d.len()),
            MessagePayload::Text(s) => {
                if s.chars().count() > 32 {
                    let head: String = s.chars().take(32).collect();
                    write!(f, "Text(\"{}…\")", head)
                } else {
                    write!(f, "Text({:?})", s)
                }
            }
            MessagePayload::Counter(n) => write!(f, "Counter({})", n),
            MessagePayload::Empty => write!(f, "Empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_truncates_long_text() {
        let p = MessagePayload::Text("x".repeat(40));
        let shown = p.to_string();
        assert!(shown.ends_with("…\")"));
        assert!(shown.len() < 50);
    }

    #[test]
    fn test_display_variants() {
        assert_eq!(MessagePayload::Counter(7).to_string(), "Counter(7)");
        assert_eq!(MessagePayload::Data(vec![1, 2]).to_string(), "Data(2 bytes)");
        assert_eq!(MessagePayload::default(), MessagePayload::Empty);
    }
}
