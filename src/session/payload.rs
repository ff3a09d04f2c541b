//! Plaintext carried inside encrypted session messages.
//!
//! Control messages (display names, typing indicators) share the channel
//! with chat text and are told apart by a reserved prefix that starts with a
//! control character. User text is stripped of leading control characters
//! before sending, so it can never be mistaken for a control message.

/// Prefix marking a control message
pub const CONTROL_PREFIX: &str = "\u{1}zk:";

/// Longest display name accepted from a peer, in characters
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

const NAME_TAG: &str = "name";
const TYPING_TAG: &str = "typing";

/// Decoded session message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatPayload {
    /// User-visible chat text
    Text(String),
    /// Sender's display name
    DisplayName(String),
    /// Sender started or stopped typing
    Typing(bool),
}

impl ChatPayload {
    /// Render for encryption
    pub fn encode(&self) -> String {
        match self {
            Self::Text(text) => text.trim_start_matches('\u{1}').to_string(),
            Self::DisplayName(name) => format!("{CONTROL_PREFIX}{NAME_TAG}:{name}"),
            Self::Typing(typing) => {
                format!("{CONTROL_PREFIX}{TYPING_TAG}:{}", if *typing { "1" } else { "0" })
            }
        }
    }

    /// Parse a decrypted body; unknown control messages yield `None`
    pub fn decode(body: &str) -> Option<Self> {
        let Some(control) = body.strip_prefix(CONTROL_PREFIX) else {
            if body.starts_with('\u{1}') {
                return None;
            }
            return Some(Self::Text(body.to_string()));
        };

        match control.split_once(':') {
            Some((NAME_TAG, name)) => Some(Self::DisplayName(sanitize_display_name(name))),
            Some((TYPING_TAG, value)) => Some(Self::Typing(value == "1")),
            _ => None,
        }
    }
}

/// Strip control characters and clamp a display name
pub fn sanitize_display_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .take(MAX_DISPLAY_NAME_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_messages() {
        let name = ChatPayload::DisplayName("Alice".to_string());
        assert!(name.encode().starts_with(CONTROL_PREFIX));
        assert_eq!(ChatPayload::decode(&name.encode()), Some(name));

        assert_eq!(
            ChatPayload::decode("\u{1}zk:typing:1"),
            Some(ChatPayload::Typing(true))
        );
        assert_eq!(
            ChatPayload::decode("\u{1}zk:typing:0"),
            Some(ChatPayload::Typing(false))
        );
    }

    #[test]
    fn test_user_text_cannot_forge_control() {
        let forged = ChatPayload::Text("\u{1}zk:name:Mallory".to_string());
        let encoded = forged.encode();
        assert!(!encoded.starts_with(CONTROL_PREFIX));
        assert_eq!(
            ChatPayload::decode(&encoded),
            Some(ChatPayload::Text("zk:name:Mallory".to_string()))
        );
    }

    #[test]
    fn test_unknown_control_is_ignored() {
        assert_eq!(ChatPayload::decode("\u{1}zk:reaction:+1"), None);
        assert_eq!(ChatPayload::decode("\u{1}something"), None);
        assert_eq!(
            ChatPayload::decode("plain zk: text"),
            Some(ChatPayload::Text("plain zk: text".to_string()))
        );
    }

    #[test]
    fn test_display_name_sanitized() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_display_name(&long).len(), MAX_DISPLAY_NAME_CHARS);
        assert_eq!(sanitize_display_name("  Bob\u{7}\n "), "Bob");
    }
}
