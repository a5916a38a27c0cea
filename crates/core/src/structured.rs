//! Parser for the model's structured reply convention:
//!
//! `message: <text> ||| body action: <name> ||| face: <name> ||| gaze: <name>`
//!
//! Missing segments default to `none`; text without any delimiter is treated
//! as the message.

const DELIMITER: &str = "|||";
const NONE: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredReply {
    pub text: String,
    pub action: String,
    pub emotion: String,
    pub gaze: String,
}

impl Default for StructuredReply {
    fn default() -> Self {
        Self {
            text: String::new(),
            action: NONE.to_string(),
            emotion: NONE.to_string(),
            gaze: NONE.to_string(),
        }
    }
}

impl StructuredReply {
    pub fn has_action(&self) -> bool {
        self.action != NONE
    }
}

enum Label {
    Message,
    Action,
    Face,
    Gaze,
}

/// Splits `segment` into a known label and its value, matching labels case-insensitively.
fn split_label(segment: &str) -> Option<(Label, &str)> {
    let (label, value) = segment.split_once(':')?;
    let label = match label.trim().to_ascii_lowercase().as_str() {
        "message" | "text" => Label::Message,
        "body action" | "action" | "body" => Label::Action,
        "face" | "emotion" | "expression" => Label::Face,
        "gaze" => Label::Gaze,
        _ => return None,
    };
    Some((label, value.trim()))
}

fn name_or_none(value: &str) -> String {
    if value.is_empty() {
        NONE.to_string()
    } else {
        value.to_ascii_lowercase()
    }
}

pub fn parse_structured_reply(raw: &str) -> StructuredReply {
    let mut reply = StructuredReply::default();
    let raw = raw.trim();

    if !raw.contains(DELIMITER) {
        reply.text = match split_label(raw) {
            Some((Label::Message, value)) => value.to_string(),
            _ => raw.to_string(),
        };
        return reply;
    }

    for (index, segment) in raw.split(DELIMITER).enumerate() {
        let segment = segment.trim();
        match split_label(segment) {
            Some((Label::Message, value)) => reply.text = value.to_string(),
            Some((Label::Action, value)) => reply.action = name_or_none(value),
            Some((Label::Face, value)) => reply.emotion = name_or_none(value),
            Some((Label::Gaze, value)) => reply.gaze = name_or_none(value),
            // An unlabeled leading segment is the spoken text.
            None if index == 0 => reply.text = segment.to_string(),
            None => {}
        }
    }
    reply
}
