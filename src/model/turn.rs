use serde::Deserialize;

/// One exchange in the caller-supplied history.
///
/// Accepts both `{ "user": .., "bot": .. }` and the frontend's
/// `{ "sender": "user" | "bot", "text": .. }` shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawTurn")]
pub struct Turn {
    pub user: Option<String>,
    pub bot: Option<String>,
}

#[cfg(test)]
impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            user: Some(text.into()),
            bot: None,
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            user: None,
            bot: Some(text.into()),
        }
    }
}

#[derive(Deserialize)]
struct RawTurn {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot: Option<String>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl From<RawTurn> for Turn {
    fn from(raw: RawTurn) -> Self {
        let mut turn = Turn {
            user: raw.user,
            bot: raw.bot,
        };

        if let (Some(sender), Some(text)) = (raw.sender, raw.text) {
            match sender.as_str() {
                "user" if turn.user.is_none() => turn.user = Some(text),
                "bot" if turn.bot.is_none() => turn.bot = Some(text),
                _ => {}
            }
        }

        turn
    }
}
