use crate::model::turn::Turn;

pub const USER_LABEL: &str = "User:";
pub const ASSISTANT_LABEL: &str = "Assistant:";

/// Renders `persona`, every history turn and the new message into one
/// completion prompt ending with an open `Assistant:` cue.
pub fn build_prompt(persona: &str, history: &[Turn], message: &str) -> String {
    let mut prompt = String::with_capacity(persona.len() + message.len() + 64 * (history.len() + 1));
    prompt.push_str(persona);

    for turn in history {
        push_turn(&mut prompt, turn);
    }

    push_line(&mut prompt, USER_LABEL, message);
    prompt.push('\n');
    prompt.push_str(ASSISTANT_LABEL);
    prompt
}

/// Everything after the last `Assistant:` marker, trimmed.
pub fn extract_reply(decoded: &str) -> String {
    decoded
        .rsplit(ASSISTANT_LABEL)
        .next()
        .unwrap_or(decoded)
        .trim()
        .to_string()
}

/// Keeps the most recent `max_turns` turns; `0` keeps everything.
pub fn trim_history(mut history: Vec<Turn>, max_turns: usize) -> Vec<Turn> {
    if max_turns == 0 || history.len() <= max_turns {
        return history;
    }
    history.drain(0..history.len() - max_turns);
    history
}

/// The `\nUser: ..` / `\nAssistant: ..` lines one turn contributes.
pub fn render_turn(turn: &Turn) -> String {
    let mut out = String::new();
    push_turn(&mut out, turn);
    out
}

fn push_turn(prompt: &mut String, turn: &Turn) {
    if let Some(user) = &turn.user {
        push_line(prompt, USER_LABEL, user);
    }
    if let Some(bot) = &turn.bot {
        push_line(prompt, ASSISTANT_LABEL, bot);
    }
}

fn push_line(prompt: &mut String, label: &str, text: &str) {
    prompt.push('\n');
    prompt.push_str(label);
    prompt.push(' ');
    prompt.push_str(text);
}
