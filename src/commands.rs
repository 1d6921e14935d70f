/// Literal triggers answered without invoking the agent.
pub const HELP_TRIGGERS: &[&str] = &["help", "?", "what can you do", "commands"];

pub const HELP_TEXT: &str = "I'm your CRM assistant. Text me things like:\n\
- \"Add Jane Doe as a lead, 555-0100\"\n\
- \"What deals close this week?\"\n\
- \"Remind me to call the Smiths tomorrow at 10\"\n\
- \"Log a showing at 12 Oak St\"\n\
Anything that changes your data may need approval in the app.";

/// Exact, case-insensitive match after trimming surrounding whitespace.
pub fn intercept(text: &str) -> Option<&'static str> {
    let normalized = text.trim().to_lowercase();
    HELP_TRIGGERS
        .iter()
        .any(|trigger| *trigger == normalized)
        .then_some(HELP_TEXT)
}
