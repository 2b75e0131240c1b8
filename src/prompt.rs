//! System prompt composition for spoken conversation

/// Rules that always apply: replies are spoken aloud, not read
pub const BASE_RULES: &str = "\
你專門用廣東話同人傾偈。呢個係語音對話，唔係文字聊天：
- 你嘅回覆會用語音合成讀出嚟
- 唔好用任何文字符號，例如 / * () []
- 只用廣東話回覆（繁體中文），用日常口語
- 回覆簡短，通常10至30字";

/// Personality used when the client does not supply one
pub const DEFAULT_PERSONALITY: &str = "你係一個友善、樂於助人、有禮貌嘅AI助手。你體貼、有耐性。";

/// Persona selectors supplied once at session start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonaSelector {
    /// Custom role/identity
    pub role: Option<String>,
    /// Custom personality (replaces the default)
    pub personality: Option<String>,
}

/// Build the system prompt: base rules, then role, then personality
#[must_use]
pub fn build_system_prompt(persona: &PersonaSelector) -> String {
    let mut prompt = BASE_RULES.to_string();

    if let Some(role) = persona.role.as_deref().filter(|r| !r.trim().is_empty()) {
        prompt.push_str("\n\n你嘅身份：");
        prompt.push_str(role.trim());
    }

    match persona.personality.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(personality) => {
            prompt.push_str("\n\n你嘅個性：\n");
            prompt.push_str(personality.trim());
        }
        None => {
            prompt.push_str("\n\n");
            prompt.push_str(DEFAULT_PERSONALITY);
        }
    }

    prompt
}
