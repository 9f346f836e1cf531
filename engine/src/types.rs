use serde::{Deserialize, Serialize};

/// Who spoke a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Display name used when folding history into a prompt.
    pub fn display_name(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One turn of caller-supplied conversation history.
///
/// History is held only for the duration of a single request; there is
/// no server-side session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

/// Which path produced an answer.
///
/// Callers branch on this for cost and provenance: `faq` answers are
/// served from the embedding cache at zero marginal cost, `rag`
/// answers involved retrieval and possibly a generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    Faq,
    Rag,
}

/// The uniform response envelope returned by every resolver path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterResponse {
    pub response: String,
    pub source: AnswerSource,
    pub similarity_score: f32,
}

/// One curated question/answer record from the knowledge file.
///
/// Entries are immutable once loaded. Every question variant is
/// embedded; answers are keyed positionally to the entry list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaqEntry {
    pub questions: Vec<String>,
    pub answer: String,
}

/// A matched FAQ entry, as returned by the semantic matcher.
#[derive(Debug, Clone)]
pub struct FaqMatch {
    /// The stored answer, returned verbatim on the fast path.
    pub answer: String,
    /// The question variant that scored highest.
    pub question: String,
    /// Index of the entry in the knowledge file.
    pub entry_index: usize,
}
