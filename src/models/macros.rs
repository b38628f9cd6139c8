//! Saved text snippets ("macros") scoped to a channel or a conversation.

use serde::{Deserialize, Serialize};

/// A stored macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macro {
    /// Channel name, or conversation id when `is_conv`
    pub scope_name: String,
    pub is_conv: bool,
    pub name: String,
    pub message: String,
}

/// Where a macro command was issued.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MacroScope {
    /// Channel-wide name (team channel or conversation name)
    pub channel_name: String,
    /// Id of the specific conversation
    pub conversation_id: String,
}

impl MacroScope {
    /// Scope name a macro is stored under.
    pub fn name_for(&self, is_conv: bool) -> &str {
        if is_conv {
            &self.conversation_id
        } else {
            &self.channel_name
        }
    }
}

/// Document id for a macro.
pub fn macro_doc_id(scope_name: &str, is_conv: bool, name: &str) -> String {
    format!(
        "{}:{}:{}",
        urlencoding::encode(scope_name),
        if is_conv { "conv" } else { "channel" },
        urlencoding::encode(name)
    )
}
