//! Conversation store — transcripts persisted as JSON files.
//!
//! Saves are strict (a failed write surfaces the error); loads are best
//! effort and return an empty transcript on any I/O or parse failure.
//! Filenames embed epoch milliseconds, so a lexical sort of the
//! prefix-filtered listing orders files by save time.

use murex_types::agent::{ChatMessage, ConversationData};
use murex_types::error::{MurexError, MurexResult};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Characters replaced by `_` when an agent id becomes part of a filename.
const UNSAFE_FILENAME_CHARS: &[char] = &[':', '|', '@', '/', '\\', '<', '>', '*', '?', '"'];

/// Make an agent id safe for use in a filename.
pub fn sanitize_agent_id(id: &str) -> String {
    id.chars()
        .map(|c| if UNSAFE_FILENAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// JSON-file transcript persistence rooted at one directory.
pub struct ConversationStore {
    directory: PathBuf,
}

impl ConversationStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    /// Create the data directory if absent. Failure is logged, not thrown;
    /// the subsequent write surfaces the real error.
    fn ensure_directory(&self) {
        if let Err(e) = fs::create_dir_all(&self.directory) {
            warn!(
                directory = %self.directory.display(),
                error = %e,
                "Failed to create agent data directory"
            );
        }
    }

    /// Persist a transcript. With no explicit filename the template is
    /// `conversation_<sanitized_id>_<epoch_ms>.json`.
    pub fn save(&self, data: &ConversationData, filename: Option<&str>) -> MurexResult<PathBuf> {
        self.ensure_directory();
        let filename = match filename {
            Some(name) => name.to_string(),
            None => format!(
                "conversation_{}_{}.json",
                sanitize_agent_id(&data.agent_id),
                data.saved_at.timestamp_millis()
            ),
        };
        let path = self.directory.join(filename);
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&path, json)?;
        info!(
            agent = %data.agent_id,
            path = %path.display(),
            messages = data.messages.len(),
            "Conversation saved"
        );
        Ok(path)
    }

    /// Load a transcript. With no filename, the newest save for the agent
    /// wins. Any failure yields an empty sequence.
    pub fn load(&self, agent_id: &str, filename: Option<&str>) -> Vec<ChatMessage> {
        match self.try_load(agent_id, filename) {
            Ok(messages) => messages,
            Err(e) => {
                debug!(agent = %agent_id, error = %e, "No conversation loaded");
                Vec::new()
            }
        }
    }

    fn try_load(&self, agent_id: &str, filename: Option<&str>) -> MurexResult<Vec<ChatMessage>> {
        let path = match filename {
            Some(name) => self.directory.join(name),
            None => self.latest_file(agent_id).ok_or_else(|| {
                MurexError::Internal(format!("no saved conversations for agent {agent_id}"))
            })?,
        };
        let text = fs::read_to_string(path)?;
        let data: ConversationData = serde_json::from_str(&text)?;
        Ok(data.messages)
    }

    /// Newest saved file for an agent: filter on the sanitized-id prefix,
    /// sort descending by filename (which embeds epoch ms), take the first.
    fn latest_file(&self, agent_id: &str) -> Option<PathBuf> {
        let prefix = format!("conversation_{}_", sanitize_agent_id(agent_id));
        let mut names: Vec<String> = fs::read_dir(&self.directory)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".json"))
            .collect();
        names.sort_by(|a, b| b.cmp(a));
        names.first().map(|name| self.directory.join(name))
    }
}
