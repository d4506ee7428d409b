//! In-memory collaborators: a content proxy over byte buffers and a recording chat surface

use bytes::Bytes;
use chat_relay::{
    ChatRef, ContentProxy, ConversationSurface, FetchError, MediaInfo, MessageRef, Result,
    SourceStream,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;

/// Chat every test request comes from
pub fn test_chat() -> ChatRef {
    ChatRef::Id(-1_000_777)
}

/// Message `id` in the test chat
pub fn msg(id: i32) -> MessageRef {
    MessageRef::new(test_chat(), id)
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i % 253) as u8).wrapping_add(seed))
        .collect()
}

/// Content proxy serving media from memory in fixed-size blocks
pub struct MemoryProxy {
    media: Mutex<HashMap<MessageRef, (String, Bytes)>>,
    block_size: usize,
}

impl MemoryProxy {
    /// Proxy delivering `block_size` bytes per stream item
    pub fn new(block_size: usize) -> Self {
        Self {
            media: Mutex::new(HashMap::new()),
            block_size: block_size.max(1),
        }
    }

    /// Attach a named document to `message`
    pub fn add(&self, message: MessageRef, name: &str, data: impl Into<Bytes>) {
        self.media
            .lock()
            .unwrap()
            .insert(message, (name.to_string(), data.into()));
    }

    fn stream(&self, message: &MessageRef, offset: u64) -> std::result::Result<SourceStream, FetchError> {
        let data = self
            .media
            .lock()
            .unwrap()
            .get(message)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| FetchError::MessageNotFound(message.to_string()))?;
        let size = data.len() as u64;
        let block = self.block_size;
        let rest = data.slice((offset as usize).min(data.len())..);
        let blocks: Vec<std::result::Result<Bytes, FetchError>> = (0..rest.len())
            .step_by(block)
            .map(|at| Ok(rest.slice(at..(at + block).min(rest.len()))))
            .collect();
        Ok(SourceStream {
            stream: futures::stream::iter(blocks).boxed(),
            size: Some(size),
        })
    }
}

#[async_trait::async_trait]
impl ContentProxy for MemoryProxy {
    async fn describe(&self, message: &MessageRef) -> std::result::Result<MediaInfo, FetchError> {
        let media = self.media.lock().unwrap();
        let (name, data) = media
            .get(message)
            .ok_or_else(|| FetchError::MessageNotFound(message.to_string()))?;
        Ok(MediaInfo {
            file_id: i64::from(message.message_id),
            file_name: Some(name.clone()),
            mime_type: None,
            size: Some(data.len() as u64),
            is_photo: false,
        })
    }

    async fn fetch_media(
        &self,
        message: &MessageRef,
        offset: u64,
    ) -> std::result::Result<SourceStream, FetchError> {
        self.stream(message, offset)
    }

    async fn open_restricted(
        &self,
        channel: &ChatRef,
        message_id: i32,
        offset: u64,
    ) -> std::result::Result<SourceStream, FetchError> {
        self.stream(&MessageRef::new(channel.clone(), message_id), offset)
    }

    async fn resolve_message_range(
        &self,
        channel: &ChatRef,
        start_id: i32,
        count: usize,
    ) -> std::result::Result<Vec<MessageRef>, FetchError> {
        let media = self.media.lock().unwrap();
        let mut found: Vec<MessageRef> = media
            .keys()
            .filter(|m| {
                &m.chat == channel
                    && m.message_id >= start_id
                    && i64::from(m.message_id) < i64::from(start_id) + count as i64
            })
            .cloned()
            .collect();
        if found.is_empty() && media.keys().all(|m| m.message_id < start_id) {
            return Err(FetchError::ChannelEnd);
        }
        found.sort_by_key(|m| m.message_id);
        Ok(found)
    }
}

/// Conversation surface keeping every message it was asked to send, edit or delete
#[derive(Default)]
pub struct RecordingSurface {
    sent: Mutex<Vec<(MessageRef, String)>>,
    edits: Mutex<Vec<(MessageRef, String)>>,
    deleted: Mutex<Vec<MessageRef>>,
}

impl RecordingSurface {
    /// Latest text shown in `status`
    pub fn text_of(&self, status: &MessageRef) -> Option<String> {
        let edited = self
            .edits
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == status)
            .map(|(_, text)| text.clone());
        edited.or_else(|| {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .find(|(m, _)| m == status)
                .map(|(_, text)| text.clone())
        })
    }

    /// Messages deleted so far
    pub fn deleted(&self) -> Vec<MessageRef> {
        self.deleted.lock().unwrap().clone()
    }

    /// Number of status messages posted
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ConversationSurface for RecordingSurface {
    async fn send_message(
        &self,
        chat: &ChatRef,
        _reply_to: Option<i32>,
        text: &str,
    ) -> Result<MessageRef> {
        let mut sent = self.sent.lock().unwrap();
        let message = MessageRef::new(chat.clone(), 50_000 + sent.len() as i32);
        sent.push((message.clone(), text.to_string()));
        Ok(message)
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()> {
        self.edits
            .lock()
            .unwrap()
            .push((message.clone(), text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<()> {
        self.deleted.lock().unwrap().push(message.clone());
        Ok(())
    }
}
