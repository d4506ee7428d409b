mod migrations;
mod state;

use crate::db::{Database, NewGroup, NewJob};
use crate::types::{ChatRef, GroupId, JobId, MessageRef, Source};
use tempfile::NamedTempFile;

async fn open() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn trigger(id: i32) -> MessageRef {
    MessageRef::new(ChatRef::Id(42), id)
}

fn chat_job(position: usize, message_id: i32) -> NewJob {
    NewJob {
        position,
        source: Source::ChatMedia {
            message: MessageRef::new(ChatRef::Id(42), message_id),
        },
        destination_path: format!("/Telegram/file{message_id}.bin"),
    }
}

async fn admit(db: &Database, trigger_id: i32, jobs: &[NewJob]) -> (GroupId, Vec<JobId>) {
    let group = NewGroup {
        trigger: trigger(trigger_id),
        requested: jobs.len(),
        boundary: None,
    };
    db.insert_group_with_jobs(&group, jobs).await.unwrap()
}
