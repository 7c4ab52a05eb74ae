//! Record assembly: turns document metadata (plus chunks, for text
//! documents) into the record shells handed to the embedding stage.

use std::collections::HashSet;

use crate::chunk::TextChunk;
use crate::mime::entity_for_mime;
use crate::models::{DocumentMetadata, PermissionSet, RecordKey, RecordProperties, SOURCE_APP};

/// One shell per chunk of a text document, in chunk order.
///
/// Chunk indices come from the chunker, so they are already contiguous and
/// in document order before any parallel work touches them.
pub fn document_records(
    meta: &DocumentMetadata,
    permissions: &PermissionSet,
    chunks: Vec<TextChunk>,
) -> Vec<RecordProperties> {
    chunks
        .into_iter()
        .map(|c| RecordProperties {
            chunk_index: c.chunk_index,
            chunk: c.text,
            ..shell(meta, permissions)
        })
        .collect()
}

/// The single title-only shell for a file without extracted text.
pub fn file_record(meta: &DocumentMetadata, permissions: &PermissionSet) -> RecordProperties {
    shell(meta, permissions)
}

fn shell(meta: &DocumentMetadata, permissions: &PermissionSet) -> RecordProperties {
    let owner = meta.owner.as_ref();
    RecordProperties {
        doc_id: meta.id.clone(),
        chunk_index: 0,
        title: meta.title.clone(),
        chunk: String::new(),
        url: meta.url.clone().unwrap_or_default(),
        app: SOURCE_APP.to_string(),
        entity: entity_for_mime(&meta.mime_type),
        mime_type: meta.mime_type.clone(),
        owner: owner.and_then(|o| o.display_name.clone()),
        owner_email: owner.and_then(|o| o.email_address.clone()),
        owner_photo: owner.and_then(|o| o.photo_link.clone()),
        permissions: permissions.clone(),
    }
}

/// Return the first `(docId, chunkIndex)` that appears more than once.
pub fn first_duplicate<'a, I>(records: I) -> Option<RecordKey>
where
    I: IntoIterator<Item = &'a RecordProperties>,
{
    let mut seen = HashSet::new();
    records
        .into_iter()
        .map(RecordProperties::key)
        .find(|key| !seen.insert(key.clone()))
}
