//! Audiobooks, their chapters, and chapter transcripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{AudioBookId, ChapterId, UploadSessionId, UploadedFileId, UserId};
use crate::status::{AudioBookStatus, UploadFileStatus};
use crate::upload::UploadedFile;

/// Caller-supplied descriptive fields for a new audiobook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAudioBook {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

impl NewAudioBook {
    pub fn validate(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::validation("title must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioBook {
    pub id: AudioBookId,
    pub owner: UserId,
    pub source_session_id: Option<UploadSessionId>,
    pub title: String,
    pub author: Option<String>,
    pub language: Option<String>,
    pub is_public: bool,
    /// Derived from the audiobook's jobs after creation.
    pub status: AudioBookStatus,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AudioBook {
    pub fn new(
        owner: UserId,
        source_session_id: Option<UploadSessionId>,
        fields: NewAudioBook,
    ) -> DomainResult<Self> {
        fields.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: AudioBookId::new(),
            owner,
            source_session_id,
            title: fields.title,
            author: fields.author,
            language: fields.language,
            is_public: fields.is_public,
            status: AudioBookStatus::Pending,
            summary: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn transition(&mut self, next: AudioBookStatus) -> DomainResult<()> {
        self.status.check_transition(next)?;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Entity for AudioBook {
    type Id = AudioBookId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub audiobook_id: AudioBookId,
    /// 1-based, unique and contiguous within the audiobook.
    pub number: u32,
    pub title: String,
    pub source_file_id: UploadedFileId,
    pub storage_path: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

impl Chapter {
    fn from_file(audiobook_id: AudioBookId, number: u32, title: String, file: &UploadedFile) -> Self {
        Self {
            id: ChapterId::new(),
            audiobook_id,
            number,
            title,
            source_file_id: file.id,
            storage_path: file.metadata.storage_path.clone(),
            mime_type: file.metadata.mime_type.clone(),
            created_at: Utc::now(),
        }
    }

    /// Lay out the chapters of a new audiobook from its session's files.
    ///
    /// Without chapter numbers the upload is a single-file upload and yields
    /// one chapter titled after the book. With chapter numbers every file needs
    /// one, and the numbers must run 1..=N without gaps or repeats.
    pub fn plan(
        audiobook_id: AudioBookId,
        book_title: &str,
        files: &[UploadedFile],
    ) -> DomainResult<Vec<Chapter>> {
        if files.is_empty() {
            return Err(DomainError::validation("an audiobook needs at least one file"));
        }
        if let Some(f) = files.iter().find(|f| f.status != UploadFileStatus::Uploaded) {
            return Err(DomainError::validation(format!(
                "file {} is {}, not uploaded",
                f.id, f.status
            )));
        }

        let numbered = files.iter().filter(|f| f.metadata.chapter_number.is_some()).count();

        if numbered == 0 {
            if files.len() != 1 {
                return Err(DomainError::validation(
                    "multi-file uploads must number every chapter",
                ));
            }
            return Ok(vec![Chapter::from_file(
                audiobook_id,
                1,
                book_title.to_string(),
                &files[0],
            )]);
        }

        if numbered != files.len() {
            return Err(DomainError::validation(
                "either every file carries a chapter number or none does",
            ));
        }

        let mut ordered: Vec<&UploadedFile> = files.iter().collect();
        ordered.sort_by_key(|f| f.metadata.chapter_number);

        ordered
            .into_iter()
            .enumerate()
            .map(|(idx, file)| {
                let expected = idx as u32 + 1;
                let number = file.metadata.chapter_number.unwrap_or_default();
                if number != expected {
                    return Err(DomainError::validation(format!(
                        "chapter numbers must be unique and contiguous from 1; expected {expected}, found {number}"
                    )));
                }
                let title = file
                    .metadata
                    .chapter_title
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| file.metadata.file_name.clone());
                Ok(Chapter::from_file(audiobook_id, number, title, file))
            })
            .collect()
    }
}

impl Entity for Chapter {
    type Id = ChapterId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Transcription output for one chapter. Its existence satisfies the chapter's
/// share of the completion barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterTranscript {
    pub chapter_id: ChapterId,
    pub content: String,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChapterTranscript {
    pub fn new(chapter_id: ChapterId, content: impl Into<String>, language: Option<String>) -> Self {
        Self {
            chapter_id,
            content: content.into(),
            language,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::FileMetadata;

    fn file(name: &str, chapter: Option<u32>) -> UploadedFile {
        UploadedFile::uploaded(
            UploadSessionId::new(),
            FileMetadata {
                file_name: name.into(),
                size_bytes: 1,
                mime_type: "audio/mpeg".into(),
                storage_path: format!("s3://bucket/{name}"),
                chapter_number: chapter,
                chapter_title: None,
            },
            3,
        )
        .unwrap()
    }

    #[test]
    fn single_file_gets_book_title() {
        let book = AudioBookId::new();
        let chapters = Chapter::plan(book, "Moby Dick", &[file("whole.mp3", None)]).unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].number, 1);
        assert_eq!(chapters[0].title, "Moby Dick");
        assert_eq!(chapters[0].audiobook_id, book);
    }

    #[test]
    fn numbered_files_are_ordered_and_titled_by_name() {
        let files = [file("c.mp3", Some(3)), file("a.mp3", Some(1)), file("b.mp3", Some(2))];
        let chapters = Chapter::plan(AudioBookId::new(), "Book", &files).unwrap();
        let titles: Vec<_> = chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["a.mp3", "b.mp3", "c.mp3"]);
    }

    #[test]
    fn gaps_duplicates_and_mixes_are_rejected() {
        let gap = [file("a", Some(1)), file("c", Some(3))];
        let dup = [file("a", Some(1)), file("b", Some(1))];
        let mixed = [file("a", Some(1)), file("b", None)];
        let many_unnumbered = [file("a", None), file("b", None)];
        for files in [&gap[..], &dup[..], &mixed[..], &many_unnumbered[..]] {
            assert!(matches!(
                Chapter::plan(AudioBookId::new(), "Book", files),
                Err(DomainError::Validation(_))
            ));
        }
    }

    #[test]
    fn blank_title_is_rejected() {
        let fields = NewAudioBook {
            title: "  ".into(),
            author: None,
            language: None,
            is_public: false,
        };
        assert!(AudioBook::new(UserId::new(), None, fields).is_err());
    }
}
