//! Closed status enums and their transition tables.
//!
//! Every status change in the pipeline goes through `check_transition` on the
//! relevant enum. Call sites never compare raw strings or re-derive the rules.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $entity:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// All variants, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable storage/wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Validate `self -> next` against the transition table.
            pub fn check_transition(self, next: $name) -> Result<(), DomainError> {
                if self.can_transition_to(next) {
                    Ok(())
                } else {
                    Err(DomainError::invalid_transition($entity, self, next))
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(DomainError::validation(format!(
                        "unknown {} status: {other}",
                        $entity
                    ))),
                }
            }
        }
    };
}

status_enum! {
    /// Lifecycle of an upload session.
    UploadSessionStatus, "upload session" {
        /// Created, no file seen yet.
        Pending => "pending",
        /// At least one file begun or registered.
        Uploading => "uploading",
        /// Every declared file uploaded, none failed or retrying.
        Completed => "completed",
    }
}

impl UploadSessionStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use UploadSessionStatus::*;
        matches!((self, next), (Pending, Uploading) | (Uploading, Completed))
    }
}

status_enum! {
    /// Lifecycle of a single uploaded file.
    UploadFileStatus, "uploaded file" {
        /// Write in flight, not yet durable.
        Pending => "pending",
        /// Durably stored and counted against the session.
        Uploaded => "uploaded",
        /// Last attempt failed.
        Failed => "failed",
        /// A retry was granted by the retry policy and is in flight.
        Retrying => "retrying",
    }
}

impl UploadFileStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use UploadFileStatus::*;
        matches!(
            (self, next),
            (Pending, Uploaded)
                | (Pending, Failed)
                | (Failed, Retrying)
                | (Retrying, Uploaded)
                | (Retrying, Failed)
        )
    }

    /// Unresolved failures block session completion.
    pub fn is_unresolved_failure(self) -> bool {
        matches!(self, UploadFileStatus::Failed | UploadFileStatus::Retrying)
    }
}

status_enum! {
    /// Lifecycle of a processing job.
    JobStatus, "job" {
        /// Recorded; possibly not yet handed to the queue.
        Pending => "pending",
        /// A worker reported it picked the job up.
        Running => "running",
        /// Finished successfully.
        Completed => "completed",
        /// Finished unsuccessfully; only an operator retry leaves this state.
        Failed => "failed",
    }
}

impl JobStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

status_enum! {
    /// Derived lifecycle of an audiobook.
    AudioBookStatus, "audiobook" {
        /// Creation-time default, before any job exists.
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

impl AudioBookStatus {
    /// `Completed -> Processing` happens when work-level jobs are added after every
    /// chapter job finished. `Failed -> Processing` is reserved for operator retries.
    pub fn can_transition_to(self, next: Self) -> bool {
        use AudioBookStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Processing)
                | (Completed, Failed)
                | (Failed, Processing)
        )
    }

    /// Fold job statuses into an audiobook status.
    ///
    /// Any failed job wins, then all-completed, otherwise processing. Returns
    /// `None` for an empty set: with no jobs there is nothing to derive from.
    pub fn fold<I>(jobs: I) -> Option<AudioBookStatus>
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut seen = false;
        let mut all_completed = true;
        for status in jobs {
            seen = true;
            match status {
                JobStatus::Failed => return Some(AudioBookStatus::Failed),
                JobStatus::Completed => {}
                JobStatus::Pending | JobStatus::Running => all_completed = false,
            }
        }

        match (seen, all_completed) {
            (false, _) => None,
            (true, true) => Some(AudioBookStatus::Completed),
            (true, false) => Some(AudioBookStatus::Processing),
        }
    }
}
