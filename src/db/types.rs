use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "questiontype", rename_all = "snake_case")]
pub(crate) enum QuestionType {
    SingleSelect,
    MultiSelect,
    TrueFalse,
    Numeric,
    ShortAnswer,
    FreeText,
    Other,
}

impl QuestionType {
    /// Name understood by the ML service.
    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            QuestionType::SingleSelect | QuestionType::MultiSelect => "MCQ",
            QuestionType::TrueFalse => "TRUE_FALSE",
            QuestionType::Numeric => "NUMERIC",
            QuestionType::ShortAnswer => "SHORT_ANSWER",
            QuestionType::FreeText => "LONG_ANSWER",
            QuestionType::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "sheetstatus", rename_all = "lowercase")]
pub(crate) enum SheetStatus {
    Uploaded,
    Processed,
    Annotated,
    Graded,
    Error,
}

impl SheetStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SheetStatus::Uploaded => "uploaded",
            SheetStatus::Processed => "processed",
            SheetStatus::Annotated => "annotated",
            SheetStatus::Graded => "graded",
            SheetStatus::Error => "error",
        }
    }

    /// Sheets can be graded once extraction has produced data.
    pub(crate) fn is_gradable(self) -> bool {
        matches!(self, SheetStatus::Processed | SheetStatus::Annotated)
    }

    fn rank(self) -> Option<u8> {
        match self {
            SheetStatus::Uploaded => Some(0),
            SheetStatus::Processed => Some(1),
            SheetStatus::Annotated => Some(2),
            SheetStatus::Graded => Some(3),
            SheetStatus::Error => None,
        }
    }

    /// Forward-only lifecycle. `error` is entered from `uploaded` and left
    /// only through a fresh extraction (`error -> processed`).
    pub(crate) fn can_advance_to(self, next: SheetStatus) -> bool {
        match (self, next) {
            (SheetStatus::Uploaded, SheetStatus::Error) => true,
            (SheetStatus::Error, SheetStatus::Processed) => true,
            (_, SheetStatus::Error) | (SheetStatus::Error, _) => false,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "correctness", rename_all = "lowercase")]
pub(crate) enum Correctness {
    Correct,
    Partial,
    Incorrect,
    Skipped,
}

impl Correctness {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Correctness::Correct => "correct",
            Correctness::Partial => "partial",
            Correctness::Incorrect => "incorrect",
            Correctness::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "runstatus", rename_all = "lowercase")]
pub(crate) enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}
