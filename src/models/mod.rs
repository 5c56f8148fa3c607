pub mod answer;
pub mod feedback;
pub mod module;
pub mod question;
pub mod rubric;
pub mod submission;
pub mod teacher_grade;

pub use answer::{AnswerPayload, StudentAnswer};
pub use module::ModuleSettings;
pub use feedback::{
    Confidence, CriterionScore, FeedbackContent, FeedbackRecord, GenerationErrorKind,
    GenerationStatus,
};
pub use question::{
    BlankSpec, CorrectAnswer, Question, QuestionStatus, QuestionType, SubQuestionSpec,
};
pub use rubric::{ModuleRubric, RubricConfig, RubricOverride};
pub use submission::TestSubmission;
pub use teacher_grade::TeacherGrade;
