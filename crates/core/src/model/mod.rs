mod answer;
mod attempt;
mod ids;
mod scoring_rule;
mod catalog;
mod xp;

pub use ids::{AttemptId, ExamId, OptionId, ParseIdError, QuestionId, TestId, UserId};

pub use answer::AnswerRecord;
pub use attempt::{Attempt, AttemptError, AttemptStatus, EndedBy};
pub use scoring_rule::{ScoringRule, ScoringRuleError};
pub use catalog::{
    AnswerOption, LegacyAnswer, OptionDraft, Question, QuestionDraft, QuestionError, Test,
    TestError,
};
pub use xp::{NewXpTransaction, ProfileXp, XpResult, XpSource, XpTransaction};
