use exam_core::model::{
    ExamId, LegacyAnswer, OptionId, QuestionDraft, QuestionId, ScoringRule, Test, TestId,
};
use storage::repository::TestRepository;

const OPTION_LABELS: [&str; 4] = ["A", "B", "C", "D"];

/// Demo exam: `questions` arithmetic questions, four options each, JEE-style marking.
///
/// The last question has no per-option marker and resolves its answer from a
/// legacy index, the way rows from older importers do.
pub fn demo_test(test_id: TestId, questions: u64, minutes: u32) -> Result<Test, Box<dyn std::error::Error>> {
    let mut built = Vec::new();
    for n in 1..=questions {
        let answer = n + 1;
        let mut draft = QuestionDraft::new(QuestionId::new(n), format!("What is {n} + 1?"));
        let legacy = n == questions;
        for (k, label) in (0_u64..).zip(OPTION_LABELS) {
            let value = answer + k;
            let id = OptionId::new(n * 10 + k + 1);
            draft = draft.option(id, format!("{label}. {value}"), !legacy && k == 0);
        }
        if legacy {
            draft = draft.legacy(LegacyAnswer::Index(0));
        }
        built.push(draft.validate()?);
    }
    Ok(Test::new(test_id, demo_exam(), "Demo arithmetic", minutes, built)?)
}

pub fn demo_exam() -> ExamId {
    ExamId::new(1)
}

pub fn demo_rule() -> Result<ScoringRule, Box<dyn std::error::Error>> {
    Ok(ScoringRule::new(4.0, -1.0, 0.0)?)
}

pub async fn seed(
    tests: &dyn TestRepository,
    test_id: TestId,
    questions: u64,
    minutes: u32,
) -> Result<Test, Box<dyn std::error::Error>> {
    let test = demo_test(test_id, questions, minutes)?;
    tests.upsert_scoring_rule(test.exam_id(), &demo_rule()?).await?;
    tests.upsert_test(&test).await?;
    Ok(test)
}
