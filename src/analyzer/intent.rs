//! Intent classification: ordered pattern scoring per category, with
//! conversation-context overrides for short follow-up turns.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{ConversationContext, Intent};

/// Score added per matched pattern, capped at 1.0
const PATTERN_INCREMENT: f64 = 0.4;

/// A category must reach this to beat the general-query fallback
const MIN_WINNING_SCORE: f64 = 0.3;

const CONFIDENCE_FLOOR: f64 = 0.3;
const CONFIDENCE_CEILING: f64 = 0.95;

fn patterns(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|p| Regex::new(p).expect("intent pattern"))
        .collect()
}

static TASK_CREATION: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"만들어|만들|생성|추가|등록|작성",
        r"create|add\b|new\b|make|register",
        r"작업|할\s*일|태스크|task|todo|ticket|티켓",
    ])
});

static SEARCH: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"찾아|검색|조회|확인|보여",
        r"search|find|look\s*up|show|list|where",
        r"알려|뭐가|what|which",
    ])
});

static REPORT: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"보고서|리포트|정리|요약",
        r"report|summar|digest",
        r"주간|월간|weekly|monthly",
    ])
});

static APPROVAL: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"승인|결재|허가",
        r"approve|approval|sign\s*off|authorize",
        r"반려|reject",
    ])
});

static UPDATE: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"수정|변경|업데이트|바꿔",
        r"update|change|modify|edit|rename",
    ])
});

/// Previous assistant turn that finished something
static COMPLETION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"완료|처리했|생성했|추가했|created|done|completed|finished").expect("pattern")
});

static FOLLOW_UP_SHOW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"확인|보여|show|check").expect("pattern"));

static FOLLOW_UP_UPDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"수정|변경|바꿔|update").expect("pattern"));

fn category_score(patterns: &[Regex], text: &str) -> f64 {
    let mut score = 0.0;
    for pattern in patterns {
        if pattern.is_match(text) {
            score += PATTERN_INCREMENT;
        }
    }
    score.min(1.0)
}

/// Classify lowercased text into an intent and a confidence in
/// [0.3, 0.95]. Category order is fixed, so ties are deterministic.
pub fn classify(text: &str, context: Option<&ConversationContext>) -> (Intent, f64) {
    let categories: [(Intent, &Lazy<Vec<Regex>>); 5] = [
        (Intent::TaskCreation, &TASK_CREATION),
        (Intent::Search, &SEARCH),
        (Intent::Report, &REPORT),
        (Intent::Approval, &APPROVAL),
        (Intent::Update, &UPDATE),
    ];

    let mut best = (Intent::GeneralQuery, 0.0);
    for (intent, patterns) in categories {
        let score = category_score(patterns, text);
        if score > best.1 {
            best = (intent, score);
        }
    }

    let (mut intent, mut score) = if best.1 >= MIN_WINNING_SCORE {
        best
    } else {
        (Intent::GeneralQuery, MIN_WINNING_SCORE)
    };

    // After the assistant reports a completed action, a short "확인"
    // leans query and a short "수정" leans update.
    if let Some(previous) = context.and_then(|c| c.last_assistant_message()) {
        if COMPLETION.is_match(&previous.to_lowercase()) {
            if FOLLOW_UP_SHOW.is_match(text) {
                intent = Intent::Search;
                score = score.max(0.6);
            } else if FOLLOW_UP_UPDATE.is_match(text) {
                intent = Intent::Update;
                score = score.max(0.6);
            }
        }
    }

    (intent, score.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatMessage;

    #[test]
    fn test_task_creation_korean() {
        let (intent, confidence) = classify("노션에 작업 만들어줘", None);
        assert_eq!(intent, Intent::TaskCreation);
        assert!(confidence >= 0.6);
    }

    #[test]
    fn test_task_creation_english() {
        let (intent, _) = classify("create a task in linear", None);
        assert_eq!(intent, Intent::TaskCreation);
    }

    #[test]
    fn test_search_intent() {
        let (intent, _) = classify("지난주 문서 찾아줘", None);
        assert_eq!(intent, Intent::Search);
    }

    #[test]
    fn test_report_intent() {
        let (intent, confidence) = classify("주간 보고서 정리해줘", None);
        assert_eq!(intent, Intent::Report);
        assert!(confidence >= 0.6);
    }

    #[test]
    fn test_general_query_fallback() {
        let (intent, confidence) = classify("안녕하세요", None);
        assert_eq!(intent, Intent::GeneralQuery);
        assert!((confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_input() {
        let (intent, confidence) = classify("", None);
        assert_eq!(intent, Intent::GeneralQuery);
        assert!((confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_confidence_is_capped() {
        let (_, confidence) =
            classify("작업 생성 추가 등록 create add new task todo ticket", None);
        assert!(confidence <= 0.95);
    }

    #[test]
    fn test_completion_context_biases_follow_up_to_search() {
        let context = ConversationContext::with_messages(vec![
            ChatMessage::user("노션에 작업 만들어줘"),
            ChatMessage::assistant("작업을 생성했어요."),
        ]);
        let (intent, confidence) = classify("확인해줘", Some(&context));
        assert_eq!(intent, Intent::Search);
        assert!(confidence >= 0.6);
    }

    #[test]
    fn test_completion_context_biases_follow_up_to_update() {
        let context = ConversationContext::with_messages(vec![ChatMessage::assistant(
            "티켓 생성을 완료했어요",
        )]);
        let (intent, _) = classify("제목 바꿔줘", Some(&context));
        assert_eq!(intent, Intent::Update);
    }

    #[test]
    fn test_no_override_without_completion_marker() {
        let context = ConversationContext::with_messages(vec![ChatMessage::assistant(
            "어떤 작업을 만들까요?",
        )]);
        let (intent, _) = classify("오늘 일정 보여줘", Some(&context));
        assert_eq!(intent, Intent::Search);
    }
}
