//! Ambiguity and follow-up detection: indicator phrases without a
//! matching extracted entity produce clarifying questions.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{Ambiguity, ConversationContext, Entities, FollowUp};

static ASSIGNEE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"담당자|담당|맡길|맡겨|assign").expect("pattern"));
static DUE_DATE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"까지|기한|마감|deadline|due").expect("pattern"));
static PRIORITY_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"우선\s*순위|중요도|priority").expect("pattern"));
static PROJECT_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"프로젝트|project").expect("pattern"));
static REFERENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"그거|저거|이거|아까\s*그|\bit\b|that\s+one|this\s+one").expect("pattern")
});

static FOLLOW_UP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"그리고|추가로|또한|또\s|다시|마저|이어서|also|and\s+then|what\s+about")
        .expect("pattern")
});

/// Topic table for deriving what a follow-up relates to
static TOPICS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"작업|태스크|task|todo", "task"),
        (r"티켓|ticket|이슈|issue", "issue"),
        (r"문서|document|페이지|page", "document"),
        (r"일정|schedule|회의|meeting", "schedule"),
        (r"보고서|리포트|report", "report"),
        (r"메시지|message", "message"),
    ]
    .iter()
    .map(|(pattern, topic)| (Regex::new(pattern).expect("topic pattern"), *topic))
    .collect()
});

/// Indicator phrases present without the entity they indicate make the
/// request ambiguous; each gap yields one clarifying question.
pub fn detect(text: &str, entities: &Entities) -> Ambiguity {
    let mut ambiguity = Ambiguity::default();

    if ASSIGNEE_HINT.is_match(text) && entities.assignee.is_none() {
        ambiguity
            .clarifying_questions
            .push("누구에게 할당할까요?".to_string());
        ambiguity.ambiguous_terms.push("assignee".to_string());
    }
    if DUE_DATE_HINT.is_match(text) && entities.due_date.is_none() {
        ambiguity
            .clarifying_questions
            .push("마감일이 언제인가요?".to_string());
        ambiguity.ambiguous_terms.push("dueDate".to_string());
    }
    if PRIORITY_HINT.is_match(text) && entities.priority.is_none() {
        ambiguity
            .clarifying_questions
            .push("우선순위를 알려주세요.".to_string());
        ambiguity.ambiguous_terms.push("priority".to_string());
    }
    if PROJECT_HINT.is_match(text) && entities.project.is_none() {
        ambiguity
            .clarifying_questions
            .push("어떤 프로젝트인가요?".to_string());
        ambiguity.ambiguous_terms.push("project".to_string());
    }
    if let Some(m) = REFERENT.find(text) {
        ambiguity
            .clarifying_questions
            .push("어떤 항목을 말씀하시는 건가요?".to_string());
        ambiguity.ambiguous_terms.push(m.as_str().trim().to_string());
    }

    ambiguity.is_ambiguous = !ambiguity.clarifying_questions.is_empty();
    ambiguity
}

/// A follow-up needs prior conversation plus a continuation phrase; the
/// topic comes from the last assistant message.
pub fn detect_follow_up(text: &str, context: Option<&ConversationContext>) -> FollowUp {
    let Some(context) = context else {
        return FollowUp::default();
    };
    if context.messages.is_empty() || !FOLLOW_UP.is_match(text) {
        return FollowUp::default();
    }

    let related_to = context.last_assistant_message().and_then(|message| {
        let lower = message.to_lowercase();
        TOPICS
            .iter()
            .find(|(pattern, _)| pattern.is_match(&lower))
            .map(|(_, topic)| topic.to_string())
    });

    FollowUp {
        is_follow_up: true,
        related_to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatMessage, ExtractedEntity};

    #[test]
    fn test_due_date_hint_without_date_is_ambiguous() {
        let ambiguity = detect("마감까지 끝내야 해", &Entities::default());
        assert!(ambiguity.is_ambiguous);
        assert!(ambiguity.ambiguous_terms.contains(&"dueDate".to_string()));
    }

    #[test]
    fn test_hint_with_entity_is_not_ambiguous() {
        let mut entities = Entities::default();
        entities.due_date = Some(ExtractedEntity::new("2026-07-16", 0.8, 0));
        let ambiguity = detect("내일까지 끝내줘", &entities);
        assert!(!ambiguity
            .ambiguous_terms
            .contains(&"dueDate".to_string()));
    }

    #[test]
    fn test_pronoun_referent_is_ambiguous() {
        let ambiguity = detect("그거 다시 해줘", &Entities::default());
        assert!(ambiguity.is_ambiguous);
        assert!(ambiguity.ambiguous_terms.contains(&"그거".to_string()));
    }

    #[test]
    fn test_clean_request_is_unambiguous() {
        let ambiguity = detect("안녕하세요", &Entities::default());
        assert!(!ambiguity.is_ambiguous);
        assert!(ambiguity.clarifying_questions.is_empty());
    }

    #[test]
    fn test_follow_up_requires_context() {
        let follow_up = detect_follow_up("그리고 하나 더", None);
        assert!(!follow_up.is_follow_up);

        let context = ConversationContext::default();
        let follow_up = detect_follow_up("그리고 하나 더", Some(&context));
        assert!(!follow_up.is_follow_up);
    }

    #[test]
    fn test_follow_up_derives_topic() {
        let context = ConversationContext::with_messages(vec![
            ChatMessage::user("노션에 작업 만들어줘"),
            ChatMessage::assistant("작업을 생성했어요."),
        ]);
        let follow_up = detect_follow_up("그리고 슬랙에도 알려줘", Some(&context));
        assert!(follow_up.is_follow_up);
        assert_eq!(follow_up.related_to.as_deref(), Some("task"));
    }

    #[test]
    fn test_non_follow_up_text_with_context() {
        let context = ConversationContext::with_messages(vec![ChatMessage::assistant(
            "작업을 생성했어요.",
        )]);
        let follow_up = detect_follow_up("새로운 문서 만들어줘", Some(&context));
        assert!(!follow_up.is_follow_up);
    }
}
