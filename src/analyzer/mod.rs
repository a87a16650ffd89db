//! Request analyzer: free-form text (Korean and English) into a
//! structured intent, entities, and routing hints. Fully deterministic;
//! no network, no clock beyond the injectable reference time.

mod ambiguity;
mod entities;
mod intent;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{Complexity, ConversationContext, RequestAnalysis};

/// Tokens dropped during keyword extraction
const STOPWORDS: [&str; 24] = [
    "the", "a", "an", "to", "for", "of", "in", "on", "at", "is", "are", "be", "and", "or",
    "please", "me", "my", "좀", "그", "저", "이", "주세요", "해줘", "해주세요",
];

/// Korean particles stripped from token tails, longest first
const PARTICLES: [&str; 20] = [
    "에서", "으로", "한테", "까지", "부터", "처럼", "이랑", "은", "는", "이", "가", "을", "를",
    "에", "의", "도", "만", "로", "와", "과",
];

static CONJUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"하고\s*나서|그리고\s*나서|한\s*다음|동시에|and\s+then|after\s+that|then\s+also")
        .expect("conjunction pattern")
});

/// Domain-function vocabularies; mentioning two or more implies
/// coordinated work across agents
static DOMAIN_KEYWORDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"일정|schedule|회의|meeting",
        r"문서|document|페이지|page",
        r"메시지|message|알림|notify",
        r"이슈|issue|티켓|ticket",
        r"보고서|리포트|report",
        r"검색|search",
        r"승인|결재|approval",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("domain pattern"))
    .collect()
});

const COMPLEXITY_KEYWORD_THRESHOLD: usize = 10;
const COMPLEXITY_LENGTH_THRESHOLD: usize = 200;
const LONG_HISTORY_THRESHOLD: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct RequestAnalyzer;

impl RequestAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze one request. Identical text and context produce an
    /// identical analysis.
    pub fn analyze(&self, text: &str, context: Option<&ConversationContext>) -> RequestAnalysis {
        let normalized = text.trim().to_lowercase();
        let reference_time = context
            .and_then(|c| c.reference_time)
            .unwrap_or_else(Utc::now);

        let keywords = extract_keywords(&normalized);
        let (intent, intent_confidence) = intent::classify(&normalized, context);
        let extracted = entities::extract(&normalized, reference_time);

        let requires_multi_agent = detect_multi_agent(&normalized);
        let complexity = classify_complexity(
            text,
            &keywords,
            requires_multi_agent,
            context.map(|c| c.messages.len()).unwrap_or(0),
        );
        let ambiguity = ambiguity::detect(&normalized, &extracted);
        let follow_up = ambiguity::detect_follow_up(&normalized, context);

        RequestAnalysis {
            intent,
            intent_confidence,
            entities: extracted,
            keywords,
            requires_multi_agent,
            complexity,
            ambiguity,
            follow_up,
        }
    }

    /// Analyze with an explicit reference time (for relative dates)
    pub fn analyze_at(&self, text: &str, reference_time: DateTime<Utc>) -> RequestAnalysis {
        let context = ConversationContext {
            messages: Vec::new(),
            reference_time: Some(reference_time),
        };
        self.analyze(text, Some(&context))
    }
}

/// Lowercased tokens with punctuation trimmed, particles stripped, and
/// stopwords removed; order preserved, duplicates dropped.
fn extract_keywords(text: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    for raw in text.split_whitespace() {
        let token = raw.trim_matches(|c: char| !c.is_alphanumeric() && !is_hangul(c));
        if token.is_empty() {
            continue;
        }
        let stripped = strip_particle(token);
        if stripped.is_empty() || STOPWORDS.contains(&stripped) {
            continue;
        }
        let keyword = stripped.to_string();
        if !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
    keywords
}

fn is_hangul(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

/// Strip one trailing particle when the remainder is non-empty
fn strip_particle(token: &str) -> &str {
    for particle in PARTICLES {
        if let Some(stem) = token.strip_suffix(particle) {
            if !stem.is_empty() && stem.chars().any(is_hangul) {
                return stem;
            }
        }
    }
    token
}

/// Conjunctive phrasing, two targets, or two domain functions
fn detect_multi_agent(text: &str) -> bool {
    if CONJUNCTION.is_match(text) {
        return true;
    }
    if entities::count_targets(text) >= 2 {
        return true;
    }
    DOMAIN_KEYWORDS.iter().filter(|p| p.is_match(text)).count() >= 2
}

fn classify_complexity(
    text: &str,
    keywords: &[String],
    requires_multi_agent: bool,
    history_len: usize,
) -> Complexity {
    if requires_multi_agent || keywords.len() > COMPLEXITY_KEYWORD_THRESHOLD {
        Complexity::High
    } else if text.chars().count() > COMPLEXITY_LENGTH_THRESHOLD
        || history_len > LONG_HISTORY_THRESHOLD
    {
        Complexity::Medium
    } else {
        Complexity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatMessage, Intent};

    fn analyzer() -> RequestAnalyzer {
        RequestAnalyzer::new()
    }

    fn reference() -> DateTime<Utc> {
        "2026-07-15T09:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_empty_input_does_not_crash() {
        let analysis = analyzer().analyze_at("", reference());
        assert_eq!(analysis.intent, Intent::GeneralQuery);
        assert!((analysis.intent_confidence - 0.3).abs() < f64::EPSILON);
        assert!(analysis.keywords.is_empty());
        assert!(!analysis.requires_multi_agent);
        assert_eq!(analysis.complexity, Complexity::Low);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let text = "내일까지 노션에 긴급 작업 만들어서 @minji 한테 할당해줘";
        let a = analyzer().analyze_at(text, reference());
        let b = analyzer().analyze_at(text, reference());
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_particle_stripping() {
        let keywords = extract_keywords("노션에서 작업을 검색해줘");
        assert!(keywords.contains(&"노션".to_string()));
        assert!(keywords.contains(&"작업".to_string()));
    }

    #[test]
    fn test_stopwords_removed() {
        let keywords = extract_keywords("please create a task for the report");
        assert!(!keywords.contains(&"please".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(keywords.contains(&"task".to_string()));
    }

    #[test]
    fn test_multi_agent_via_conjunction() {
        let analysis =
            analyzer().analyze_at("문서 만들고 나서 팀에 공유해줘", reference());
        assert!(analysis.requires_multi_agent);
        assert_eq!(analysis.complexity, Complexity::High);
    }

    #[test]
    fn test_multi_agent_via_two_targets() {
        let analysis = analyzer()
            .analyze_at("깃허브 이슈 만들고 슬랙에 알려줘", reference());
        assert!(analysis.requires_multi_agent);
    }

    #[test]
    fn test_single_domain_request_is_not_multi_agent() {
        let analysis = analyzer().analyze_at("노션에 문서 만들어줘", reference());
        assert!(!analysis.requires_multi_agent);
        assert_eq!(analysis.complexity, Complexity::Low);
    }

    #[test]
    fn test_medium_complexity_from_length() {
        let long_text = "이번 분기 계획을 정리해야 하는데 ".repeat(12);
        let analysis = analyzer().analyze_at(&long_text, reference());
        assert_eq!(analysis.complexity, Complexity::Medium);
    }

    #[test]
    fn test_full_analysis_shape() {
        let analysis = analyzer().analyze_at(
            "내일까지 노션에 긴급 작업 만들어서 @minji 한테 할당해줘",
            reference(),
        );
        assert_eq!(analysis.intent, Intent::TaskCreation);
        assert_eq!(analysis.entities.target.as_ref().unwrap().value, "notion");
        assert_eq!(analysis.entities.due_date.as_ref().unwrap().value, "2026-07-16");
        assert_eq!(analysis.entities.assignee.as_ref().unwrap().value, "minji");
        assert_eq!(analysis.entities.priority.as_ref().unwrap().value, "urgent");
        assert!(!analysis.ambiguity.is_ambiguous);
    }

    #[test]
    fn test_follow_up_with_context() {
        let context = ConversationContext {
            messages: vec![
                ChatMessage::user("노션에 작업 만들어줘"),
                ChatMessage::assistant("작업을 생성했어요."),
            ],
            reference_time: Some(reference()),
        };
        let analysis = analyzer().analyze("그리고 마감일도 설정해줘", Some(&context));
        assert!(analysis.follow_up.is_follow_up);
        assert_eq!(analysis.follow_up.related_to.as_deref(), Some("task"));
    }
}
