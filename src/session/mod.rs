//! 세션 모듈 - 인메모리 대화 히스토리 관리
//!
//! 대화 히스토리는 파이프라인 밖에서 소유됩니다. 파이프라인은 호출마다
//! 여기서 꺼낸 히스토리 목록을 읽기 전용으로 전달받을 뿐입니다.
//! TTL이 지난 세션은 접근 시점에 정리됩니다.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::llm::{ChatMessage, ChatRole};

/// 기본 세션 TTL (1시간)
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

// ============================================================================
// Session
// ============================================================================

/// 대화 세션
#[derive(Debug)]
struct Session {
    history: Vec<ChatMessage>,
    last_accessed: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            history: Vec::new(),
            last_accessed: Instant::now(),
        }
    }
}

// ============================================================================
// SessionManager
// ============================================================================

/// TTL 기반 세션 관리자
///
/// 내부 락으로 보호되므로 여러 요청에서 동시에 사용할 수 있습니다.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionManager {
    /// TTL을 지정하여 생성
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 기본 TTL(1시간)로 생성
    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    /// 세션 조회 또는 생성
    ///
    /// # Arguments
    /// * `session_id` - 기존 세션 ID (None이면 새 ID 발급)
    ///
    /// # Returns
    /// 세션 ID (기존 또는 신규)
    pub fn get_or_create(&self, session_id: Option<&str>) -> String {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        self.cleanup_stale(&mut sessions);

        if let Some(id) = session_id {
            if let Some(session) = sessions.get_mut(id) {
                session.last_accessed = Instant::now();
                return id.to_string();
            }
        }

        let new_id = session_id
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        sessions.insert(new_id.clone(), Session::new());
        new_id
    }

    /// 세션에 메시지 추가 (없는 세션이면 무시)
    pub fn add_message(&self, session_id: &str, role: ChatRole, content: impl Into<String>) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");

        if let Some(session) = sessions.get_mut(session_id) {
            session.history.push(ChatMessage {
                role,
                content: content.into(),
            });
            session.last_accessed = Instant::now();
        }
    }

    /// 세션 히스토리 조회 (마지막 `max_turns * 2`개 메시지)
    pub fn history(&self, session_id: &str, max_turns: usize) -> Vec<ChatMessage> {
        let sessions = self.sessions.lock().expect("session lock poisoned");

        match sessions.get(session_id) {
            Some(session) => {
                let max_messages = max_turns * 2;
                let start = session.history.len().saturating_sub(max_messages);
                session.history[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// 세션 삭제
    ///
    /// # Returns
    /// 세션이 존재했으면 true
    pub fn clear(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.remove(session_id).is_some()
    }

    /// 활성 세션 수
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session lock poisoned").len()
    }

    /// 활성 세션이 없는지 확인
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TTL이 지난 세션 제거
    fn cleanup_stale(&self, sessions: &mut HashMap<String, Session>) {
        let now = Instant::now();
        sessions.retain(|_, session| now.duration_since(session.last_accessed) <= self.ttl);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reuse_session() {
        let manager = SessionManager::with_default_ttl();

        let id = manager.get_or_create(None);
        manager.add_message(&id, ChatRole::User, "hello");

        let same = manager.get_or_create(Some(&id));
        assert_eq!(same, id);
        assert_eq!(manager.history(&id, 10).len(), 1);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_unknown_id_creates_session_with_that_id() {
        let manager = SessionManager::with_default_ttl();

        let id = manager.get_or_create(Some("client-chosen-id"));
        assert_eq!(id, "client-chosen-id");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_history_window_truncation() {
        let manager = SessionManager::with_default_ttl();
        let id = manager.get_or_create(None);

        for i in 0..10 {
            manager.add_message(&id, ChatRole::User, format!("question {}", i));
            manager.add_message(&id, ChatRole::Assistant, format!("answer {}", i));
        }

        // max_turns=3 → 마지막 6개 메시지
        let history = manager.history(&id, 3);
        assert_eq!(history.len(), 6);
        assert_eq!(history[0].content, "question 7");
        assert_eq!(history[5].content, "answer 9");
    }

    #[test]
    fn test_history_for_unknown_session_is_empty() {
        let manager = SessionManager::with_default_ttl();
        assert!(manager.history("missing", 10).is_empty());
    }

    #[test]
    fn test_add_message_to_missing_session_is_noop() {
        let manager = SessionManager::with_default_ttl();
        manager.add_message("missing", ChatRole::User, "hello");
        assert!(manager.is_empty());
    }

    #[test]
    fn test_clear_session() {
        let manager = SessionManager::with_default_ttl();
        let id = manager.get_or_create(None);

        assert!(manager.clear(&id));
        assert!(!manager.clear(&id));
        assert!(manager.history(&id, 10).is_empty());
    }

    #[test]
    fn test_stale_sessions_cleaned_up() {
        let manager = SessionManager::new(Duration::ZERO);

        let stale = manager.get_or_create(None);
        std::thread::sleep(Duration::from_millis(5));

        // 새 접근 시점에 TTL이 지난 세션이 제거됨
        let fresh = manager.get_or_create(None);
        assert_ne!(stale, fresh);
        assert_eq!(manager.len(), 1);
    }
}
