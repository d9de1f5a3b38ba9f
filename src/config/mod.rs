//! 설정 모듈
//!
//! 환경변수에서 로드되는 불변 설정 스냅샷입니다.
//! 모든 파이프라인 연산은 이 스냅샷을 읽기 전용으로 사용합니다.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use url::Url;

/// 환경변수 접두사
const ENV_PREFIX: &str = "DOCS_RAG_";

/// Gemini API 기본 엔드포인트
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.docs-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docs-rag")
}

// ============================================================================
// Settings
// ============================================================================

/// 애플리케이션 설정
///
/// `Default`는 합리적인 기본값을, `from_env()`는 `DOCS_RAG_*` 환경변수
/// 오버라이드를 적용한 스냅샷을 반환합니다. 생성 이후 변경되지 않습니다.
#[derive(Debug, Clone)]
pub struct Settings {
    /// 마크다운 문서 루트 경로
    pub docs_path: PathBuf,
    /// 벡터 저장소 데이터 디렉토리
    pub data_dir: PathBuf,
    /// Gemini API 베이스 URL (호환 엔드포인트 교체 가능)
    pub api_base_url: Url,

    /// 임베딩 모델 이름
    pub embedding_model: String,
    /// 임베딩 차원 (768, 1536, 3072)
    pub embedding_dimension: usize,

    /// 답변 생성 모델 이름
    pub llm_model: String,
    /// 답변 생성 최대 토큰 수
    pub llm_max_tokens: u32,
    /// 답변 생성 온도 (낮을수록 사실 기반)
    pub llm_temperature: f32,
    /// LLM 호출 전체 타임아웃 (초)
    pub llm_timeout_secs: u64,
    /// LLM 연결 타임아웃 (초, 전체 타임아웃과 별도)
    pub llm_connect_timeout_secs: u64,

    /// 질의 재작성 최대 토큰 수 (답변 예산과 별도)
    pub rewrite_max_tokens: u32,
    /// 질의 재작성 온도
    pub rewrite_temperature: f32,
    /// 질의 재작성 활성화 여부
    pub enable_query_rewriting: bool,

    /// 대화 히스토리 최대 턴 수 (메시지 수는 2배)
    pub max_history_turns: usize,
    /// 검색 결과 수
    pub top_k: usize,

    /// 최소 청크 크기 (단어 수, 미만 섹션은 제외)
    pub min_chunk_size: usize,
    /// 섹션 크기 경고 임계값 (단어 수)
    pub max_section_size: usize,

    /// 세션 TTL (초)
    pub session_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docs_path: PathBuf::from("./docs"),
            data_dir: get_data_dir(),
            api_base_url: Url::parse(DEFAULT_BASE_URL).expect("valid default URL"),
            embedding_model: "gemini-embedding-001".to_string(),
            embedding_dimension: 768,
            llm_model: "gemini-2.0-flash".to_string(),
            llm_max_tokens: 1024,
            llm_temperature: 0.1,
            llm_timeout_secs: 300,
            llm_connect_timeout_secs: 10,
            rewrite_max_tokens: 256,
            rewrite_temperature: 0.0,
            enable_query_rewriting: true,
            max_history_turns: 10,
            top_k: 7,
            min_chunk_size: 100,
            max_section_size: 1000,
            session_ttl_secs: 3600,
        }
    }
}

impl Settings {
    /// 환경변수를 반영한 설정 로드
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Some(path) = env_string("DOCS_PATH") {
            settings.docs_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("DATA_DIR") {
            settings.data_dir = PathBuf::from(path);
        }
        if let Some(raw) = env_string("BASE_URL") {
            settings.api_base_url = Url::parse(&raw)
                .with_context(|| format!("Invalid {}BASE_URL: {}", ENV_PREFIX, raw))?;
        }

        if let Some(model) = env_string("EMBEDDING_MODEL") {
            settings.embedding_model = model;
        }
        if let Some(dim) = env_parse("EMBEDDING_DIMENSION") {
            settings.embedding_dimension = dim;
        }

        if let Some(model) = env_string("LLM_MODEL") {
            settings.llm_model = model;
        }
        if let Some(tokens) = env_parse("LLM_MAX_TOKENS") {
            settings.llm_max_tokens = tokens;
        }
        if let Some(temp) = env_parse("LLM_TEMPERATURE") {
            settings.llm_temperature = temp;
        }
        if let Some(secs) = env_parse("LLM_TIMEOUT") {
            settings.llm_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("LLM_CONNECT_TIMEOUT") {
            settings.llm_connect_timeout_secs = secs;
        }

        if let Some(tokens) = env_parse("REWRITE_MAX_TOKENS") {
            settings.rewrite_max_tokens = tokens;
        }
        if let Some(temp) = env_parse("REWRITE_TEMPERATURE") {
            settings.rewrite_temperature = temp;
        }
        if let Some(raw) = env_string("ENABLE_REWRITING") {
            settings.enable_query_rewriting = parse_bool(&raw);
        }

        if let Some(turns) = env_parse("MAX_HISTORY_TURNS") {
            settings.max_history_turns = turns;
        }
        if let Some(k) = env_parse("TOP_K") {
            settings.top_k = k;
        }
        if let Some(size) = env_parse("MIN_CHUNK_SIZE") {
            settings.min_chunk_size = size;
        }
        if let Some(size) = env_parse("MAX_SECTION_SIZE") {
            settings.max_section_size = size;
        }
        if let Some(secs) = env_parse("SESSION_TTL") {
            settings.session_ttl_secs = secs;
        }

        Ok(settings)
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.is_empty() {
            tracing::debug!("Using API key from GEMINI_API_KEY");
            return Ok(key);
        }
    }

    if let Ok(key) = std::env::var("GOOGLE_AI_API_KEY") {
        if !key.is_empty() {
            tracing::debug!("Using API key from GOOGLE_AI_API_KEY");
            return Ok(key);
        }
    }

    anyhow::bail!(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
         Get your API key at: https://aistudio.google.com/app/apikey"
    )
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"]
        .iter()
        .any(|name| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 접두사가 붙은 환경변수 읽기 (빈 값은 None)
fn env_string(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// 접두사가 붙은 환경변수를 파싱 (실패 시 경고 후 기본값 유지)
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}{}: {}", ENV_PREFIX, name, raw);
            None
        }
    }
}

/// 불리언 환경변수 파싱
fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.embedding_dimension, 768);
        assert_eq!(settings.top_k, 7);
        assert_eq!(settings.min_chunk_size, 100);
        assert_eq!(settings.max_section_size, 1000);
        assert_eq!(settings.max_history_turns, 10);
        assert!(settings.enable_query_rewriting);
        // 재작성 예산은 답변 예산보다 작아야 함
        assert!(settings.rewrite_max_tokens < settings.llm_max_tokens);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("yes"));
        assert!(parse_bool(" on "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("anything"));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("DOCS_RAG_TOP_K", "3");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.top_k, 3);
        std::env::remove_var("DOCS_RAG_TOP_K");
    }

    #[test]
    fn test_invalid_env_value_keeps_default() {
        std::env::set_var("DOCS_RAG_MIN_CHUNK_SIZE", "not-a-number");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.min_chunk_size, 100);
        std::env::remove_var("DOCS_RAG_MIN_CHUNK_SIZE");
    }

    #[test]
    fn test_default_base_url_parses() {
        let settings = Settings::default();
        assert_eq!(settings.api_base_url.scheme(), "https");
    }
}
