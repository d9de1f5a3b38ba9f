//! 평가 모듈 - RAG 품질 배치 평가
//!
//! JSON 테스트 케이스(질문 + 기대 키워드 + 기대 소스 경로)를 돌려
//! 키워드 적중률(70%)과 소스 적중률(30%)의 가중 평균으로 채점합니다.
//! 핵심 로직이 아닌 단순 매칭 스크립트입니다.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rag::{RagError, RagPipeline};

/// 키워드 적중률 가중치
const KEYWORD_WEIGHT: f32 = 0.7;
/// 소스 적중률 가중치
const SOURCE_WEIGHT: f32 = 0.3;

// ============================================================================
// Models
// ============================================================================

/// 평가 등급
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalScore {
    /// 완전하고 정확한 답변
    Excellent,
    /// 대체로 정확, 사소한 누락
    Good,
    /// 일부만 정확
    Partial,
    /// 대부분 부정확하거나 무관
    Poor,
    /// 답변 없음 또는 완전히 틀림
    Fail,
}

impl EvalScore {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalScore::Excellent => "excellent",
            EvalScore::Good => "good",
            EvalScore::Partial => "partial",
            EvalScore::Poor => "poor",
            EvalScore::Fail => "fail",
        }
    }
}

/// 평가 테스트 케이스
#[derive(Debug, Clone, Deserialize)]
pub struct EvalCase {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub expected_keywords: Vec<String>,
    #[serde(default)]
    pub expected_sources: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 단일 케이스 평가 결과
#[derive(Debug, Clone, Serialize)]
pub struct EvalResult {
    pub case_id: String,
    pub question: String,
    pub answer: String,
    pub sources: Vec<String>,
    pub keywords_found: Vec<String>,
    pub keywords_missing: Vec<String>,
    pub sources_found: Vec<String>,
    pub sources_missing: Vec<String>,
    pub keyword_score: f32,
    pub source_score: f32,
    pub overall_score: f32,
    pub evaluation: EvalScore,
}

/// 전체 평가 리포트
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub generated_at: DateTime<Utc>,
    pub total_cases: usize,
    pub average_score: f32,
    pub results: Vec<EvalResult>,
}

impl EvalReport {
    /// 결과 목록으로 리포트 생성
    pub fn from_results(results: Vec<EvalResult>) -> Self {
        let total_cases = results.len();
        let average_score = if total_cases == 0 {
            0.0
        } else {
            results.iter().map(|r| r.overall_score).sum::<f32>() / total_cases as f32
        };

        Self {
            generated_at: Utc::now(),
            total_cases,
            average_score,
            results,
        }
    }

    /// 특정 등급의 케이스 수
    pub fn level_count(&self, level: EvalScore) -> usize {
        self.results
            .iter()
            .filter(|r| r.evaluation == level)
            .count()
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// 케이스 파일 로드 (JSON 배열)
pub fn load_cases(path: &Path) -> Result<Vec<EvalCase>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read eval cases: {:?}", path))?;

    serde_json::from_str(&raw).with_context(|| format!("Failed to parse eval cases: {:?}", path))
}

/// 답변 텍스트와 소스 경로로 케이스 채점 (순수 함수)
///
/// 키워드는 대소문자 무시 부분 일치, 소스는 경로 부분 일치입니다.
/// 기대 목록이 비어 있으면 해당 축은 1.0점입니다.
pub fn score_case(case: &EvalCase, answer_text: &str, source_paths: &[String]) -> EvalResult {
    let answer_lower = answer_text.to_lowercase();

    let (keywords_found, keywords_missing): (Vec<String>, Vec<String>) = case
        .expected_keywords
        .iter()
        .cloned()
        .partition(|kw| answer_lower.contains(&kw.to_lowercase()));

    let (sources_found, sources_missing): (Vec<String>, Vec<String>) = case
        .expected_sources
        .iter()
        .cloned()
        .partition(|expected| source_paths.iter().any(|path| path.contains(expected)));

    let keyword_score = if case.expected_keywords.is_empty() {
        1.0
    } else {
        keywords_found.len() as f32 / case.expected_keywords.len() as f32
    };

    let source_score = if case.expected_sources.is_empty() {
        1.0
    } else {
        sources_found.len() as f32 / case.expected_sources.len() as f32
    };

    let overall_score = keyword_score * KEYWORD_WEIGHT + source_score * SOURCE_WEIGHT;

    EvalResult {
        case_id: case.id.clone(),
        question: case.question.clone(),
        answer: answer_text.to_string(),
        sources: source_paths.to_vec(),
        keywords_found,
        keywords_missing,
        sources_found,
        sources_missing,
        keyword_score,
        source_score,
        overall_score,
        evaluation: classify(overall_score),
    }
}

/// 종합 점수를 등급으로 변환
fn classify(score: f32) -> EvalScore {
    if score >= 0.9 {
        EvalScore::Excellent
    } else if score >= 0.7 {
        EvalScore::Good
    } else if score >= 0.5 {
        EvalScore::Partial
    } else if score >= 0.3 {
        EvalScore::Poor
    } else {
        EvalScore::Fail
    }
}

// ============================================================================
// Evaluator
// ============================================================================

/// RAG 파이프라인 평가기
pub struct Evaluator<'a> {
    rag: &'a RagPipeline,
}

impl<'a> Evaluator<'a> {
    pub fn new(rag: &'a RagPipeline) -> Self {
        Self { rag }
    }

    /// 단일 케이스 평가 (히스토리 없는 단발 질문)
    pub async fn evaluate_case(&self, case: &EvalCase) -> Result<EvalResult, RagError> {
        let answer = self.rag.ask(&case.question, &[], None).await?;

        let source_paths: Vec<String> =
            answer.sources.iter().map(|s| s.file_path.clone()).collect();

        Ok(score_case(case, &answer.text, &source_paths))
    }

    /// 전체 케이스 평가
    pub async fn evaluate_all(&self, cases: &[EvalCase]) -> Result<EvalReport, RagError> {
        let mut results = Vec::with_capacity(cases.len());

        for case in cases {
            tracing::info!("Evaluating case: {}", case.id);
            results.push(self.evaluate_case(case).await?);
        }

        Ok(EvalReport::from_results(results))
    }
}

// ============================================================================
// Tests
// ============================================================================
