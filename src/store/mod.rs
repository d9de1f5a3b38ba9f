//! 벡터 저장소 모듈 - 유사도 인덱스 포트
//!
//! 청크 벡터의 저장과 최근접 이웃 검색을 담당합니다.
//! 재인덱싱 시 동일 ID는 덮어쓰며 중복을 만들지 않습니다 (upsert).

use anyhow::Result;
use async_trait::async_trait;

use crate::chunker::Chunk;

mod lance;

pub use lance::LanceVectorStore;

// ============================================================================
// Types
// ============================================================================

/// 벡터 레코드 (저장용)
///
/// 청크 하나와 그 임베딩이 한 레코드입니다. ID는 청크의 콘텐츠 해시이므로
/// 같은 내용을 다시 저장하면 기존 레코드를 덮어씁니다.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// 청크 ID (콘텐츠 해시)
    pub id: String,
    /// 청크 텍스트
    pub text: String,
    /// 원본 파일 경로
    pub file_path: String,
    /// 섹션 제목
    pub section: String,
    /// 섹션 내 청크 순번
    pub chunk_index: i32,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
}

impl VectorRecord {
    /// 청크와 임베딩으로 레코드 생성
    pub fn from_chunk(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self {
            id: chunk.id,
            text: chunk.text,
            file_path: chunk.file_path,
            section: chunk.section,
            chunk_index: chunk.chunk_index as i32,
            embedding,
        }
    }
}

/// 검색 결과 (거리 오름차순)
#[derive(Debug, Clone)]
pub struct VectorMatch {
    /// 청크 텍스트
    pub text: String,
    /// 원본 파일 경로
    pub file_path: String,
    /// 섹션 제목
    pub section: String,
    /// 코사인 거리 (0에 가까울수록 유사)
    pub distance: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
///
/// 벡터 저장소의 공통 인터페이스입니다. `query`는 거리 오름차순으로
/// 정렬된 결과를 최대 `top_k`개 반환합니다.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 레코드 배치 upsert (동일 ID는 덮어쓰기)
    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize>;

    /// 최근접 이웃 검색
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<VectorMatch>>;

    /// 저장된 레코드 수
    async fn count(&self) -> Result<usize>;

    /// 저장소 초기화 (전체 삭제)
    async fn reset(&self) -> Result<()>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0을
/// 반환합니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
