//! 마크다운 청커 모듈
//!
//! 마크다운 문서를 헤더 단위 섹션으로 분할하여 검색 가능한 청크로 만듭니다.
//! 섹션 전체를 하나의 청크로 유지하여 다이어그램과 설명 텍스트가
//! 분리되지 않도록 합니다.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::Settings;

/// 헤더가 없는 문서 앞부분의 암묵적 섹션 이름
const IMPLICIT_SECTION: &str = "Introduction";

/// 청크 ID에 포함되는 본문 접두 길이 (문자 수)
const ID_TEXT_PREFIX: usize = 100;

// ============================================================================
// Chunk
// ============================================================================

/// 마크다운 문서에서 추출된 검색 단위
///
/// 한 번의 인덱싱 패스에 바인딩되는 불변 레코드입니다.
/// 동일한 내용은 항상 동일한 ID를 가지므로 재인덱싱은 upsert로 덮어씁니다.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 콘텐츠 해시 기반 ID (16 hex 문자)
    pub id: String,
    /// 섹션 본문 텍스트
    pub text: String,
    /// 원본 파일 경로 (문서 루트 기준 상대 경로)
    pub file_path: String,
    /// 섹션 제목 (헤더가 없으면 "Introduction")
    pub section: String,
    /// 섹션 내 청크 순번 (섹션 원자성 정책상 항상 0)
    pub chunk_index: usize,
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 마크다운 텍스트를 청크로 분할
    fn chunk(&self, text: &str, source_path: &str) -> Vec<Chunk>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// MarkdownChunker
// ============================================================================

/// 헤더 기반 마크다운 청커
///
/// 헤더(`#` ~ `######`)마다 새 섹션을 열고, 섹션 하나를 청크 하나로
/// 내보냅니다. 단어 수가 `min_chunk_size` 미만인 섹션은 통째로 버립니다
/// (보일러플레이트 스텁 제거). `max_section_size`를 넘는 섹션은 경고만
/// 남기고 그대로 내보냅니다. 분할하면 섹션을 가로지르는 다이어그램이
/// 깨지기 때문입니다.
pub struct MarkdownChunker {
    min_chunk_size: usize,
    max_section_size: usize,
    header_re: Regex,
}

impl MarkdownChunker {
    /// 임계값을 지정하여 생성
    ///
    /// # Arguments
    /// * `min_chunk_size` - 최소 청크 크기 (단어 수)
    /// * `max_section_size` - 경고 임계값 (단어 수)
    pub fn new(min_chunk_size: usize, max_section_size: usize) -> Self {
        Self {
            min_chunk_size,
            max_section_size,
            header_re: Regex::new(r"(?m)^(#{1,6})\s+(.+)$").expect("valid header regex"),
        }
    }

    /// 설정에서 임계값을 읽어 생성
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.min_chunk_size, settings.max_section_size)
    }

    /// 기본 임계값으로 생성
    pub fn with_defaults() -> Self {
        let defaults = Settings::default();
        Self::new(defaults.min_chunk_size, defaults.max_section_size)
    }

    /// 마크다운 파일을 청크로 분할
    ///
    /// # Arguments
    /// * `file_path` - 마크다운 파일 경로
    /// * `base_path` - 메타데이터에 기록할 상대 경로의 기준 (None이면 전체 경로)
    pub fn chunk_file(&self, file_path: &Path, base_path: Option<&Path>) -> Result<Vec<Chunk>> {
        let content = std::fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read markdown file: {:?}", file_path))?;

        let relative = base_path
            .and_then(|base| file_path.strip_prefix(base).ok())
            .unwrap_or(file_path);

        Ok(self.chunk(&content, &relative.to_string_lossy()))
    }

    /// 헤더 기준으로 (섹션 제목, 본문) 쌍 추출
    ///
    /// 첫 헤더 앞의 텍스트는 "Introduction" 섹션에 속합니다.
    /// 헤더 라인 자체는 본문에 포함되지 않습니다.
    fn split_by_headers(&self, text: &str) -> Vec<(String, String)> {
        let mut sections = Vec::new();
        let mut current_header = IMPLICIT_SECTION.to_string();
        let mut last_end = 0;

        for caps in self.header_re.captures_iter(text) {
            let whole = caps.get(0).expect("capture group 0");

            let content = text[last_end..whole.start()].trim();
            if !content.is_empty() {
                sections.push((current_header.clone(), content.to_string()));
            }

            current_header = caps[2].trim().to_string();
            last_end = whole.end();
        }

        let remaining = text[last_end..].trim();
        if !remaining.is_empty() {
            sections.push((current_header, remaining.to_string()));
        }

        sections
    }

    /// 섹션 하나를 청크 하나로 변환 (크기 필터 적용)
    fn chunk_section(&self, content: &str, source_path: &str, section: &str) -> Option<Chunk> {
        let word_count = content.split_whitespace().count();

        if word_count < self.min_chunk_size {
            return None;
        }

        if word_count > self.max_section_size {
            tracing::warn!(
                "Large section detected: '{}' in {} has {} words (max recommended: {}). \
                 Consider breaking into subsections.",
                section,
                source_path,
                word_count,
                self.max_section_size,
            );
        }

        Some(Chunk {
            id: chunk_id(source_path, section, 0, content),
            text: content.to_string(),
            file_path: source_path.to_string(),
            section: section.to_string(),
            chunk_index: 0,
        })
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, text: &str, source_path: &str) -> Vec<Chunk> {
        self.split_by_headers(text)
            .into_iter()
            .filter_map(|(title, content)| self.chunk_section(&content, source_path, &title))
            .collect()
    }

    fn name(&self) -> &'static str {
        "MarkdownChunker"
    }
}

// ============================================================================
// Chunk ID
// ============================================================================

/// 위치와 내용 기반의 결정적 청크 ID 계산
///
/// `경로:섹션:순번:본문 앞 100자`의 SHA-256 앞 16 hex 문자입니다.
/// 동일 입력은 항상 동일 ID를 내므로 재인덱싱이 멱등적입니다.
fn chunk_id(source_path: &str, section: &str, index: usize, text: &str) -> String {
    let prefix: String = text.chars().take(ID_TEXT_PREFIX).collect();
    let id_source = format!("{}:{}:{}:{}", source_path, section, index, prefix);

    let digest = Sha256::digest(id_source.as_bytes());

    // 앞 8바이트 = 16 hex 문자
    let mut id = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(MarkdownChunker::with_defaults())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn test_empty_document() {
        let chunker = MarkdownChunker::new(10, 1000);
        assert!(chunker.chunk("", "test.md").is_empty());
        assert!(chunker.chunk("   \n\n  ", "test.md").is_empty());
    }

    #[test]
    fn test_headerless_document_becomes_introduction() {
        let chunker = MarkdownChunker::new(10, 1000);
        let chunks = chunker.chunk(&words(50), "test.md");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section, "Introduction");
        assert_eq!(chunks[0].file_path, "test.md");
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn test_one_chunk_per_section() {
        let chunker = MarkdownChunker::new(5, 1000);
        let text = format!(
            "# A\n\n{}\n\n## B\n\n{}\n\n## C\n\n{}\n",
            words(20),
            words(20),
            words(20)
        );

        let chunks = chunker.chunk(&text, "doc.md");

        assert_eq!(chunks.len(), 3);
        let sections: Vec<&str> = chunks.iter().map(|c| c.section.as_str()).collect();
        assert_eq!(sections, vec!["A", "B", "C"]);
        assert!(chunks.iter().all(|c| c.chunk_index == 0));
    }

    #[test]
    fn test_small_sections_dropped_entirely() {
        let chunker = MarkdownChunker::new(100, 1000);
        // 5단어 섹션은 min_chunk_size=100 기준으로 완전히 제외됨
        let chunks = chunker.chunk("# Stub\n\nJust a few words here.", "doc.md");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_mixed_sizes_filtering() {
        let chunker = MarkdownChunker::new(100, 1000);
        let text = format!(
            "# Intro\n\n{}\n\n# Setup\n\n{}\n\n# FAQ\n\n{}\n",
            words(150),
            words(120),
            words(40)
        );

        let chunks = chunker.chunk(&text, "guide.md");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].section, "Intro");
        assert_eq!(chunks[1].section, "Setup");
    }

    #[test]
    fn test_oversized_section_still_single_chunk() {
        let chunker = MarkdownChunker::new(5, 50);
        let text = format!("# Big Section\n\n{}", words(200));

        // 경고만 남기고 분할하지 않음
        let chunks = chunker.chunk(&text, "big.md");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section, "Big Section");
    }

    #[test]
    fn test_chunk_ids_deterministic() {
        let chunker = MarkdownChunker::new(5, 1000);
        let text = format!("# One\n\n{}\n\n# Two\n\n{}", words(30), words(31));

        let first = chunker.chunk(&text, "doc.md");
        let second = chunker.chunk(&text, "doc.md");

        assert_eq!(first, second);
        assert!(first.iter().all(|c| c.id.len() == 16));
    }

    #[test]
    fn test_chunk_ids_unique_across_sections() {
        let chunker = MarkdownChunker::new(3, 1000);
        let text = "# One\n\ncontent for section one\n\n# Two\n\ncontent for section two\n";

        let chunks = chunker.chunk(text, "doc.md");

        assert_eq!(chunks.len(), 2);
        assert_ne!(chunks[0].id, chunks[1].id);
    }

    #[test]
    fn test_chunk_ids_differ_by_path() {
        assert_ne!(
            chunk_id("a.md", "Intro", 0, "same text"),
            chunk_id("b.md", "Intro", 0, "same text")
        );
    }

    #[test]
    fn test_id_prefix_is_char_based() {
        // 멀티바이트 문자가 100자 경계에 걸려도 패닉 없이 동작해야 함
        let text = "한".repeat(150);
        let id = chunk_id("doc.md", "Intro", 0, &text);
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn test_header_line_excluded_from_content() {
        let chunker = MarkdownChunker::new(3, 1000);
        let chunks = chunker.chunk("# Title Here\n\nbody text with words\n", "doc.md");

        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].text.contains("Title Here"));
    }

    #[test]
    fn test_chunk_file_relative_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let sub = dir.path().join("guides");
        std::fs::create_dir_all(&sub).unwrap();
        let file = sub.join("setup.md");
        std::fs::write(&file, format!("# Setup\n\n{}", words(20))).unwrap();

        let chunker = MarkdownChunker::new(5, 1000);
        let chunks = chunker.chunk_file(&file, Some(dir.path())).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].file_path, "guides/setup.md");
    }
}
