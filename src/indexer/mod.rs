//! 인덱서 모듈 - 마크다운 코퍼스를 벡터 저장소에 적재
//!
//! 문서 루트에서 마크다운 파일을 수집하고 (.gitignore 존중),
//! 청킹 → 배치 임베딩 → upsert 순으로 처리합니다. 청크 ID가 콘텐츠
//! 해시이므로 같은 코퍼스를 다시 인덱싱해도 중복이 생기지 않습니다.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ignore::WalkBuilder;

use crate::chunker::MarkdownChunker;
use crate::embedding::{EmbeddingProvider, EmbeddingTask};
use crate::store::{VectorRecord, VectorStore};

// ============================================================================
// Statistics
// ============================================================================

/// 인덱싱 통계
#[derive(Debug, Default, Clone)]
pub struct IndexStats {
    /// 발견된 마크다운 파일 수
    pub files_found: usize,
    /// 청크가 하나라도 인덱싱된 파일 수
    pub files_indexed: usize,
    /// 청크가 없거나 읽기 실패로 건너뛴 파일 수
    pub files_skipped: usize,
    /// 인덱싱된 청크 수
    pub chunks_indexed: usize,
}

// ============================================================================
// File Collection
// ============================================================================

/// 문서 루트 아래의 마크다운 파일 수집
///
/// .gitignore 패턴을 존중하고 숨김 파일은 제외합니다.
/// 결과는 경로 기준으로 정렬되어 결정적입니다.
pub fn collect_markdown_files(docs_path: &Path) -> Result<Vec<PathBuf>> {
    if !docs_path.exists() {
        anyhow::bail!("Docs path does not exist: {:?}", docs_path);
    }
    if !docs_path.is_dir() {
        anyhow::bail!("Docs path is not a directory: {:?}", docs_path);
    }

    let walker = WalkBuilder::new(docs_path)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .build();

    let mut files = Vec::new();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Failed to read entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let path = entry.path();
        let is_markdown = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("md"))
            .unwrap_or(false);

        if is_markdown {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    tracing::info!("Found {} markdown files in {:?}", files.len(), docs_path);
    Ok(files)
}

// ============================================================================
// Indexing
// ============================================================================

/// 문서 디렉토리 인덱싱
///
/// 파일 단위로 청킹 → 배치 임베딩 → upsert를 수행합니다. 읽을 수 없는
/// 파일은 경고 후 건너뛰지만, 임베딩/저장 실패는 전체 실패로
/// 전파합니다 (부분 인덱스는 재실행으로 멱등 복구 가능).
pub async fn index_directory(
    docs_path: &Path,
    chunker: &MarkdownChunker,
    embedder: &dyn EmbeddingProvider,
    store: &dyn VectorStore,
) -> Result<IndexStats> {
    let files = collect_markdown_files(docs_path)?;

    let mut stats = IndexStats {
        files_found: files.len(),
        ..Default::default()
    };

    for file_path in &files {
        let chunks = match chunker.chunk_file(file_path, Some(docs_path)) {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!("Skipping unreadable file {:?}: {}", file_path, e);
                stats.files_skipped += 1;
                continue;
            }
        };

        if chunks.is_empty() {
            tracing::debug!("No chunks generated for {:?} (sections too small)", file_path);
            stats.files_skipped += 1;
            continue;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedder
            .embed_batch(&texts, EmbeddingTask::Document)
            .await
            .with_context(|| format!("Failed to embed chunks from {:?}", file_path))?;

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord::from_chunk(chunk, embedding))
            .collect();

        store
            .upsert(&records)
            .await
            .with_context(|| format!("Failed to store chunks from {:?}", file_path))?;

        tracing::info!("Indexed {:?} ({} chunks)", file_path, records.len());
        stats.files_indexed += 1;
        stats.chunks_indexed += records.len();
    }

    Ok(stats)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::store::VectorMatch;

    use super::*;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str, _task: EmbeddingTask) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    /// ID로 교체하는 인메모리 저장소
    struct RecordingStore {
        records: Mutex<Vec<VectorRecord>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                records: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VectorStore for RecordingStore {
        async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
            let mut stored = self.records.lock().unwrap();
            for record in records {
                stored.retain(|r| r.id != record.id);
                stored.push(record.clone());
            }
            Ok(records.len())
        }

        async fn query(&self, _embedding: &[f32], _top_k: usize) -> Result<Vec<VectorMatch>> {
            Ok(vec![])
        }

        async fn count(&self) -> Result<usize> {
            Ok(self.records.lock().unwrap().len())
        }

        async fn reset(&self) -> Result<()> {
            self.records.lock().unwrap().clear();
            Ok(())
        }
    }

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn test_collect_markdown_only() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.md", "# A");
        write_file(dir.path(), "nested/b.md", "# B");
        write_file(dir.path(), "notes.txt", "not markdown");
        write_file(dir.path(), "README.MD", "# upper ext");

        let files = collect_markdown_files(dir.path()).unwrap();

        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| {
            f.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("md"))
                .unwrap_or(false)
        }));
    }

    #[test]
    fn test_collect_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(collect_markdown_files(&missing).is_err());
    }

    #[tokio::test]
    async fn test_index_directory_counts() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "guide.md",
            &format!("# One\n\n{}\n\n# Two\n\n{}\n", words(20), words(20)),
        );
        // 모든 섹션이 min_chunk_size 미만인 파일은 건너뜀
        write_file(dir.path(), "stub.md", "# Tiny\n\ntoo small\n");

        let chunker = MarkdownChunker::new(5, 1000);
        let store = RecordingStore::new();

        let stats = index_directory(dir.path(), &chunker, &StubEmbedder, &store)
            .await
            .unwrap();

        assert_eq!(stats.files_found, 2);
        assert_eq!(stats.files_indexed, 1);
        assert_eq!(stats.files_skipped, 1);
        assert_eq!(stats.chunks_indexed, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "guide.md",
            &format!("# One\n\n{}\n", words(20)),
        );

        let chunker = MarkdownChunker::new(5, 1000);
        let store = RecordingStore::new();

        index_directory(dir.path(), &chunker, &StubEmbedder, &store)
            .await
            .unwrap();
        index_directory(dir.path(), &chunker, &StubEmbedder, &store)
            .await
            .unwrap();

        // 동일 콘텐츠 재인덱싱은 동일 ID upsert → 중복 없음
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_chunks_use_relative_paths() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "guides/setup.md",
            &format!("# Setup\n\n{}\n", words(20)),
        );

        let chunker = MarkdownChunker::new(5, 1000);
        let store = RecordingStore::new();

        index_directory(dir.path(), &chunker, &StubEmbedder, &store)
            .await
            .unwrap();

        let stored = store.records.lock().unwrap();
        assert_eq!(stored[0].file_path, "guides/setup.md");
    }
}
